//! Deferred Reclamation Queue
//!
//! When a backend merges a run of leaf entries into a superpage, the
//! intermediate table it unlinks may still be cached by the IOMMU until the
//! IOTLB flush that follows. Such pages are queued on the current CPU's list
//! and freed later by that CPU's tasklet. The tasklet only runs from softirq
//! context, which is entered after the mapping operation (and its flush) has
//! returned, so a queued page never reaches the allocator ahead of the flush.
//!
//! # Per-CPU Slots
//!
//! ```text
//!  CPU0 slot            CPU1 slot            CPU2 slot (going down)
//! +-----------+        +-----------+        +-----------+
//! | list      |        | list      |        | list      |--+
//! | tasklet   |        | tasklet   |        | tasklet X |  | Dead: spliced
//! +-----------+        +-----------+        +-----------+  | onto the CPU
//!       ^                                                  | running the
//!       +--------------------------------------------------+ notifier
//! ```
//!
//! A slot's list is touched by its own CPU, except during the CPU-offline
//! hand-off, which the hot-plug machinery serializes. The per-slot lock is
//! therefore uncontended.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

use crate::config::IommuConfig;
use crate::domain::DomainIommu;
use crate::page::{PageHandle, PgTablePage};
use crate::platform::{CpuId, Platform};
use crate::{IommuError, IommuResult};

/// Pages freed between softirq processing in the tasklet.
const SOFTIRQ_BATCH: usize = 512;

// ============================================================================
// CPU Notifications
// ============================================================================

/// CPU state transitions delivered by the hot-plug machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuAction {
    /// The CPU is about to come online.
    UpPrepare,
    /// The CPU is about to go offline.
    DownPrepare,
    /// A pending offline was cancelled.
    DownFailed,
    /// The CPU is offline and will run nothing further.
    Dead,
}

// ============================================================================
// Tasklet State
// ============================================================================

/// Tasklet not bound; scheduling requests are ignored.
const TASKLET_DEAD: u8 = 0;
/// Bound and idle.
const TASKLET_IDLE: u8 = 1;
/// Waiting for the next softirq pass.
const TASKLET_SCHEDULED: u8 = 2;
/// Currently freeing pages.
const TASKLET_RUNNING: u8 = 3;

struct CpuSlot {
    list: Mutex<VecDeque<PgTablePage>>,
    tasklet: AtomicU8,
}

impl CpuSlot {
    fn new() -> Self {
        Self {
            list: Mutex::new(VecDeque::new()),
            tasklet: AtomicU8::new(TASKLET_DEAD),
        }
    }
}

// ============================================================================
// Queues
// ============================================================================

/// Per-CPU deferred free lists and their tasklets.
pub struct PgtFreeQueues {
    slots: Vec<CpuSlot>,
}

impl PgtFreeQueues {
    /// Create slots for `nr_cpus` CPUs. No tasklet is bound yet.
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            slots: (0..nr_cpus).map(|_| CpuSlot::new()).collect(),
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, cpu: CpuId) -> Option<&CpuSlot> {
        self.slots.get(cpu)
    }

    /// Bind the boot CPU's slot when IOMMU support is enabled.
    ///
    /// Returns whether the slot was bound. Further CPUs are bound through
    /// [`PgtFreeQueues::cpu_callback`].
    pub fn bsp_init(&self, config: &IommuConfig, platform: &dyn Platform) -> bool {
        if !config.enable {
            return false;
        }
        self.cpu_callback(CpuAction::UpPrepare, platform.current_cpu(), platform);
        true
    }

    /// Pages waiting on `cpu`'s list. Zero for a CPU without a slot.
    pub fn pending(&self, cpu: CpuId) -> usize {
        self.slot(cpu).map_or(0, |slot| slot.list.lock().len())
    }

    /// Whether `cpu`'s tasklet waits to run.
    pub fn is_scheduled(&self, cpu: CpuId) -> bool {
        self.slot(cpu)
            .is_some_and(|slot| slot.tasklet.load(Ordering::Acquire) == TASKLET_SCHEDULED)
    }

    /// Unlink a table page from `hd`'s pool and free it once the current
    /// CPU's tasklet runs.
    ///
    /// The caller must already have issued (or be about to return into) the
    /// IOTLB flush covering the unlinked table.
    ///
    /// A CPU without a slot gets [`IommuError::NotFound`] and the page stays
    /// in the pool.
    pub fn queue_free_pgtable(
        &self,
        hd: &DomainIommu,
        page: PageHandle,
        platform: &dyn Platform,
    ) -> IommuResult<()> {
        let cpu = platform.current_cpu();
        let Some(slot) = self.slot(cpu) else {
            klog!(Error, "CPU{}: no reclamation slot, d{} table page kept", cpu, hd.id());
            return Err(IommuError::NotFound);
        };

        let page = match hd.pgtables.take(page) {
            Some(page) => page,
            None => {
                klog!(
                    Error,
                    "d{}: table page {:#x} not owned by the domain",
                    hd.id(),
                    page.start_address().as_u64()
                );
                return Err(IommuError::NotFound);
            }
        };

        slot.list.lock().push_back(page);
        self.schedule(cpu, platform);
        Ok(())
    }

    /// Run the current CPU's tasklet if it is scheduled.
    ///
    /// Called from the softirq path only. Returns the number of pages freed.
    pub fn do_tasklet(&self, platform: &dyn Platform) -> usize {
        let cpu = platform.current_cpu();
        let Some(slot) = self.slot(cpu) else {
            klog!(Error, "CPU{}: tasklet run without a reclamation slot", cpu);
            return 0;
        };

        if slot
            .tasklet
            .compare_exchange(TASKLET_SCHEDULED, TASKLET_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }

        let done = Self::free_queued_pgtables(slot, platform);

        // A kill during the run leaves the tasklet dead.
        if slot
            .tasklet
            .compare_exchange(TASKLET_RUNNING, TASKLET_IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && !slot.list.lock().is_empty()
        {
            self.schedule(cpu, platform);
        }

        done
    }

    /// Tasklet body: drain `slot`'s list back to the allocator.
    fn free_queued_pgtables(slot: &CpuSlot, platform: &dyn Platform) -> usize {
        let mut done = 0usize;
        loop {
            // Don't hold the list lock across the free.
            let page = slot.list.lock().pop_front();
            let Some(page) = page else {
                break;
            };
            page.free(platform);
            done += 1;
            if done % SOFTIRQ_BATCH == 0 {
                platform.process_pending_softirqs();
            }
        }
        done
    }

    /// React to a CPU state transition of `cpu`.
    pub fn cpu_callback(&self, action: CpuAction, cpu: CpuId, platform: &dyn Platform) {
        if cpu >= self.slots.len() {
            klog!(Error, "CPU{}: no reclamation slot for {:?}", cpu, action);
            return;
        }

        match action {
            CpuAction::DownPrepare => self.kill(cpu),
            CpuAction::Dead => self.hand_off(cpu, platform),
            CpuAction::UpPrepare => {
                let stale = self.pending(cpu);
                if stale != 0 {
                    klog!(Warn, "CPU{}: {} page tables still queued at bring-up", cpu, stale);
                }
                self.bind(cpu, platform);
            }
            CpuAction::DownFailed => self.bind(cpu, platform),
        }
    }

    /// Move a dead CPU's pages to the CPU running the notifier.
    fn hand_off(&self, dead: CpuId, platform: &dyn Platform) {
        let this = platform.current_cpu();
        if this == dead {
            return;
        }

        let (Some(from), Some(to)) = (self.slot(dead), self.slot(this)) else {
            klog!(Error, "CPU{}: cannot hand queued page tables to CPU{}", dead, this);
            return;
        };

        let pages = core::mem::take(&mut *from.list.lock());
        if pages.is_empty() {
            return;
        }

        klog!(Debug, "CPU{}: {} queued page tables handed to CPU{}", dead, pages.len(), this);
        to.list.lock().extend(pages);
        self.schedule(this, platform);
    }

    /// (Re)bind `cpu`'s tasklet and kick it if pages are waiting.
    fn bind(&self, cpu: CpuId, platform: &dyn Platform) {
        let Some(slot) = self.slot(cpu) else {
            return;
        };
        slot.tasklet.store(TASKLET_IDLE, Ordering::Release);
        if !slot.list.lock().is_empty() {
            self.schedule(cpu, platform);
        }
    }

    /// Unbind `cpu`'s tasklet, waiting out a run in progress.
    fn kill(&self, cpu: CpuId) {
        let Some(slot) = self.slot(cpu) else {
            return;
        };
        let tasklet = &slot.tasklet;
        loop {
            let state = tasklet.load(Ordering::Acquire);
            if state == TASKLET_RUNNING {
                spin_loop();
                continue;
            }
            if tasklet
                .compare_exchange(state, TASKLET_DEAD, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Mark `cpu`'s tasklet scheduled unless it is dead or already pending.
    fn schedule(&self, cpu: CpuId, platform: &dyn Platform) {
        let Some(slot) = self.slot(cpu) else {
            return;
        };
        if slot
            .tasklet
            .compare_exchange(TASKLET_IDLE, TASKLET_SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            platform.raise_tasklet_softirq(cpu);
        }
    }
}
