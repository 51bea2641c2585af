//! Recording collaborators for unit tests.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;
use x86_64::structures::paging::{PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use crate::domain::DomainIommu;
use crate::hwdom::{MemoryMap, RamType};
use crate::identity::{IdentityP2m, P2mAccess};
use crate::ops::{FlushFlags, IommuFlags, IommuOps, MapProgress};
use crate::page::PTES_PER_PAGE;
use crate::platform::{CpuId, NodeId, Platform};
use crate::{IommuError, IommuResult};

// ============================================================================
// Event Log
// ============================================================================

/// Teardown step seen by a mock collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockEvent {
    ClearRoot,
    Free(PhysFrame),
}

/// Ordered record shared between a [`MockPlatform`] and a [`MockOps`].
pub type EventLog = Arc<Mutex<Vec<MockEvent>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(log: &Option<EventLog>, event: MockEvent) {
    if let Some(log) = log {
        log.lock().push(event);
    }
}

// ============================================================================
// Platform
// ============================================================================

/// Host allocator backed by heap arrays, with hooks recorded.
pub struct MockPlatform {
    next_frame: AtomicUsize,
    pages: Mutex<BTreeMap<u64, Box<[u64; PTES_PER_PAGE]>>>,
    freed: Mutex<Vec<PhysFrame>>,
    page_limit: Mutex<Option<usize>>,
    poison: AtomicBool,
    last_node: Mutex<Option<Option<NodeId>>>,
    synced: AtomicUsize,
    preempt: AtomicBool,
    cpu: AtomicUsize,
    softirqs: AtomicUsize,
    raised: Mutex<Vec<CpuId>>,
    events: Option<EventLog>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            // Frame numbers start at 1 MiB.
            next_frame: AtomicUsize::new(0x100),
            pages: Mutex::new(BTreeMap::new()),
            freed: Mutex::new(Vec::new()),
            page_limit: Mutex::new(None),
            poison: AtomicBool::new(false),
            last_node: Mutex::new(None),
            synced: AtomicUsize::new(0),
            preempt: AtomicBool::new(false),
            cpu: AtomicUsize::new(0),
            softirqs: AtomicUsize::new(0),
            raised: Mutex::new(Vec::new()),
            events: None,
        }
    }

    /// Record every freed frame into `log`.
    pub fn with_events(mut self, log: EventLog) -> Self {
        self.events = Some(log);
        self
    }

    /// Fill new pages with garbage instead of zeroes.
    pub fn poison_new_pages(&self, poison: bool) {
        self.poison.store(poison, Ordering::Relaxed);
    }

    /// Fail allocations once `limit` pages are live.
    pub fn set_page_limit(&self, limit: Option<usize>) {
        *self.page_limit.lock() = limit;
    }

    pub fn set_preempt(&self, preempt: bool) {
        self.preempt.store(preempt, Ordering::Relaxed);
    }

    pub fn set_current_cpu(&self, cpu: CpuId) {
        self.cpu.store(cpu, Ordering::Relaxed);
    }

    /// Copy of a live page.
    pub fn page(&self, frame: PhysFrame) -> Box<[u64; PTES_PER_PAGE]> {
        self.pages
            .lock()
            .get(&frame.start_address().as_u64())
            .cloned()
            .expect("page not allocated")
    }

    /// Pages handed out so far, freed or not.
    pub fn allocated(&self) -> usize {
        self.next_frame.load(Ordering::Relaxed) - 0x100
    }

    /// Frames returned so far, in order.
    pub fn freed(&self) -> Vec<PhysFrame> {
        self.freed.lock().clone()
    }

    pub fn synced(&self) -> usize {
        self.synced.load(Ordering::Relaxed)
    }

    pub fn last_node(&self) -> Option<Option<NodeId>> {
        *self.last_node.lock()
    }

    pub fn softirqs(&self) -> usize {
        self.softirqs.load(Ordering::Relaxed)
    }

    /// CPUs whose tasklet softirq was raised, in order.
    pub fn raised(&self) -> Vec<CpuId> {
        self.raised.lock().clone()
    }
}

impl Platform for MockPlatform {
    fn alloc_page(&self, node: Option<NodeId>) -> Option<PhysFrame> {
        *self.last_node.lock() = Some(node);

        let mut pages = self.pages.lock();
        if let Some(limit) = *self.page_limit.lock() {
            if pages.len() >= limit {
                return None;
            }
        }

        let pfn = self.next_frame.fetch_add(1, Ordering::Relaxed) as u64;
        let addr = pfn << 12;
        let fill = if self.poison.load(Ordering::Relaxed) {
            0xdead_beef_dead_beef
        } else {
            0
        };
        pages.insert(addr, Box::new([fill; PTES_PER_PAGE]));

        Some(PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(addr)))
    }

    fn free_page(&self, frame: PhysFrame) {
        let removed = self.pages.lock().remove(&frame.start_address().as_u64());
        assert!(removed.is_some(), "double free of {:?}", frame);
        self.freed.lock().push(frame);
        record(&self.events, MockEvent::Free(frame));
    }

    fn with_mapped_page(&self, frame: PhysFrame, f: &mut dyn FnMut(&mut [u64; PTES_PER_PAGE])) {
        let mut pages = self.pages.lock();
        let page = pages
            .get_mut(&frame.start_address().as_u64())
            .expect("mapping unallocated page");
        f(page);
    }

    fn sync_cache(&self, _frame: PhysFrame) {
        self.synced.fetch_add(1, Ordering::Relaxed);
    }

    fn current_cpu(&self) -> CpuId {
        self.cpu.load(Ordering::Relaxed)
    }

    fn preempt_check(&self) -> bool {
        self.preempt.load(Ordering::Relaxed)
    }

    fn process_pending_softirqs(&self) {
        self.softirqs.fetch_add(1, Ordering::Relaxed);
    }

    fn raise_tasklet_softirq(&self, cpu: CpuId) {
        self.raised.lock().push(cpu);
    }
}

// ============================================================================
// Backend
// ============================================================================

/// One recorded `map_pages` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapCall {
    pub dfn: u64,
    pub mfn: u64,
    pub count: u64,
    pub flags: IommuFlags,
}

impl MapCall {
    /// Identity call of `count` frames at `dfn`.
    pub fn new(dfn: u64, count: u64, flags: IommuFlags) -> Self {
        Self {
            dfn,
            mfn: dfn,
            count,
            flags,
        }
    }
}

pub struct MockOps {
    root_clears: AtomicUsize,
    map_calls: Mutex<Vec<MapCall>>,
    flushes: Mutex<Vec<FlushFlags>>,
    max_per_call: Mutex<Option<u64>>,
    fail_dfn: Mutex<Option<u64>>,
    events: Option<EventLog>,
}

impl MockOps {
    pub fn new() -> Self {
        Self {
            root_clears: AtomicUsize::new(0),
            map_calls: Mutex::new(Vec::new()),
            flushes: Mutex::new(Vec::new()),
            max_per_call: Mutex::new(None),
            fail_dfn: Mutex::new(None),
            events: None,
        }
    }

    /// Record root detaches into `log`.
    pub fn with_events(mut self, log: EventLog) -> Self {
        self.events = Some(log);
        self
    }

    /// Map at most `max` frames per preemptible call.
    pub fn set_max_per_call(&self, max: Option<u64>) {
        *self.max_per_call.lock() = max;
    }

    /// Fail calls starting at `dfn`.
    pub fn fail_at(&self, dfn: u64) {
        *self.fail_dfn.lock() = Some(dfn);
    }

    pub fn root_clears(&self) -> usize {
        self.root_clears.load(Ordering::Relaxed)
    }

    pub fn map_calls(&self) -> Vec<MapCall> {
        self.map_calls.lock().clone()
    }

    pub fn flushes(&self) -> Vec<FlushFlags> {
        self.flushes.lock().clone()
    }
}

impl IommuOps for MockOps {
    fn clear_root_pgtable(&self, _hd: &DomainIommu) {
        self.root_clears.fetch_add(1, Ordering::Relaxed);
        record(&self.events, MockEvent::ClearRoot);
    }

    fn map_pages(
        &self,
        _hd: &DomainIommu,
        dfn: u64,
        mfn: u64,
        count: u64,
        flags: IommuFlags,
        flush: &mut FlushFlags,
    ) -> IommuResult<MapProgress> {
        self.map_calls.lock().push(MapCall {
            dfn,
            mfn,
            count,
            flags,
        });

        if *self.fail_dfn.lock() == Some(dfn) {
            return Err(IommuError::MappingFailed);
        }

        *flush |= FlushFlags::ADDED;
        match *self.max_per_call.lock() {
            Some(max) if flags.contains(IommuFlags::PREEMPT) && count > max => {
                Ok(MapProgress::Partial(max))
            }
            _ => Ok(MapProgress::Done),
        }
    }

    fn iotlb_flush_all(&self, _hd: &DomainIommu, flush: FlushFlags) -> IommuResult<()> {
        self.flushes.lock().push(flush);
        Ok(())
    }
}

// ============================================================================
// P2M
// ============================================================================

/// One recorded P2M call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P2mCall {
    Set(u64, P2mAccess),
    Clear(u64),
    Add(u64, P2mAccess),
}

pub struct MockP2m {
    calls: Mutex<Vec<P2mCall>>,
    mapped: Mutex<BTreeSet<u64>>,
    fail_set: Mutex<Option<u64>>,
    fail_clear: Mutex<Option<u64>>,
}

impl MockP2m {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            mapped: Mutex::new(BTreeSet::new()),
            fail_set: Mutex::new(None),
            fail_clear: Mutex::new(None),
        }
    }

    pub fn fail_set_at(&self, pfn: u64) {
        *self.fail_set.lock() = Some(pfn);
    }

    pub fn fail_clear_at(&self, pfn: u64) {
        *self.fail_clear.lock() = Some(pfn);
    }

    pub fn calls(&self) -> Vec<P2mCall> {
        self.calls.lock().clone()
    }

    /// Frames currently mapped 1:1, ascending.
    pub fn mapped(&self) -> Vec<u64> {
        self.mapped.lock().iter().copied().collect()
    }
}

impl IdentityP2m for MockP2m {
    fn set_identity_entry(
        &self,
        _hd: &DomainIommu,
        pfn: u64,
        access: P2mAccess,
        _flag: u32,
    ) -> IommuResult<()> {
        self.calls.lock().push(P2mCall::Set(pfn, access));
        if *self.fail_set.lock() == Some(pfn) {
            return Err(IommuError::MappingFailed);
        }
        self.mapped.lock().insert(pfn);
        Ok(())
    }

    fn clear_identity_entry(&self, _hd: &DomainIommu, pfn: u64) -> IommuResult<()> {
        self.calls.lock().push(P2mCall::Clear(pfn));
        if *self.fail_clear.lock() == Some(pfn) {
            return Err(IommuError::MappingFailed);
        }
        self.mapped.lock().remove(&pfn);
        Ok(())
    }

    fn add_identity_entry(&self, _hd: &DomainIommu, pfn: u64, access: P2mAccess) -> IommuResult<()> {
        self.calls.lock().push(P2mCall::Add(pfn, access));
        self.mapped.lock().insert(pfn);
        Ok(())
    }
}

// ============================================================================
// Memory Map
// ============================================================================

/// Host memory map built from frame ranges. Unlisted frames are holes.
pub struct MockMemoryMap {
    ranges: Vec<(Range<u64>, RamType)>,
    valid_below: u64,
    hypervisor: Range<u64>,
    mmio_ro: BTreeSet<u64>,
    iomem_permitted: bool,
    mmcfg: Range<u64>,
}

impl MockMemoryMap {
    pub fn new() -> Self {
        Self {
            ranges: Vec::new(),
            valid_below: u64::MAX,
            hypervisor: 0..0,
            mmio_ro: BTreeSet::new(),
            iomem_permitted: true,
            mmcfg: 0..0,
        }
    }

    pub fn with_range(mut self, pfns: Range<u64>, ty: RamType) -> Self {
        self.ranges.push((pfns, ty));
        self
    }

    pub fn with_valid_below(mut self, pfn: u64) -> Self {
        self.valid_below = pfn;
        self
    }

    pub fn with_hypervisor(mut self, pfns: Range<u64>) -> Self {
        self.hypervisor = pfns;
        self
    }

    pub fn with_mmio_ro(mut self, pfn: u64) -> Self {
        self.mmio_ro.insert(pfn);
        self
    }

    pub fn with_iomem_denied(mut self) -> Self {
        self.iomem_permitted = false;
        self
    }

    /// MMCFG window as a physical address range.
    pub fn with_mmcfg(mut self, paddrs: Range<u64>) -> Self {
        self.mmcfg = paddrs;
        self
    }
}

impl MemoryMap for MockMemoryMap {
    fn mfn_valid(&self, pfn: u64) -> bool {
        pfn < self.valid_below
    }

    fn ram_type(&self, pfn: u64) -> RamType {
        self.ranges
            .iter()
            .filter(|(r, _)| r.contains(&pfn))
            .fold(RamType::empty(), |acc, (_, ty)| acc | *ty)
    }

    fn hypervisor_in_range(&self, pfn: u64) -> bool {
        self.hypervisor.contains(&pfn)
    }

    fn iomem_access_permitted(&self, _pfn: u64) -> bool {
        self.iomem_permitted
    }

    fn mmio_ro(&self, pfn: u64) -> bool {
        self.mmio_ro.contains(&pfn)
    }

    fn is_mmcfg_address(&self, paddr: u64) -> bool {
        self.mmcfg.contains(&paddr)
    }
}
