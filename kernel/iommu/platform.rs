//! Host services consumed by the IOMMU core.
//!
//! The hypervisor supplies one [`Platform`] implementation wrapping its
//! domain-heap allocator, the direct map, cache maintenance and the softirq /
//! preemption machinery. Everything in this crate that allocates, frees or
//! bounds its latency goes through it.

use x86_64::structures::paging::PhysFrame;

use crate::page::PTES_PER_PAGE;

/// Logical CPU index (0 = boot CPU).
pub type CpuId = usize;

/// NUMA node identifier.
pub type NodeId = u8;

/// Services the host provides to the IOMMU core.
pub trait Platform: Sync {
    /// Allocate one 4 KiB domain-heap page, preferring `node` when given.
    ///
    /// The content of the returned frame is unspecified.
    fn alloc_page(&self, node: Option<NodeId>) -> Option<PhysFrame>;

    /// Return a page to the domain heap.
    fn free_page(&self, frame: PhysFrame);

    /// Run `f` on a temporary hypervisor mapping of `frame`.
    fn with_mapped_page(&self, frame: PhysFrame, f: &mut dyn FnMut(&mut [u64; PTES_PER_PAGE]));

    /// Write `frame` back from CPU caches the remapping hardware does not
    /// snoop. No-op on coherent systems.
    fn sync_cache(&self, frame: PhysFrame);

    /// Index of the CPU executing the caller.
    fn current_cpu(&self) -> CpuId;

    /// Whether the caller should stop and let pending work run.
    fn preempt_check(&self) -> bool;

    /// Run pending softirqs (including tasklets) before continuing.
    fn process_pending_softirqs(&self);

    /// Ask `cpu` to run its tasklet softirq soon.
    fn raise_tasklet_softirq(&self, _cpu: CpuId) {}
}
