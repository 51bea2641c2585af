//! Vendor backend contract.
//!
//! VT-d and AMD-Vi drivers encode page-table entries themselves; this crate
//! only drives them through [`IommuOps`].

use bitflags::bitflags;

use crate::domain::DomainIommu;
use crate::IommuResult;

bitflags! {
    /// Per-mapping permission and behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IommuFlags: u32 {
        /// Device may read.
        const READABLE = 1 << 0;
        /// Device may write.
        const WRITABLE = 1 << 1;
        /// Backend may return early with partial progress.
        const PREEMPT = 1 << 2;
    }
}

bitflags! {
    /// Flushes a backend owes after a batch of mapping changes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FlushFlags: u32 {
        /// A present entry was added.
        const ADDED = 1 << 0;
        /// A present entry was changed or removed.
        const MODIFIED = 1 << 1;
        /// An intermediate table was unlinked.
        const ALL = 1 << 2;
    }
}

/// Outcome of one [`IommuOps::map_pages`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapProgress {
    /// Every requested frame is mapped.
    Done,
    /// The first `n` frames are mapped; the caller resumes with the rest.
    Partial(u64),
}

/// Operations a vendor backend provides.
pub trait IommuOps: Sync {
    /// Detach the domain's root table from the hardware context.
    fn clear_root_pgtable(&self, hd: &DomainIommu);

    /// Map `count` frames starting at `dfn` to `mfn`.
    ///
    /// With [`IommuFlags::PREEMPT`] set the backend may stop early and report
    /// [`MapProgress::Partial`]. Required flushes are accumulated into
    /// `flush`.
    fn map_pages(
        &self,
        hd: &DomainIommu,
        dfn: u64,
        mfn: u64,
        count: u64,
        flags: IommuFlags,
        flush: &mut FlushFlags,
    ) -> IommuResult<MapProgress>;

    /// Flush the whole IOTLB of the domain.
    fn iotlb_flush_all(&self, hd: &DomainIommu, flush: FlushFlags) -> IommuResult<()>;
}
