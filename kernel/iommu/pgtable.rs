//! Page-Table Memory Pool
//!
//! Each domain owns the pages of its device-facing page tables. Backends
//! allocate tables through [`DomainIommu::alloc_pgtable`] and only ever hold
//! a [`PageHandle`]; the [`PgTablePage`] token stays in the pool until the
//! table is unlinked (see [`crate::reclaim`]) or the domain is torn down by
//! [`DomainIommu::free_pgtables`].

use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::contig::init_contig_markers;
use crate::domain::DomainIommu;
use crate::ops::IommuOps;
use crate::page::{PageHandle, PgTablePage, PTES_PER_PAGE};
use crate::platform::Platform;
use crate::{IommuError, IommuResult};

/// Pages freed between preemption checks during teardown.
const FREE_BATCH: usize = 256;

// ============================================================================
// Pool
// ============================================================================

/// Table pages owned by one domain.
///
/// The lock covers list linkage only and is never held across a page
/// allocation or a backend call.
pub struct PgTablePool {
    list: Mutex<BTreeMap<u64, PgTablePage>>,
}

impl PgTablePool {
    pub(crate) const fn new() -> Self {
        Self {
            list: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of pages in the pool.
    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    /// Whether `page` belongs to this pool.
    pub fn contains(&self, page: PageHandle) -> bool {
        self.list.lock().contains_key(&page.key())
    }

    pub(crate) fn insert(&self, page: PgTablePage) {
        let key = page.handle().key();
        let prev = self.list.lock().insert(key, page);
        debug_assert!(prev.is_none(), "frame {:#x} linked twice", key);
    }

    /// Unlink `page`, handing its token to the caller.
    pub(crate) fn take(&self, page: PageHandle) -> Option<PgTablePage> {
        self.list.lock().remove(&page.key())
    }

    pub(crate) fn pop_head(&self) -> Option<PgTablePage> {
        self.list.lock().pop_first().map(|(_, page)| page)
    }
}

// ============================================================================
// Allocation / Teardown
// ============================================================================

impl DomainIommu {
    /// Allocate one table page for the domain.
    ///
    /// With a non-zero `contig_mask` the page is pre-filled with contiguity
    /// markers, otherwise it is zeroed. The page is written back from
    /// non-coherent caches before it is linked into the pool.
    ///
    /// A domain without IOMMU support has no tables; the request fails with
    /// [`IommuError::Unsupported`].
    pub fn alloc_pgtable(
        &self,
        platform: &dyn Platform,
        contig_mask: u64,
    ) -> IommuResult<PageHandle> {
        if !self.is_enabled() {
            return Err(IommuError::Unsupported);
        }

        let frame = platform
            .alloc_page(self.node())
            .ok_or(IommuError::NoMemory)?;

        platform.with_mapped_page(frame, &mut |table: &mut [u64; PTES_PER_PAGE]| {
            if contig_mask != 0 {
                init_contig_markers(table, contig_mask);
            } else {
                table.fill(0);
            }
        });
        platform.sync_cache(frame);

        let page = PgTablePage::new(frame);
        let handle = page.handle();
        self.pgtables.insert(page);

        Ok(handle)
    }

    /// Free every table page of the domain.
    ///
    /// Only valid at domain teardown, once no new mapping can be installed.
    /// Detaches the root table first, then frees pool pages one by one. After
    /// every 256 pages a pending preemption request makes the call return
    /// [`IommuError::Retry`]; the caller invokes it again to continue.
    pub fn free_pgtables(&self, ops: &dyn IommuOps, platform: &dyn Platform) -> IommuResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        // Let a mapper that got in before teardown finish.
        self.spin_barrier();

        // Nothing may walk from the root into pages about to be freed.
        ops.clear_root_pgtable(self);

        let mut done = 0usize;
        while let Some(page) = self.pgtables.pop_head() {
            page.free(platform);
            done += 1;
            if done % FREE_BATCH == 0 && platform.preempt_check() {
                return Err(IommuError::Retry);
            }
        }

        Ok(())
    }
}
