//! Per-domain IOMMU state
//!
//! Every domain with device-facing address translation owns one
//! [`DomainIommu`]. It bundles the locks and containers the generic layer
//! manages on the domain's behalf:
//!
//! - `mapping_lock`: held by the backend while it edits the tables.
//! - the page-table pool: every table page currently linked into the
//!   domain's hierarchy (see [`crate::pgtable`]).
//! - the identity-map registry, reachable only under the device-operations
//!   lock (see [`crate::identity`]).
//!
//! # Lifecycle
//!
//! ```text
//! DomainIommu::new ──> alloc_pgtable / queue_free_pgtable ... ──> free_pgtables
//!                                                                  (until Ok)
//!                                                                      │
//!                                                       DomainIommu::destroy
//! ```

use bitflags::bitflags;
use spin::Mutex;

use crate::identity::IdentityMaps;
use crate::pcidevs::PcidevsCell;
use crate::pgtable::PgTablePool;
use crate::platform::NodeId;

// ============================================================================
// Types
// ============================================================================

/// Domain identifier type.
pub type DomainId = u16;

bitflags! {
    /// Domain properties that bear on whether devices may be assigned.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DomainFeatures: u32 {
        /// The I/O pseudo-domain that owns quarantined devices.
        const IO_PSEUDO = 1 << 0;
        /// Memory sharing is enabled.
        const MEM_SHARING = 1 << 1;
        /// A memory-paging ring is attached.
        const MEM_PAGING = 1 << 2;
        /// Populate-on-demand entries are outstanding.
        const POD_ACTIVE = 1 << 3;
        /// Global log-dirty tracking is active.
        const GLOBAL_LOGDIRTY = 1 << 4;
    }
}

/// Whether a domain with `features` may have devices assigned.
///
/// Paging, sharing and populate-on-demand change the P2M behind the
/// hardware's back, so they exclude passthrough. The I/O pseudo-domain is
/// always permitted.
pub fn iommu_use_permitted(features: DomainFeatures) -> bool {
    features.contains(DomainFeatures::IO_PSEUDO)
        || !features.intersects(
            DomainFeatures::MEM_SHARING
                | DomainFeatures::MEM_PAGING
                | DomainFeatures::POD_ACTIVE
                | DomainFeatures::GLOBAL_LOGDIRTY,
        )
}

// ============================================================================
// Domain State
// ============================================================================

/// IOMMU state of one domain.
pub struct DomainIommu {
    /// Owning domain.
    id: DomainId,

    /// Preferred NUMA node for table pages.
    node: Option<NodeId>,

    /// IOMMU support is active for the domain.
    enabled: bool,

    /// Serializes page-table mutation.
    mapping_lock: Mutex<()>,

    /// Table pages linked into the domain's hierarchy.
    pub(crate) pgtables: PgTablePool,

    /// 1:1 ranges pinned for the domain.
    pub(crate) identity_maps: PcidevsCell<IdentityMaps>,
}

impl DomainIommu {
    /// Create the IOMMU state for domain `id`.
    pub fn new(id: DomainId, node: Option<NodeId>, enabled: bool) -> Self {
        Self {
            id,
            node,
            enabled,
            mapping_lock: Mutex::new(()),
            pgtables: PgTablePool::new(),
            identity_maps: PcidevsCell::new(IdentityMaps::new()),
        }
    }

    /// Get domain identifier.
    #[inline]
    pub fn id(&self) -> DomainId {
        self.id
    }

    /// NUMA node hint used for table allocations.
    #[inline]
    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    /// Whether IOMMU support is active for the domain.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Lock the backend holds while editing the domain's tables.
    #[inline]
    pub fn mapping_lock(&self) -> &Mutex<()> {
        &self.mapping_lock
    }

    /// Table pages currently owned by the domain.
    #[inline]
    pub fn pgtables(&self) -> &PgTablePool {
        &self.pgtables
    }

    /// Identity-map registry, for use under the device-operations lock.
    #[inline]
    pub fn identity_maps(&self) -> &PcidevsCell<IdentityMaps> {
        &self.identity_maps
    }

    /// Wait until no CPU holds `mapping_lock`.
    ///
    /// The lock is not kept: by teardown time no new mutator starts, so it
    /// only has to drain the ones already inside.
    pub(crate) fn spin_barrier(&self) {
        drop(self.mapping_lock.lock());
    }

    /// Release the domain's IOMMU state.
    ///
    /// # Panics
    ///
    /// Panics if table pages remain; callers must run
    /// [`DomainIommu::free_pgtables`] to completion first.
    pub fn destroy(mut self) {
        assert!(
            self.pgtables.is_empty(),
            "d{}: {} page tables left at destruction",
            self.id,
            self.pgtables.len()
        );

        let leftover = self.identity_maps.get_mut_exclusive().len();
        if leftover != 0 {
            klog!(Debug, "d{}: dropping {} identity mappings", self.id, leftover);
        }
    }
}

impl core::fmt::Debug for DomainIommu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DomainIommu")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("enabled", &self.enabled)
            .field("pgtables", &self.pgtables.len())
            .finish()
    }
}
