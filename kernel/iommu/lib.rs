//! IOMMU resource management for the hypervisor
//!
//! This crate owns the generic, vendor-independent part of DMA remapping:
//! the physical memory used for device-facing page tables, the registry of
//! 1:1 ("identity") ranges pinned on behalf of a domain, the deferred
//! reclamation of page tables that hardware may still be walking, and the
//! pseudo domain-ID space used to quarantine devices.
//!
//! # Architecture
//!
//! ```text
//!   device assignment / quarantine          hardware-domain construction
//!            |            |                              |
//!            v            v                              v
//!   +----------------+ +-----------------+   +------------------------+
//!   | Identity Map   | | Domain-ID       |   | Hardware-Domain        |
//!   | Registry       | | Allocator       |   | Mapping Policy         |
//!   +-------+--------+ +-----------------+   +-----------+------------+
//!           |                                            |
//!           v                                            v
//!   +--------------------------------------------------------------+
//!   |  vendor backend (IommuOps): map / clear root / IOTLB flush   |
//!   +------------------------------+-------------------------------+
//!                                  |  allocates / unlinks tables
//!                                  v
//!   +------------------------+  unlink   +--------------------------+
//!   | Page-Table Memory Pool | --------> | Deferred Reclamation     |
//!   | (per domain)           |           | Queue (per CPU)          |
//!   +-----------+------------+           +------------+-------------+
//!               |  free_pgtables                      |  tasklet
//!               v                                     v
//!   +--------------------------------------------------------------+
//!   |                  host page allocator (Platform)              |
//!   +--------------------------------------------------------------+
//! ```
//!
//! # Ownership of Table Pages
//!
//! Every table page is represented by exactly one [`PgTablePage`] token. The
//! token sits in a domain's pool, then possibly on one CPU's deferred list,
//! and is finally consumed when the frame goes back to the host allocator.
//! Backends only ever see a [`PageHandle`], which names a page but cannot
//! free it.
//!
//! # Locking
//!
//! - `mapping_lock` (per domain): serializes table mutation; teardown uses it
//!   as a barrier.
//! - pool lock (per domain): list linkage only, never held across allocation.
//! - per-CPU deferred lists: touched by the owning CPU, or by the CPU running
//!   the `Dead` notifier of another CPU.
//! - the identity-map registry and the pseudo domain-ID bitmap are guarded by
//!   the global device-operations lock ([`pcidevs_lock`]) which the caller
//!   must hold.

#![no_std]

extern crate alloc;

#[macro_use]
extern crate klog;

pub mod config;
pub mod contig;
pub mod domain;
pub mod domid;
pub mod hwdom;
pub mod identity;
pub mod ops;
pub mod page;
pub mod pcidevs;
pub mod pgtable;
pub mod platform;
pub mod reclaim;

#[cfg(test)]
mod mock;

use core::fmt;

// Re-export key types
pub use config::{HwdomConfig, IommuConfig, PageSizes};
pub use domain::{iommu_use_permitted, DomainFeatures, DomainId, DomainIommu};
pub use domid::{iommu_init_domid, DomidMap, PciDevArch, DOMID_INVALID, DOMID_MASK};
pub use hwdom::{hwdom_classify, iommu_hwdom_init, DomainKind, HwdomInfo, MemoryMap, RamType};
pub use identity::{IdentityMap, IdentityMaps, IdentityP2m, P2mAccess};
pub use ops::{FlushFlags, IommuFlags, IommuOps, MapProgress};
pub use page::{PageHandle, PgTablePage, PTES_PER_PAGE};
pub use pcidevs::{pcidevs_lock, pcidevs_locked, PcidevsCell, PcidevsGuard};
pub use platform::{CpuId, NodeId, Platform};
pub use reclaim::{CpuAction, PgtFreeQueues};

// ============================================================================
// Errors
// ============================================================================

/// IOMMU resource-management errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuError {
    /// Page or bookkeeping allocation failed.
    NoMemory,
    /// Identity range conflicts with a live entry.
    AddressInUse,
    /// Release of an identity range that was never registered.
    NotFound,
    /// Pseudo domain-ID space is full.
    Exhausted,
    /// Bulk operation made partial progress; call again.
    Retry,
    /// Backend or P2M refused to (un)map a frame.
    MappingFailed,
    /// Empty or inverted address range.
    InvalidRange,
    /// Unrecognised configuration option.
    InvalidParam,
    /// Configuration not supported for this domain.
    Unsupported,
}

impl fmt::Display for IommuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => write!(f, "out of memory"),
            Self::AddressInUse => write!(f, "address range in use"),
            Self::NotFound => write!(f, "no such identity mapping"),
            Self::Exhausted => write!(f, "pseudo domain IDs exhausted"),
            Self::Retry => write!(f, "operation preempted, retry"),
            Self::MappingFailed => write!(f, "mapping operation failed"),
            Self::InvalidRange => write!(f, "invalid address range"),
            Self::InvalidParam => write!(f, "invalid parameter"),
            Self::Unsupported => write!(f, "unsupported configuration"),
        }
    }
}

/// Result type for IOMMU operations.
pub type IommuResult<T> = Result<T, IommuError>;
