//! Identity Map Registry
//!
//! Reserved regions (RMRRs, IVMD blocks) and quarantine setups pin physical
//! ranges 1:1 into a domain's device address space. Several devices may
//! request the same range, so each range is reference counted and unmapped
//! only when its last user releases it.
//!
//! # Conflicts
//!
//! Two live entries never cover a common 4 KiB frame unless they describe
//! exactly the same `[base, end)`. A request that overlaps a live entry
//! without matching it exactly, or matches it with a different access type,
//! is refused with [`IommuError::AddressInUse`] and leaves the registry
//! unchanged.
//!
//! # Locking
//!
//! The registry has no lock of its own; it is reached through
//! [`PcidevsCell`](crate::PcidevsCell) and so only while the caller holds
//! the device-operations lock.

use alloc::vec::Vec;

use crate::domain::DomainIommu;
use crate::pcidevs::PcidevsGuard;
use crate::{IommuError, IommuResult};

const PAGE_SHIFT_4K: u64 = 12;
const PAGE_SIZE_4K: u64 = 1 << PAGE_SHIFT_4K;

// ============================================================================
// P2M Interface
// ============================================================================

/// Access type of a P2M entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P2mAccess {
    /// No access.
    N,
    R,
    W,
    RW,
    /// Execute-only. Never a valid identity mapping; requests with this
    /// access type release a mapping instead.
    X,
    RX,
    WX,
    RWX,
}

/// P2M operations backing identity mappings.
pub trait IdentityP2m {
    /// Install a 1:1 entry for `pfn`.
    fn set_identity_entry(
        &self,
        hd: &DomainIommu,
        pfn: u64,
        access: P2mAccess,
        flag: u32,
    ) -> IommuResult<()>;

    /// Remove the 1:1 entry for `pfn`.
    fn clear_identity_entry(&self, hd: &DomainIommu, pfn: u64) -> IommuResult<()>;

    /// Add a 1:1 entry for `pfn` while building the hardware domain.
    fn add_identity_entry(&self, hd: &DomainIommu, pfn: u64, access: P2mAccess) -> IommuResult<()>;
}

// ============================================================================
// Registry
// ============================================================================

/// One registered identity range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityMap {
    base: u64,
    end: u64,
    access: P2mAccess,
    count: u32,
}

impl IdentityMap {
    /// First byte of the range.
    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// One past the last byte of the range.
    #[inline]
    pub fn end(&self) -> u64 {
        self.end
    }

    #[inline]
    pub fn access(&self) -> P2mAccess {
        self.access
    }

    /// Number of outstanding registrations.
    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    fn frames(&self) -> (u64, u64) {
        frame_range(self.base, self.end)
    }
}

/// 4 KiB frames covered by `[base, end)`.
fn frame_range(base: u64, end: u64) -> (u64, u64) {
    let end_pfn = (end >> PAGE_SHIFT_4K) + u64::from(end & (PAGE_SIZE_4K - 1) != 0);
    (base >> PAGE_SHIFT_4K, end_pfn)
}

/// Identity ranges of one domain, in registration order.
#[derive(Debug, Default)]
pub struct IdentityMaps {
    maps: Vec<IdentityMap>,
}

impl IdentityMaps {
    pub const fn new() -> Self {
        Self { maps: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IdentityMap> {
        self.maps.iter()
    }

    /// Entry registered for exactly `[base, end)`.
    pub fn find(&self, base: u64, end: u64) -> Option<&IdentityMap> {
        self.maps.iter().find(|m| m.base == base && m.end == end)
    }
}

// ============================================================================
// Operations
// ============================================================================

impl DomainIommu {
    /// Register or release the identity range `[base, end)`.
    ///
    /// - exact match with the same access: the count is raised, nothing is
    ///   mapped.
    /// - [`P2mAccess::X`] on an exact match: the count drops; at zero every
    ///   frame is unmapped (continuing past failures, the first of which is
    ///   reported) and the entry is removed.
    /// - [`P2mAccess::X`] without a match: [`IommuError::NotFound`].
    /// - any other overlap: [`IommuError::AddressInUse`].
    /// - otherwise every frame is mapped, stopping at the first failure with
    ///   earlier frames left mapped, and a new entry with count 1 is added.
    pub fn identity_mapping(
        &self,
        guard: &mut PcidevsGuard,
        p2m: &dyn IdentityP2m,
        access: P2mAccess,
        base: u64,
        end: u64,
        flag: u32,
    ) -> IommuResult<()> {
        if base >= end {
            return Err(IommuError::InvalidRange);
        }

        let maps = &mut self.identity_maps.get_mut(guard).maps;
        let (base_pfn, end_pfn) = frame_range(base, end);

        if let Some(idx) = maps.iter().position(|m| m.base == base && m.end == end) {
            let map = &mut maps[idx];

            if access != P2mAccess::X {
                if map.access != access {
                    klog!(
                        Warn,
                        "d{}: identity map [{:#x},{:#x}) already {:?}, {:?} requested",
                        self.id(),
                        base,
                        end,
                        map.access,
                        access
                    );
                    return Err(IommuError::AddressInUse);
                }
                map.count = match map.count.checked_add(1) {
                    Some(count) => count,
                    None => {
                        klog!(
                            Warn,
                            "d{}: identity map [{:#x},{:#x}) reference count saturated",
                            self.id(),
                            base,
                            end
                        );
                        return Err(IommuError::AddressInUse);
                    }
                };
                return Ok(());
            }

            map.count -= 1;
            if map.count != 0 {
                return Ok(());
            }

            let mut rc = Ok(());
            for pfn in base_pfn..end_pfn {
                if let Err(e) = p2m.clear_identity_entry(self, pfn) {
                    klog!(Warn, "d{}: identity unmap of {:#x} failed: {}", self.id(), pfn, e);
                    if rc.is_ok() {
                        rc = Err(IommuError::MappingFailed);
                    }
                }
            }
            maps.remove(idx);
            return rc;
        }

        if let Some(map) = maps.iter().find(|m| {
            let (b, e) = m.frames();
            base_pfn < e && b < end_pfn
        }) {
            klog!(
                Warn,
                "d{}: identity map [{:#x},{:#x}) overlaps [{:#x},{:#x})",
                self.id(),
                base,
                end,
                map.base,
                map.end
            );
            return Err(IommuError::AddressInUse);
        }

        if access == P2mAccess::X {
            return Err(IommuError::NotFound);
        }

        maps.try_reserve(1).map_err(|_| IommuError::NoMemory)?;

        for pfn in base_pfn..end_pfn {
            if let Err(e) = p2m.set_identity_entry(self, pfn, access, flag) {
                klog!(
                    Warn,
                    "d{}: identity map [{:#x},{:#x}) failed at {:#x}: {}",
                    self.id(),
                    base,
                    end,
                    pfn,
                    e
                );
                return Err(e);
            }
        }

        maps.push(IdentityMap {
            base,
            end,
            access,
            count: 1,
        });
        Ok(())
    }

    /// Drop one registration of `[base, end)`.
    #[inline]
    pub fn release_identity_mapping(
        &self,
        guard: &mut PcidevsGuard,
        p2m: &dyn IdentityP2m,
        base: u64,
        end: u64,
    ) -> IommuResult<()> {
        self.identity_mapping(guard, p2m, P2mAccess::X, base, end, 0)
    }

    /// Forget every identity range without touching the P2M.
    ///
    /// Used when the whole domain goes away.
    pub fn identity_map_teardown(&self, guard: &mut PcidevsGuard) {
        self.identity_maps.get_mut(guard).maps.clear();
    }
}
