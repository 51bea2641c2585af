//! Pseudo domain-ID allocation for device quarantine
//!
//! A quarantined device still needs a context entry, and context entries
//! carry a domain ID. Quarantine contexts take IDs from a separate space:
//! the index of a free bit in [`DomidMap`], tagged with `DOMID_MASK + 1` so
//! it can never collide with a real domain.
//!
//! IDs are handed out round-robin from a rotating cursor, so a freshly
//! released ID is the last one to be reused and stale IOTLB entries tagged
//! with it have long been flushed.
//!
//! The map takes no lock; callers keep it behind the device-operations lock
//! (e.g. in a [`PcidevsCell`](crate::PcidevsCell)).

use alloc::vec::Vec;

use crate::config::IommuConfig;
use crate::domain::DomainId;
use crate::{IommuError, IommuResult};

/// Mask of the real domain-ID space.
pub const DOMID_MASK: DomainId = 0x7FFF;

/// "No domain" sentinel.
pub const DOMID_INVALID: DomainId = 0x7FF4;

/// Tag carried by every pseudo domain ID.
const PSEUDO_DOMID_TAG: DomainId = DOMID_MASK + 1;

/// Number of pseudo domain IDs.
pub const NR_PSEUDO_DOMIDS: usize = (u16::MAX - DOMID_MASK) as usize;

const _: () = assert!((DOMID_MASK as u32) * 2 < u16::MAX as u32);

const BITS_PER_WORD: usize = u64::BITS as usize;

// ============================================================================
// Bitmap
// ============================================================================

/// Allocation bitmap of pseudo domain IDs.
#[derive(Debug)]
pub struct DomidMap {
    bits: Vec<u64>,
    width: usize,
    /// Next index to try.
    cursor: usize,
}

impl DomidMap {
    fn with_width(width: usize) -> IommuResult<Self> {
        let words = width.div_ceil(BITS_PER_WORD);
        let mut bits = Vec::new();
        bits.try_reserve_exact(words)
            .map_err(|_| IommuError::NoMemory)?;
        bits.resize(words, 0);
        Ok(Self {
            bits,
            width,
            cursor: 0,
        })
    }

    #[inline]
    fn test(&self, idx: usize) -> bool {
        self.bits[idx / BITS_PER_WORD] & (1 << (idx % BITS_PER_WORD)) != 0
    }

    #[inline]
    fn set(&mut self, idx: usize) {
        self.bits[idx / BITS_PER_WORD] |= 1 << (idx % BITS_PER_WORD);
    }

    #[inline]
    fn clear(&mut self, idx: usize) {
        self.bits[idx / BITS_PER_WORD] &= !(1 << (idx % BITS_PER_WORD));
    }

    /// First clear bit at or after `start`, or `None`.
    fn find_next_zero(&self, start: usize) -> Option<usize> {
        let mut idx = start;
        while idx < self.width {
            let word = idx / BITS_PER_WORD;
            // Treat bits below `idx` as set.
            let free = !self.bits[word] & (u64::MAX << (idx % BITS_PER_WORD));
            if free != 0 {
                let found = word * BITS_PER_WORD + free.trailing_zeros() as usize;
                return (found < self.width).then_some(found);
            }
            idx = (word + 1) * BITS_PER_WORD;
        }
        None
    }

    /// Number of IDs currently handed out.
    pub fn allocated(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether `id` is a pseudo domain ID currently handed out.
    pub fn is_allocated(&self, id: DomainId) -> bool {
        id & PSEUDO_DOMID_TAG != 0 && self.test(usize::from(id & DOMID_MASK))
    }

    /// Allocate a pseudo domain ID.
    ///
    /// Scans from the cursor, wrapping to the start once. Returns
    /// [`IommuError::Exhausted`] when every ID is in use.
    pub fn alloc(&mut self) -> IommuResult<DomainId> {
        let idx = self
            .find_next_zero(self.cursor)
            .or_else(|| self.find_next_zero(0))
            .ok_or(IommuError::Exhausted)?;

        self.set(idx);
        self.cursor = idx + 1;

        Ok(idx as DomainId | PSEUDO_DOMID_TAG)
    }

    /// Return a pseudo domain ID.
    ///
    /// [`DOMID_INVALID`] is ignored.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not a pseudo domain ID or is not allocated.
    pub fn free(&mut self, id: DomainId) {
        if id == DOMID_INVALID {
            return;
        }

        assert!(id > DOMID_MASK, "domain ID {:#x} is not a pseudo domain ID", id);
        let idx = usize::from(id & DOMID_MASK);
        assert!(self.test(idx), "pseudo domain ID {:#x} freed twice", id);
        self.clear(idx);
    }
}

/// Set up the pseudo domain-ID map.
///
/// Returns `Ok(None)` when quarantine is disabled. `reserve`, unless it is
/// [`DOMID_INVALID`], is a pseudo domain ID already in use (e.g. by the
/// quarantine domain itself) and is marked allocated.
pub fn iommu_init_domid(config: &IommuConfig, reserve: DomainId) -> IommuResult<Option<DomidMap>> {
    if !config.quarantine {
        return Ok(None);
    }

    let mut map = DomidMap::with_width(NR_PSEUDO_DOMIDS)?;
    if reserve != DOMID_INVALID {
        assert!(reserve > DOMID_MASK, "reserved domain ID {:#x} is not a pseudo domain ID", reserve);
        map.set(usize::from(reserve & DOMID_MASK));
    }

    Ok(Some(map))
}

// ============================================================================
// Per-Device State
// ============================================================================

/// Architecture-specific state of one PCI device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciDevArch {
    /// Pseudo domain ID used while the device is quarantined.
    pub pseudo_domid: DomainId,
}

impl PciDevArch {
    /// State for a newly discovered device: no pseudo domain ID yet.
    pub const fn new() -> Self {
        Self {
            pseudo_domid: DOMID_INVALID,
        }
    }
}

impl Default for PciDevArch {
    fn default() -> Self {
        Self::new()
    }
}
