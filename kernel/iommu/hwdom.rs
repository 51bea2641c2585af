//! Hardware-Domain Mapping Policy
//!
//! The hardware domain drives real devices from the moment it boots, long
//! before it could describe which memory those devices touch. Its IOMMU
//! context therefore starts out with a 1:1 view of the host: every frame up
//! to 4 GiB (or the top of RAM, if higher) is classified by
//! [`hwdom_classify`] and mapped accordingly by [`iommu_hwdom_init`].
//!
//! # Classification
//!
//! | Frame | Result |
//! |-------|--------|
//! | hypervisor image, or invalid above 4 GiB | excluded |
//! | unusable RAM | excluded |
//! | conventional RAM | read/write; excluded in strict mode |
//! | reserved | read/write; present without access if reserved and inclusive mapping are both off |
//! | other holes | PV with inclusive mapping below 4 GiB: read/write; otherwise excluded |
//! | interrupt address range, emulated IO-APIC, vPCI MMCFG | excluded |
//! | read-only MMIO a PV domain may access | read-only |

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::config::HwdomConfig;
use crate::domain::DomainIommu;
use crate::identity::{IdentityP2m, P2mAccess};
use crate::ops::{FlushFlags, IommuFlags, IommuOps, MapProgress};
use crate::platform::Platform;
use crate::{IommuError, IommuResult};

// ============================================================================
// Constants
// ============================================================================

const PAGE_SHIFT: u64 = 12;

/// Last frame below 4 GiB.
const MAX_PFN_4G: u64 = ((4u64 << 30) >> PAGE_SHIFT) - 1;

/// Translated domains get their first MiB from the P2M builder.
const TRANSLATED_START_PFN: u64 = (1u64 << 20) >> PAGE_SHIFT;

/// Local APIC interrupt address window.
const INTR_WINDOW_FIRST_PFN: u64 = 0xfee00;
const INTR_WINDOW_LAST_PFN: u64 = 0xfeeff;

/// Frames walked between softirq processing.
const SOFTIRQ_MASK: u64 = 0xfffff;

// ============================================================================
// Host Memory Description
// ============================================================================

bitflags! {
    /// Host memory-map type of a frame. Empty for holes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RamType: u32 {
        const CONVENTIONAL = 1 << 0;
        const RESERVED = 1 << 1;
        const UNUSABLE = 1 << 2;
        const ACPI = 1 << 3;
    }
}

/// Host frame classification oracle.
pub trait MemoryMap {
    /// Whether `pfn` has a frame descriptor.
    fn mfn_valid(&self, pfn: u64) -> bool;

    /// Memory-map type of `pfn`.
    fn ram_type(&self, pfn: u64) -> RamType;

    /// Whether `pfn` belongs to the hypervisor image.
    fn hypervisor_in_range(&self, pfn: u64) -> bool;

    /// Whether the hardware domain may access MMIO frame `pfn`.
    fn iomem_access_permitted(&self, pfn: u64) -> bool;

    /// Whether `pfn` is in the read-only MMIO set.
    fn mmio_ro(&self, pfn: u64) -> bool;

    /// Whether `paddr` falls into a PCI MMCFG window.
    fn is_mmcfg_address(&self, paddr: u64) -> bool;
}

/// Guest type of the hardware domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKind {
    Pv,
    Hvm,
}

/// Properties of the hardware domain consulted while mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwdomInfo {
    pub kind: DomainKind,
    /// Paging is translated (PVH): mappings go through the P2M.
    pub translated: bool,
    /// Base addresses of emulated IO-APICs.
    pub vioapic_bases: Vec<u64>,
    /// Config space is emulated through vPCI.
    pub has_vpci: bool,
    /// Highest page-frame index of host RAM.
    pub max_pdx: u64,
}

impl HwdomInfo {
    #[inline]
    fn is_pv(&self) -> bool {
        self.kind == DomainKind::Pv
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Permissions for `pfn` in the hardware domain's initial IOMMU view.
///
/// `None` leaves the frame unmapped; `Some` with no access bits maps it
/// present but inaccessible.
pub fn hwdom_classify(
    info: &HwdomInfo,
    memory: &dyn MemoryMap,
    config: &HwdomConfig,
    pfn: u64,
    max_pfn: u64,
) -> Option<IommuFlags> {
    if (pfn > max_pfn && !memory.mfn_valid(pfn)) || memory.hypervisor_in_range(pfn) {
        return None;
    }

    let rw = IommuFlags::READABLE | IommuFlags::WRITABLE;
    let ty = memory.ram_type(pfn);
    let mut perms = if ty == RamType::UNUSABLE {
        return None;
    } else if ty == RamType::CONVENTIONAL {
        if config.strict {
            return None;
        }
        Some(rw)
    } else if ty.contains(RamType::RESERVED) {
        if !config.inclusive && !config.map_reserved() {
            Some(IommuFlags::empty())
        } else {
            Some(rw)
        }
    } else if !info.is_pv() {
        return None;
    } else if !config.inclusive || pfn > max_pfn {
        None
    } else {
        Some(rw)
    };

    if (INTR_WINDOW_FIRST_PFN..=INTR_WINDOW_LAST_PFN).contains(&pfn) {
        return None;
    }

    if !info.vioapic_bases.is_empty() {
        if info.vioapic_bases.iter().any(|&base| base >> PAGE_SHIFT == pfn) {
            return None;
        }
    } else if info.is_pv() && memory.iomem_access_permitted(pfn) && memory.mmio_ro(pfn) {
        // Match what the domain may map read-only through the CPU.
        perms = Some(IommuFlags::READABLE);
    }

    if info.has_vpci && memory.is_mmcfg_address(pfn << PAGE_SHIFT) {
        return None;
    }

    perms
}

// ============================================================================
// Initial Mappings
// ============================================================================

/// Run of consecutive frames sharing one permission.
#[derive(Debug, Clone, Copy)]
struct Run {
    start: u64,
    count: u64,
    perms: IommuFlags,
}

/// Build the hardware domain's initial identity mappings.
///
/// Resolves the hardware-domain options first: the reserved-region default
/// becomes enabled and inclusive mapping is dropped for non-PV domains. In
/// passthrough mode nothing is mapped.
///
/// Individual mapping failures are logged and the walk continues. The
/// domain's IOTLB is flushed once at the end.
pub fn iommu_hwdom_init(
    hd: &DomainIommu,
    info: &HwdomInfo,
    memory: &dyn MemoryMap,
    config: &mut HwdomConfig,
    ops: &dyn IommuOps,
    p2m: &dyn IdentityP2m,
    platform: &dyn Platform,
) -> IommuResult<()> {
    if config.reserved.is_none() {
        config.reserved = Some(true);
    }

    if config.inclusive {
        klog!(Warn, "IOMMU inclusive mappings are deprecated and will be removed");
        if !info.is_pv() {
            klog!(Warn, "IOMMU inclusive mappings are only supported on PV hardware domains");
            config.inclusive = false;
        }
    }

    if config.passthrough {
        return Ok(());
    }

    let max_pfn = MAX_PFN_4G;
    let top = info.max_pdx.max(max_pfn + 1);
    let start = if info.translated {
        TRANSLATED_START_PFN
    } else {
        0
    };

    let mut flush = FlushFlags::empty();
    let mut run: Option<Run> = None;

    for pfn in start..top {
        if let Some(perms) = hwdom_classify(info, memory, config, pfn, max_pfn) {
            if info.translated {
                let access = if perms.contains(IommuFlags::WRITABLE) {
                    P2mAccess::RW
                } else if perms.contains(IommuFlags::READABLE) {
                    P2mAccess::R
                } else {
                    P2mAccess::N
                };
                if let Err(e) = p2m.add_identity_entry(hd, pfn, access) {
                    klog!(Warn, "d{}: identity mapping of {:#x} failed: {}", hd.id(), pfn, e);
                }
            } else {
                match run.as_mut() {
                    Some(r) if r.start + r.count == pfn && r.perms == perms => r.count += 1,
                    _ => {
                        if let Some(r) = run.take() {
                            map_run(hd, ops, platform, r, &mut flush);
                        }
                        run = Some(Run {
                            start: pfn,
                            count: 1,
                            perms,
                        });
                    }
                }
            }
        }

        if (pfn + 1) & SOFTIRQ_MASK == 0 {
            platform.process_pending_softirqs();
        }
    }

    if let Some(r) = run {
        map_run(hd, ops, platform, r, &mut flush);
    }

    ops.iotlb_flush_all(hd, flush)
}

/// Map one run 1:1, resuming while the backend reports partial progress.
fn map_run(
    hd: &DomainIommu,
    ops: &dyn IommuOps,
    platform: &dyn Platform,
    run: Run,
    flush: &mut FlushFlags,
) {
    let mut start = run.start;
    let mut count = run.count;

    while count != 0 {
        match ops.map_pages(hd, start, start, count, run.perms | IommuFlags::PREEMPT, flush) {
            Ok(MapProgress::Done) => return,
            Ok(MapProgress::Partial(done)) if done != 0 && done <= count => {
                start += done;
                count -= done;
                platform.process_pending_softirqs();
            }
            Ok(MapProgress::Partial(done)) => {
                klog!(
                    Error,
                    "d{}: IOMMU backend reported bogus progress {} of {}",
                    hd.id(),
                    done,
                    count
                );
                return;
            }
            Err(e) => {
                klog!(
                    Warn,
                    "d{}: IOMMU identity mapping of [{:#x},{:#x}) failed: {}",
                    hd.id(),
                    start,
                    start + count,
                    e
                );
                return;
            }
        }
    }
}

/// Check the options a translated (PVH) hardware domain depends on.
///
/// Such a domain cannot run without IOMMU support, and only strict mode
/// keeps its P2M and IOMMU views consistent.
pub fn check_autotranslated_hwdom(hd: &DomainIommu, config: &HwdomConfig) -> IommuResult<()> {
    if !hd.is_enabled() {
        klog!(Error, "IOMMU must be enabled for a PVH hardware domain");
        return Err(IommuError::Unsupported);
    }
    if !config.strict {
        klog!(Error, "PVH hardware domain IOMMU must be in strict mode");
        return Err(IommuError::Unsupported);
    }
    Ok(())
}
