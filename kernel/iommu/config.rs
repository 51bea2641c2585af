//! Boot-time IOMMU configuration.
//!
//! Options arrive as comma-separated token lists from the hypervisor command
//! line (`iommu=` and `dom0-iommu=`). Every boolean token accepts a `no-`
//! prefix or an explicit `=<bool>` suffix:
//!
//! ```text
//! iommu=no-quarantine,superpages=0
//! dom0-iommu=strict,map-reserved=off
//! ```

use bitflags::bitflags;

use crate::{IommuError, IommuResult};

bitflags! {
    /// Page sizes a backend can install, as size masks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageSizes: u64 {
        const SIZE_4K = 1 << 12;
        const SIZE_2M = 1 << 21;
        const SIZE_1G = 1 << 30;
    }
}

/// Hardware-domain mapping options (`dom0-iommu=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwdomConfig {
    /// Leave the hardware domain untranslated; no initial mappings are built.
    pub passthrough: bool,
    /// Map only what the domain owns; conventional RAM is not premapped.
    pub strict: bool,
    /// Map every non-RAM frame below 4 GiB (PV only, deprecated).
    pub inclusive: bool,
    /// Map reserved regions. `None` until resolved at hardware-domain setup,
    /// where it defaults to enabled.
    pub reserved: Option<bool>,
}

impl HwdomConfig {
    pub const fn new() -> Self {
        Self {
            passthrough: false,
            strict: false,
            inclusive: false,
            reserved: None,
        }
    }

    /// Whether reserved regions are mapped, applying the default.
    #[inline]
    pub fn map_reserved(&self) -> bool {
        self.reserved.unwrap_or(true)
    }
}

impl Default for HwdomConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Global IOMMU options (`iommu=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IommuConfig {
    /// IOMMU support is enabled at all.
    pub enable: bool,
    /// Quarantine de-assigned devices behind pseudo domain IDs.
    pub quarantine: bool,
    /// Allow superpage mappings.
    pub superpages: bool,
    /// Hardware-domain options.
    pub hwdom: HwdomConfig,
}

impl IommuConfig {
    pub const fn new() -> Self {
        Self {
            enable: true,
            quarantine: true,
            superpages: true,
            hwdom: HwdomConfig::new(),
        }
    }

    /// Page sizes usable with a backend supporting `backend`.
    ///
    /// With superpages disabled only 4 KiB mappings remain.
    pub fn effective_page_sizes(&self, backend: PageSizes) -> PageSizes {
        if self.superpages {
            backend
        } else {
            backend & PageSizes::SIZE_4K
        }
    }

    /// Apply an `iommu=` option string.
    ///
    /// A bare boolean switches IOMMU support as a whole. Unknown tokens are
    /// skipped; once the remaining tokens are applied the call reports
    /// [`IommuError::InvalidParam`].
    pub fn parse_iommu_param(&mut self, s: &str) -> IommuResult<()> {
        let mut rc = Ok(());

        for token in tokens(s) {
            if let Some(v) = parse_bool(token) {
                self.enable = v;
            } else if let Some(v) = parse_boolean("quarantine", token) {
                self.quarantine = v;
            } else if let Some(v) = parse_boolean("superpages", token) {
                self.superpages = v;
            } else if let Some(v) = parse_boolean("dom0-passthrough", token) {
                klog!(Warn, "iommu=dom0-passthrough is deprecated, use dom0-iommu=passthrough");
                self.hwdom.passthrough = v;
            } else if let Some(v) = parse_boolean("dom0-strict", token) {
                klog!(Warn, "iommu=dom0-strict is deprecated, use dom0-iommu=strict");
                self.hwdom.strict = v;
            } else {
                klog!(Warn, "iommu: unknown option '{}'", token);
                rc = Err(IommuError::InvalidParam);
            }
        }

        rc
    }

    /// Apply a `dom0-iommu=` option string.
    pub fn parse_dom0_iommu_param(&mut self, s: &str) -> IommuResult<()> {
        let mut rc = Ok(());

        for token in tokens(s) {
            if let Some(v) = parse_boolean("passthrough", token) {
                self.hwdom.passthrough = v;
            } else if let Some(v) = parse_boolean("strict", token) {
                self.hwdom.strict = v;
            } else if let Some(v) = parse_boolean("map-inclusive", token) {
                self.hwdom.inclusive = v;
            } else if let Some(v) = parse_boolean("map-reserved", token) {
                self.hwdom.reserved = Some(v);
            } else {
                klog!(Warn, "dom0-iommu: unknown option '{}'", token);
                rc = Err(IommuError::InvalidParam);
            }
        }

        rc
    }
}

impl Default for IommuConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn tokens(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|t| !t.is_empty())
}

/// Parse a boolean word.
fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "yes" | "on" | "true" | "enable" => Some(true),
        "0" | "no" | "off" | "false" | "disable" => Some(false),
        _ => None,
    }
}

/// Match `token` against option `name`: `name`, `no-name` or `name=<bool>`.
fn parse_boolean(name: &str, token: &str) -> Option<bool> {
    if let Some(rest) = token.strip_prefix("no-") {
        return (rest == name).then_some(false);
    }

    let rest = token.strip_prefix(name)?;
    if rest.is_empty() {
        return Some(true);
    }
    parse_bool(rest.strip_prefix('=')?)
}
