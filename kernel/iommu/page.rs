//! Page-table page ownership.
//!
//! A [`PgTablePage`] is the sole owner of one frame used as an IOMMU page
//! table. It cannot be cloned or constructed outside this crate, so a frame
//! cannot be linked into two lists at once: moving it from the domain pool to
//! a deferred list, or back to the host allocator, moves the token.

use core::fmt;

use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use crate::platform::Platform;

/// Number of 64-bit entries in one 4 KiB table page.
pub const PTES_PER_PAGE: usize = 512;

/// Owning token for one table page.
#[must_use = "dropping a table page leaks its frame"]
pub struct PgTablePage {
    frame: PhysFrame,
}

impl PgTablePage {
    pub(crate) fn new(frame: PhysFrame) -> Self {
        Self { frame }
    }

    /// Physical frame backing the table.
    #[inline]
    pub fn frame(&self) -> PhysFrame {
        self.frame
    }

    /// Non-owning name for this page.
    #[inline]
    pub fn handle(&self) -> PageHandle {
        PageHandle(self.frame)
    }

    /// Return the frame to the host allocator.
    pub(crate) fn free(self, platform: &dyn Platform) {
        platform.free_page(self.frame);
    }
}

impl fmt::Debug for PgTablePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PgTablePage({:#x})", self.frame.start_address().as_u64())
    }
}

/// Non-owning page-table page reference handed to backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageHandle(PhysFrame);

impl PageHandle {
    /// Physical frame of the table.
    #[inline]
    pub fn frame(&self) -> PhysFrame {
        self.0
    }

    /// Physical address of the table.
    #[inline]
    pub fn start_address(&self) -> PhysAddr {
        self.0.start_address()
    }

    /// Key under which the owning pool files this page.
    #[inline]
    pub(crate) fn key(&self) -> u64 {
        self.0.start_address().as_u64()
    }
}
