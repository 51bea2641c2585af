//! Contiguity markers for freshly allocated table pages.
//!
//! Backends that merge runs of leaf entries into superpages keep a small
//! counter in the ignored bits of certain slots of each table. The counter at
//! slot `i` records the order of the aligned block starting at `i` that is
//! known to be contiguous. A newly allocated, empty table is trivially
//! contiguous at every order, so the initial markers are:
//!
//! | slot | marker |
//! |------|--------|
//! | 0 | [`CONTIG_LEVEL_SHIFT`] (the whole table) |
//! | `i % 4 == 0`, `i > 0` | `i.trailing_zeros()` |
//! | `i % 4 == 2` | 1 |
//! | odd | 0 |
//!
//! Only allocation writes markers here; afterwards the backend owns them.

use crate::page::PTES_PER_PAGE;

/// log2 of the number of entries per table.
pub const CONTIG_LEVEL_SHIFT: u32 = 9;

const _: () = assert!(1usize << CONTIG_LEVEL_SHIFT == PTES_PER_PAGE);

/// Fill `table` with the baseline markers of an empty table.
///
/// `contig_mask` selects the ignored PTE bits holding the marker; its lowest
/// set bit is the marker's bit 0.
///
/// # Panics
///
/// Panics if `contig_mask` is zero or too narrow to hold
/// [`CONTIG_LEVEL_SHIFT`].
pub fn init_contig_markers(table: &mut [u64; PTES_PER_PAGE], contig_mask: u64) {
    assert!(contig_mask != 0, "contiguity mask must not be empty");
    let shift = contig_mask.trailing_zeros();
    assert_eq!(
        u64::from(CONTIG_LEVEL_SHIFT) & (contig_mask >> shift),
        u64::from(CONTIG_LEVEL_SHIFT),
        "contiguity mask {:#x} cannot hold the table order",
        contig_mask
    );

    table[0] = u64::from(CONTIG_LEVEL_SHIFT) << shift;
    table[1] = 0;
    table[2] = 1 << shift;
    table[3] = 0;

    for i in (4..PTES_PER_PAGE).step_by(4) {
        table[i] = u64::from(i.trailing_zeros()) << shift;
        table[i + 1] = 0;
        table[i + 2] = 1 << shift;
        table[i + 3] = 0;
    }
}

/// Decode the marker stored in `entry`.
#[inline]
pub fn contig_marker(entry: u64, contig_mask: u64) -> u32 {
    if contig_mask == 0 {
        return 0;
    }
    ((entry & contig_mask) >> contig_mask.trailing_zeros()) as u32
}
