//! VHD space math
//!
//! Overhead formulas for the fixed parts of the format: footer, footer
//! mirror, sparse header, block allocation table, and the per-block sector
//! bitmaps. Used to size backing LVs so a fully-allocated VHD always fits.

use lvhd_common::{GIB, KIB, MIB, roundup};

/// Size of the VHD footer (also mirrored at the front of the file)
pub const VHD_FOOTER_SIZE: u64 = 512;

/// Data block granularity
pub const VHD_BLOCK_SIZE: u64 = 2 * MIB;

/// Maximum parent-chain length before snapshots are refused
pub const MAX_CHAIN_SIZE: u32 = 30;

/// Maximum virtual size; the BAT is preallocated for this so online resize
/// never relocates metadata
pub const MAX_VHD_SIZE: u64 = 2048 * GIB;

/// Metadata overhead of an empty VHD of the given virtual size
#[must_use]
pub fn calc_overhead_empty(size_virt: u64) -> u64 {
    let size_mib = size_virt / MIB;

    // footer + footer mirror + header + parent locator space
    let mut overhead = 3 * KIB;

    // BAT: 4 bytes per 2 MiB block
    overhead += (size_mib / 2) * 4;
    overhead = roundup(512, overhead);

    // BATMAP: 1 bit per block
    overhead += (size_mib / 2) / 8;
    roundup(4 * KIB, overhead)
}

/// Bitmap overhead of a fully-allocated VHD of the given virtual size
#[must_use]
pub fn calc_overhead_bitmap(size_virt: u64) -> u64 {
    let mut num_blocks = size_virt / VHD_BLOCK_SIZE;
    if size_virt % VHD_BLOCK_SIZE != 0 {
        num_blocks += 1;
    }
    num_blocks * 4 * KIB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overhead_empty_small() {
        // 1 GiB: 3 KiB fixed + 2 KiB BAT -> 5120, +64 batmap, round to 8192
        assert_eq!(calc_overhead_empty(GIB), 8192);
    }

    #[test]
    fn test_overhead_empty_max() {
        let overhead = calc_overhead_empty(MAX_VHD_SIZE);
        assert_eq!(overhead % (4 * KIB), 0);
        // 2 TiB: BAT alone is 4 MiB
        assert!(overhead > 4 * MIB);
        assert!(overhead < 5 * MIB);
    }

    #[test]
    fn test_overhead_bitmap() {
        assert_eq!(calc_overhead_bitmap(VHD_BLOCK_SIZE), 4 * KIB);
        // partial trailing block still needs a bitmap
        assert_eq!(calc_overhead_bitmap(VHD_BLOCK_SIZE + 1), 8 * KIB);
        assert_eq!(calc_overhead_bitmap(GIB), 512 * 4 * KIB);
    }
}
