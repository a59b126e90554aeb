//! LV sizing for VHD-backed volumes

use lvhd_common::roundup;
use lvhd_lvm::LVM_SIZE_INCREMENT;
use lvhd_vhd::{MAX_VHD_SIZE, calc_overhead_bitmap, calc_overhead_empty};

/// Round a VHD byte size up to what LVM will actually allocate
#[must_use]
pub fn calc_size_lv(size_vhd: u64) -> u64 {
    roundup(LVM_SIZE_INCREMENT, size_vhd)
}

/// LV size for a fully-allocated VHD of the given virtual size.
///
/// The static metadata area is sized for the maximum virtual size so an
/// online resize never has to relocate the BAT.
#[must_use]
pub fn calc_size_vhd_lv(size_virt: u64) -> u64 {
    calc_size_lv(size_virt + calc_overhead_empty(MAX_VHD_SIZE) + calc_overhead_bitmap(size_virt))
}

/// LV size for a freshly snapshotted, still-empty leaf
#[must_use]
pub fn thin_leaf_size() -> u64 {
    calc_size_lv(calc_overhead_empty(MAX_VHD_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lvhd_common::{GIB, MIB};

    #[test]
    fn test_calc_size_lv_rounds_to_extent() {
        assert_eq!(calc_size_lv(1), LVM_SIZE_INCREMENT);
        assert_eq!(calc_size_lv(4 * MIB), 4 * MIB);
        assert_eq!(calc_size_lv(4 * MIB + 1), 8 * MIB);
    }

    #[test]
    fn test_full_size_exceeds_virtual() {
        let full = calc_size_vhd_lv(GIB);
        assert!(full > GIB);
        // bitmaps are 4 KiB per 2 MiB block plus a ~5 MiB static area
        assert!(full < GIB + 16 * MIB);
        assert_eq!(full % LVM_SIZE_INCREMENT, 0);
    }

    #[test]
    fn test_thin_leaf_much_smaller_than_full() {
        assert!(thin_leaf_size() < calc_size_vhd_lv(GIB) / 10);
    }
}
