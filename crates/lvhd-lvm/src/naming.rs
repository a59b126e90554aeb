//! LV naming scheme
//!
//! An LV's name always encodes its type prefix plus the VDI uuid; the type
//! is recovered purely by string matching when scanning, it is stored
//! nowhere else.

use lvhd_common::VdiType;

/// Prefix for VHD-formatted LVs
pub const LV_PREFIX_VHD: &str = "VHD-";

/// Prefix for raw LVs
pub const LV_PREFIX_RAW: &str = "LV-";

/// Name of the reserved metadata volume
pub const MGT_LV_NAME: &str = "MGT";

/// LV name for a VDI of the given type
#[must_use]
pub fn lv_name_of(vdi_type: VdiType, uuid: &str) -> String {
    match vdi_type {
        VdiType::Vhd => format!("{LV_PREFIX_VHD}{uuid}"),
        VdiType::Raw => format!("{LV_PREFIX_RAW}{uuid}"),
    }
}

/// Recover (type, uuid) from an LV name; `None` for LVs that are not VDIs
/// (the MGT volume, journal LVs, foreign LVs in the VG)
#[must_use]
pub fn parse_lv_name(lv_name: &str) -> Option<(VdiType, &str)> {
    if let Some(uuid) = lv_name.strip_prefix(LV_PREFIX_VHD) {
        return Some((VdiType::Vhd, uuid));
    }
    if let Some(uuid) = lv_name.strip_prefix(LV_PREFIX_RAW) {
        return Some((VdiType::Raw, uuid));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        let name = lv_name_of(VdiType::Vhd, "1234-abcd");
        assert_eq!(name, "VHD-1234-abcd");
        assert_eq!(parse_lv_name(&name), Some((VdiType::Vhd, "1234-abcd")));

        let name = lv_name_of(VdiType::Raw, "ffff");
        assert_eq!(parse_lv_name(&name), Some((VdiType::Raw, "ffff")));
    }

    #[test]
    fn test_non_vdi_names() {
        assert_eq!(parse_lv_name("MGT"), None);
        assert_eq!(parse_lv_name("journal_clone_1234"), None);
        // prefix matching is exact, case-sensitive
        assert_eq!(parse_lv_name("vhd-1234"), None);
    }
}
