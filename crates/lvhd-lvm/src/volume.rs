//! The `VolumeManager` trait and scan records

use lvhd_common::Result;
use std::collections::HashMap;
use std::path::PathBuf;

/// One LV as reported by the bulk scan
#[derive(Clone, Debug, Default)]
pub struct LvInfo {
    /// LV name (type prefix + uuid for VDI volumes)
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Device-mapper node exists
    pub active: bool,
    /// Device is open by at least one process
    pub open: bool,
    /// LV permission is read-only
    pub read_only: bool,
    /// Carries the hidden tag
    pub hidden: bool,
    /// All tags on the LV
    pub tags: Vec<String>,
}

/// Narrow interface over the LVM primitives
///
/// All calls are synchronous; an implementation spawning external tools
/// blocks until the tool exits and the result is treated as atomic.
pub trait VolumeManager: Send + Sync {
    /// Name of the backing volume group
    fn vg_name(&self) -> &str;

    /// Device path of an LV in this VG
    fn lv_path(&self, lv_name: &str) -> PathBuf {
        PathBuf::from(format!("/dev/{}/{}", self.vg_name(), lv_name))
    }

    /// Create an LV of the given size (rounded up to the LVM increment)
    fn create(&self, lv_name: &str, size: u64) -> Result<()>;

    /// Remove an LV
    fn remove(&self, lv_name: &str) -> Result<()>;

    /// Rename an LV in place; the device node follows the name
    fn rename(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Grow or shrink an LV to exactly `size` (rounded up to the increment)
    fn set_size(&self, lv_name: &str, size: u64) -> Result<()>;

    /// Activate the LV (create the device-mapper node)
    fn activate(&self, lv_name: &str) -> Result<()>;

    /// Deactivate the LV
    fn deactivate(&self, lv_name: &str) -> Result<()>;

    /// Change the LV permission
    fn set_readonly(&self, lv_name: &str, read_only: bool) -> Result<()>;

    /// Add or remove the hidden tag
    fn set_hidden(&self, lv_name: &str, hidden: bool) -> Result<()>;

    /// Add an arbitrary tag
    fn add_tag(&self, lv_name: &str, tag: &str) -> Result<()>;

    /// Re-read the LV's mapping after an out-of-band change (used on pool
    /// members after a rename on the master)
    fn refresh(&self, lv_name: &str) -> Result<()>;

    /// Whether the LV exists in the VG
    fn exists(&self, lv_name: &str) -> Result<bool>;

    /// Info for one LV
    fn get_info(&self, lv_name: &str) -> Result<LvInfo>;

    /// Bulk scan of every LV in the VG, keyed by name
    fn scan(&self) -> Result<HashMap<String, LvInfo>>;

    /// Unallocated space left in the VG
    fn free_space(&self) -> Result<u64>;

    /// Write zeros over `[offset, offset+len)` of the LV's device.
    /// Offset and length must be sector-aligned.
    fn zero_range(&self, lv_name: &str, offset: u64, len: u64) -> Result<()>;
}
