//! In-memory `VolumeManager` fake for tests

use crate::volume::{LvInfo, VolumeManager};
use crate::{LVM_SIZE_INCREMENT, TAG_HIDDEN};

use lvhd_common::{Result, StorageError, roundup};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Clone, Debug, Default)]
struct FakeLv {
    size: u64,
    active: bool,
    open: bool,
    read_only: bool,
    tags: Vec<String>,
}

impl FakeLv {
    fn hidden(&self) -> bool {
        self.tags.iter().any(|t| t == TAG_HIDDEN)
    }
}

/// Fake VG with a configurable capacity and full call visibility.
///
/// Test helpers (`set_open`, `zeroed_ranges`, `refresh_count`, ...) let
/// scenarios stage unusual on-disk states and observe side effects.
pub struct MemVolumeManager {
    vg_name: String,
    lvs: RwLock<HashMap<String, FakeLv>>,
    free: RwLock<u64>,
    zeroed: RwLock<Vec<(String, u64, u64)>>,
    refreshed: RwLock<Vec<String>>,
}

impl MemVolumeManager {
    /// Empty VG with the given unallocated capacity
    #[must_use]
    pub fn new(vg_name: impl Into<String>, capacity: u64) -> Self {
        Self {
            vg_name: vg_name.into(),
            lvs: RwLock::new(HashMap::new()),
            free: RwLock::new(capacity),
            zeroed: RwLock::new(Vec::new()),
            refreshed: RwLock::new(Vec::new()),
        }
    }

    fn with_lv<T>(&self, lv_name: &str, f: impl FnOnce(&mut FakeLv) -> T) -> Result<T> {
        let mut lvs = self.lvs.write();
        let lv = lvs
            .get_mut(lv_name)
            .ok_or_else(|| StorageError::LvNotFound(lv_name.to_string()))?;
        Ok(f(lv))
    }

    fn info_of(name: &str, lv: &FakeLv) -> LvInfo {
        LvInfo {
            name: name.to_string(),
            size: lv.size,
            active: lv.active,
            open: lv.open,
            read_only: lv.read_only,
            hidden: lv.hidden(),
            tags: lv.tags.clone(),
        }
    }

    /// Mark the device open (attached), as an external consumer would
    pub fn set_open(&self, lv_name: &str, open: bool) {
        if let Some(lv) = self.lvs.write().get_mut(lv_name) {
            lv.open = open;
        }
    }

    /// Override the remaining free space
    pub fn set_free_space(&self, free: u64) {
        *self.free.write() = free;
    }

    /// Every zero_range call so far, in order
    #[must_use]
    pub fn zeroed_ranges(&self) -> Vec<(String, u64, u64)> {
        self.zeroed.read().clone()
    }

    /// LVs refreshed out of band
    #[must_use]
    pub fn refreshed(&self) -> Vec<String> {
        self.refreshed.read().clone()
    }
}

impl VolumeManager for MemVolumeManager {
    fn vg_name(&self) -> &str {
        &self.vg_name
    }

    fn create(&self, lv_name: &str, size: u64) -> Result<()> {
        let size = roundup(LVM_SIZE_INCREMENT, size.max(1));
        let mut lvs = self.lvs.write();
        if lvs.contains_key(lv_name) {
            return Err(StorageError::metadata(format!("LV exists: {lv_name}")));
        }
        let mut free = self.free.write();
        if *free < size {
            return Err(StorageError::SrNoSpace {
                required: size,
                available: *free,
            });
        }
        *free -= size;
        lvs.insert(
            lv_name.to_string(),
            FakeLv {
                size,
                active: true,
                ..FakeLv::default()
            },
        );
        Ok(())
    }

    fn remove(&self, lv_name: &str) -> Result<()> {
        let mut lvs = self.lvs.write();
        let lv = lvs
            .remove(lv_name)
            .ok_or_else(|| StorageError::LvNotFound(lv_name.to_string()))?;
        *self.free.write() += lv.size;
        Ok(())
    }

    fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut lvs = self.lvs.write();
        if lvs.contains_key(new_name) {
            return Err(StorageError::metadata(format!("LV exists: {new_name}")));
        }
        let lv = lvs
            .remove(old_name)
            .ok_or_else(|| StorageError::LvNotFound(old_name.to_string()))?;
        lvs.insert(new_name.to_string(), lv);
        Ok(())
    }

    fn set_size(&self, lv_name: &str, size: u64) -> Result<()> {
        let size = roundup(LVM_SIZE_INCREMENT, size.max(1));
        let mut lvs = self.lvs.write();
        let lv = lvs
            .get_mut(lv_name)
            .ok_or_else(|| StorageError::LvNotFound(lv_name.to_string()))?;
        let mut free = self.free.write();
        if size > lv.size {
            let grow = size - lv.size;
            if *free < grow {
                return Err(StorageError::SrNoSpace {
                    required: grow,
                    available: *free,
                });
            }
            *free -= grow;
        } else {
            *free += lv.size - size;
        }
        lv.size = size;
        Ok(())
    }

    fn activate(&self, lv_name: &str) -> Result<()> {
        self.with_lv(lv_name, |lv| lv.active = true)
    }

    fn deactivate(&self, lv_name: &str) -> Result<()> {
        self.with_lv(lv_name, |lv| lv.active = false)
    }

    fn set_readonly(&self, lv_name: &str, read_only: bool) -> Result<()> {
        self.with_lv(lv_name, |lv| lv.read_only = read_only)
    }

    fn set_hidden(&self, lv_name: &str, hidden: bool) -> Result<()> {
        self.with_lv(lv_name, |lv| {
            if hidden {
                if !lv.tags.iter().any(|t| t == TAG_HIDDEN) {
                    lv.tags.push(TAG_HIDDEN.to_string());
                }
            } else {
                lv.tags.retain(|t| t != TAG_HIDDEN);
            }
        })
    }

    fn add_tag(&self, lv_name: &str, tag: &str) -> Result<()> {
        self.with_lv(lv_name, |lv| lv.tags.push(tag.to_string()))
    }

    fn refresh(&self, lv_name: &str) -> Result<()> {
        self.with_lv(lv_name, |_| ())?;
        self.refreshed.write().push(lv_name.to_string());
        Ok(())
    }

    fn exists(&self, lv_name: &str) -> Result<bool> {
        Ok(self.lvs.read().contains_key(lv_name))
    }

    fn get_info(&self, lv_name: &str) -> Result<LvInfo> {
        let lvs = self.lvs.read();
        let lv = lvs
            .get(lv_name)
            .ok_or_else(|| StorageError::LvNotFound(lv_name.to_string()))?;
        Ok(Self::info_of(lv_name, lv))
    }

    fn scan(&self) -> Result<HashMap<String, LvInfo>> {
        Ok(self
            .lvs
            .read()
            .iter()
            .map(|(name, lv)| (name.clone(), Self::info_of(name, lv)))
            .collect())
    }

    fn free_space(&self) -> Result<u64> {
        Ok(*self.free.read())
    }

    fn zero_range(&self, lv_name: &str, offset: u64, len: u64) -> Result<()> {
        self.with_lv(lv_name, |_| ())?;
        self.zeroed.write().push((lv_name.to_string(), offset, len));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lvhd_common::MIB;

    #[test]
    fn test_create_accounts_space() {
        let vg = MemVolumeManager::new("vg", 100 * MIB);
        vg.create("VHD-a", 10 * MIB).unwrap();
        assert_eq!(vg.free_space().unwrap(), 90 * MIB);
        vg.remove("VHD-a").unwrap();
        assert_eq!(vg.free_space().unwrap(), 100 * MIB);
    }

    #[test]
    fn test_create_rounds_to_increment() {
        let vg = MemVolumeManager::new("vg", 100 * MIB);
        vg.create("VHD-a", MIB + 1).unwrap();
        assert_eq!(vg.get_info("VHD-a").unwrap().size, LVM_SIZE_INCREMENT);
    }

    #[test]
    fn test_no_space() {
        let vg = MemVolumeManager::new("vg", 2 * MIB);
        let err = vg.create("VHD-a", 8 * MIB).unwrap_err();
        assert!(matches!(err, StorageError::SrNoSpace { .. }));
    }

    #[test]
    fn test_rename_and_hidden_tag() {
        let vg = MemVolumeManager::new("vg", 100 * MIB);
        vg.create("VHD-a", 4 * MIB).unwrap();
        vg.set_hidden("VHD-a", true).unwrap();
        vg.rename("VHD-a", "VHD-b").unwrap();
        assert!(!vg.exists("VHD-a").unwrap());
        let info = vg.get_info("VHD-b").unwrap();
        assert!(info.hidden);
        vg.set_hidden("VHD-b", false).unwrap();
        assert!(!vg.get_info("VHD-b").unwrap().hidden);
    }

    #[test]
    fn test_shrink_returns_space() {
        let vg = MemVolumeManager::new("vg", 100 * MIB);
        vg.create("VHD-a", 40 * MIB).unwrap();
        vg.set_size("VHD-a", 8 * MIB).unwrap();
        assert_eq!(vg.free_space().unwrap(), 92 * MIB);
    }
}
