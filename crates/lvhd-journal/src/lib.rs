//! Durable operation-intent journal
//!
//! A journal entry is a (type, object) → value record persisted before the
//! first destructive step of an operation and removed after the last. The
//! recovery pass at SR attach replays whatever is left. There can be only
//! one entry per (type, object).
//!
//! [`LvJournaler`] persists each entry as a small LV named
//! `journal_<type>_<object>`, carrying the value in an LV tag, so journal
//! durability rides on the same volume group as the data it protects.
//! [`MemJournaler`] is the in-memory fake for tests.

use lvhd_common::{Result, StorageError};
use lvhd_lvm::{LVM_SIZE_INCREMENT, VolumeManager};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Prefix of journal LV names
pub const JOURNAL_LV_PREFIX: &str = "journal_";

/// Prefix of the value-carrying LV tag
const VALUE_TAG_PREFIX: &str = "jv_";

/// Space one journal entry consumes; operations reserve this up front
pub const JOURNAL_ENTRY_SIZE: u64 = LVM_SIZE_INCREMENT;

/// Durable key→value entries, queried and removed by type+object
pub trait Journaler: Send + Sync {
    /// Persist an entry. Fails if one already exists for (type, object).
    fn create(&self, entry_type: &str, object: &str, value: &str) -> Result<()>;

    /// All outstanding entries of a type, keyed by object
    fn get_all(&self, entry_type: &str) -> Result<HashMap<String, String>>;

    /// The value of one entry, if present
    fn get(&self, entry_type: &str, object: &str) -> Result<Option<String>> {
        Ok(self.get_all(entry_type)?.remove(object))
    }

    /// Remove an entry; removing a missing entry is an error
    fn remove(&self, entry_type: &str, object: &str) -> Result<()>;
}

fn entry_lv_name(entry_type: &str, object: &str) -> String {
    format!("{JOURNAL_LV_PREFIX}{entry_type}_{object}")
}

/// Journal entries as tagged LVs in the SR's volume group
pub struct LvJournaler {
    lvm: Arc<dyn VolumeManager>,
}

impl LvJournaler {
    #[must_use]
    pub fn new(lvm: Arc<dyn VolumeManager>) -> Self {
        Self { lvm }
    }
}

impl Journaler for LvJournaler {
    fn create(&self, entry_type: &str, object: &str, value: &str) -> Result<()> {
        let lv_name = entry_lv_name(entry_type, object);
        if self.lvm.exists(&lv_name)? {
            return Err(StorageError::journal(format!(
                "journal entry already exists for {entry_type}/{object}"
            )));
        }
        self.lvm.create(&lv_name, JOURNAL_ENTRY_SIZE)?;
        self.lvm.add_tag(&lv_name, &format!("{VALUE_TAG_PREFIX}{value}"))?;
        // journal LVs are never read as devices
        self.lvm.deactivate(&lv_name)?;
        debug!(entry_type, object, value, "journal entry created");
        Ok(())
    }

    fn get_all(&self, entry_type: &str) -> Result<HashMap<String, String>> {
        let prefix = format!("{JOURNAL_LV_PREFIX}{entry_type}_");
        let mut entries = HashMap::new();
        for (name, lv_info) in self.lvm.scan()? {
            let Some(object) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(value) = lv_info
                .tags
                .iter()
                .find_map(|t| t.strip_prefix(VALUE_TAG_PREFIX))
            else {
                // a journal LV with no value tag was interrupted mid-create;
                // nothing destructive can have happened yet
                info!(lv = %name, "dropping valueless journal LV");
                self.lvm.remove(&name)?;
                continue;
            };
            entries.insert(object.to_string(), value.to_string());
        }
        Ok(entries)
    }

    fn remove(&self, entry_type: &str, object: &str) -> Result<()> {
        let lv_name = entry_lv_name(entry_type, object);
        if !self.lvm.exists(&lv_name)? {
            return Err(StorageError::journal(format!(
                "no journal entry for {entry_type}/{object}"
            )));
        }
        self.lvm.remove(&lv_name)?;
        debug!(entry_type, object, "journal entry removed");
        Ok(())
    }
}

/// In-memory journal for tests
#[derive(Default)]
pub struct MemJournaler {
    entries: RwLock<HashMap<(String, String), String>>,
}

impl MemJournaler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Journaler for MemJournaler {
    fn create(&self, entry_type: &str, object: &str, value: &str) -> Result<()> {
        let key = (entry_type.to_string(), object.to_string());
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(StorageError::journal(format!(
                "journal entry already exists for {entry_type}/{object}"
            )));
        }
        entries.insert(key, value.to_string());
        Ok(())
    }

    fn get_all(&self, entry_type: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|((t, _), _)| t == entry_type)
            .map(|((_, obj), val)| (obj.clone(), val.clone()))
            .collect())
    }

    fn remove(&self, entry_type: &str, object: &str) -> Result<()> {
        let key = (entry_type.to_string(), object.to_string());
        if self.entries.write().remove(&key).is_none() {
            return Err(StorageError::journal(format!(
                "no journal entry for {entry_type}/{object}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lvhd_common::GIB;
    use lvhd_lvm::MemVolumeManager;

    fn lv_journaler() -> (Arc<MemVolumeManager>, LvJournaler) {
        let lvm = Arc::new(MemVolumeManager::new("vg", GIB));
        let journaler = LvJournaler::new(lvm.clone());
        (lvm, journaler)
    }

    #[test]
    fn test_create_get_remove() {
        let (_, journaler) = lv_journaler();
        journaler.create("clone", "uuid-1", "base_orig").unwrap();
        journaler.create("clone", "uuid-2", "b2_o2").unwrap();
        journaler.create("inflate", "uuid-1", "1073741824").unwrap();

        let clones = journaler.get_all("clone").unwrap();
        assert_eq!(clones.len(), 2);
        assert_eq!(clones["uuid-1"], "base_orig");
        assert_eq!(
            journaler.get("inflate", "uuid-1").unwrap().as_deref(),
            Some("1073741824")
        );

        journaler.remove("clone", "uuid-1").unwrap();
        assert!(journaler.get("clone", "uuid-1").unwrap().is_none());
        assert_eq!(journaler.get_all("clone").unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_create_fails() {
        let (_, journaler) = lv_journaler();
        journaler.create("clone", "uuid-1", "v").unwrap();
        assert!(journaler.create("clone", "uuid-1", "v2").is_err());
    }

    #[test]
    fn test_remove_missing_fails() {
        let (_, journaler) = lv_journaler();
        assert!(journaler.remove("clone", "nope").is_err());
    }

    #[test]
    fn test_entry_is_backed_by_lv() {
        let (lvm, journaler) = lv_journaler();
        journaler.create("clone", "uuid-1", "v").unwrap();
        assert!(lvm.exists("journal_clone_uuid-1").unwrap());
        journaler.remove("clone", "uuid-1").unwrap();
        assert!(!lvm.exists("journal_clone_uuid-1").unwrap());
    }

    #[test]
    fn test_valueless_entry_dropped_on_scan() {
        let (lvm, journaler) = lv_journaler();
        // simulate a crash between lvcreate and tagging
        lvm.create("journal_clone_uuid-9", JOURNAL_ENTRY_SIZE).unwrap();
        let entries = journaler.get_all("clone").unwrap();
        assert!(entries.is_empty());
        assert!(!lvm.exists("journal_clone_uuid-9").unwrap());
    }

    #[test]
    fn test_mem_journaler_contract() {
        let journaler = MemJournaler::new();
        journaler.create("inflate", "u", "123").unwrap();
        assert!(journaler.create("inflate", "u", "456").is_err());
        assert_eq!(journaler.get("inflate", "u").unwrap().as_deref(), Some("123"));
        journaler.remove("inflate", "u").unwrap();
        assert!(journaler.remove("inflate", "u").is_err());
    }
}
