//! Parent/child chain index
//!
//! Built fresh from an LV scan every time VDIs are loaded and passed
//! explicitly to whatever needs chain lookups; there is deliberately no
//! process-wide genealogy state.

use lvhd_common::Result;
use lvhd_lvm::{VolumeManager, parse_lv_name};
use lvhd_refcount::RefCounter;
use lvhd_vhd::VhdTool;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct ParentChildIndex {
    parent_of: HashMap<String, String>,
    children_of: HashMap<String, Vec<String>>,
}

impl ParentChildIndex {
    /// Scan the VG and read every VHD node's parent pointer
    pub fn build(lvm: &dyn VolumeManager, vhd: &dyn VhdTool) -> Result<Self> {
        let mut index = Self::default();
        for (lv_name, info) in lvm.scan()? {
            let Some((vdi_type, uuid)) = parse_lv_name(&lv_name) else {
                continue;
            };
            if vdi_type != lvhd_common::VdiType::Vhd {
                continue;
            }
            let parent_path = match vhd.get_parent(&lvm.lv_path(&lv_name)) {
                Ok(parent) => parent,
                // an inactive LV has no device node to query
                Err(_) if !info.active => continue,
                Err(e) => return Err(e),
            };
            let Some(parent_path) = parent_path else {
                continue;
            };
            let Some(parent_uuid) = parent_path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| parse_lv_name(n).map(|(_, u)| u.to_string()))
            else {
                continue;
            };
            index.link(uuid.to_string(), parent_uuid);
        }
        Ok(index)
    }

    fn link(&mut self, child: String, parent: String) {
        self.children_of
            .entry(parent.clone())
            .or_default()
            .push(child.clone());
        self.parent_of.insert(child, parent);
    }

    #[must_use]
    pub fn parent(&self, uuid: &str) -> Option<&str> {
        self.parent_of.get(uuid).map(String::as_str)
    }

    #[must_use]
    pub fn children(&self, uuid: &str) -> &[String] {
        self.children_of.get(uuid).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn has_children(&self, uuid: &str) -> bool {
        !self.children(uuid).is_empty()
    }

    /// Chain from `uuid` (exclusive) to the root, nearest parent first
    #[must_use]
    pub fn ancestors(&self, uuid: &str) -> Vec<String> {
        let mut chain: Vec<String> = Vec::new();
        let mut cursor = uuid.to_string();
        while let Some(parent) = self.parent(&cursor) {
            // a cycle would mean corrupt parent pointers; stop rather than
            // spin
            if chain.iter().any(|c| c == parent) || parent == uuid {
                break;
            }
            cursor = parent.to_string();
            chain.push(cursor.clone());
        }
        chain
    }

    /// Derived hold count of an inner node: the sum of its children's
    /// holds, where a leaf's hold is its persisted activation state.
    /// Inner-node refcounts are never tracked independently.
    pub fn derived_hold(
        &self,
        refcount: &RefCounter,
        namespace: &str,
        uuid: &str,
    ) -> Result<u32> {
        let children = self.children(uuid);
        if children.is_empty() {
            let (count, bin) = refcount.check(namespace, uuid)?;
            return Ok(count.max(bin));
        }
        let mut total = 0;
        for child in children {
            total += self.derived_hold(refcount, namespace, child)?;
        }
        Ok(total)
    }
}
