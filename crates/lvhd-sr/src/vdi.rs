//! VDI lifecycle operations
//!
//! create/resize/delete/attach/detach on top of the engines. A VDI is
//! never physically destroyed here: deletion hides the node and tombstones
//! its record, and the out-of-process collector reclaims it once nothing
//! references it.

use crate::sizing::{calc_size_lv, calc_size_vhd_lv, thin_leaf_size};
use crate::sr::Sr;

use lvhd_common::{Provisioning, Result, StorageError, VdiMetadataRecord, VdiType};
use lvhd_lvm::{VolumeManager, lv_name_of};
use lvhd_vhd::{MAX_CHAIN_SIZE, VhdTool};
use std::path::PathBuf;
use tracing::info;

impl Sr {
    /// Create a new VDI: LV sized by the provisioning policy, VHD
    /// formatting when requested, metadata record introduced
    pub fn create_vdi(
        &self,
        uuid: &str,
        size_virt: u64,
        vdi_type: VdiType,
        name_label: &str,
        name_description: &str,
    ) -> Result<VdiMetadataRecord> {
        self.ensure_attached()?;
        let _guard = self.lock().acquire()?;

        let lv_name = lv_name_of(vdi_type, uuid);
        if self.lvm().exists(&lv_name)? {
            return Err(StorageError::VdiCreate(format!("uuid {uuid} already in use")));
        }

        let lv_size = match (vdi_type, self.config().provisioning) {
            (VdiType::Raw, _) => calc_size_lv(size_virt),
            (VdiType::Vhd, Provisioning::Thin) => thin_leaf_size(),
            (VdiType::Vhd, Provisioning::Thick) => calc_size_vhd_lv(size_virt),
        };
        let available = self.lvm().free_space()?;
        if available < lv_size {
            return Err(StorageError::SrNoSpace {
                required: lv_size,
                available,
            });
        }

        self.lvm().create(&lv_name, lv_size)?;
        if vdi_type == VdiType::Vhd {
            if let Err(e) = self
                .vhd()
                .create(&self.lvm().lv_path(&lv_name), size_virt, true)
            {
                self.lvm().remove(&lv_name)?;
                return Err(StorageError::VdiCreate(e.to_string()));
            }
        }

        let mut rec = VdiMetadataRecord::new(uuid, vdi_type);
        rec.name_label = name_label.to_string();
        rec.name_description = name_description.to_string();
        if let Err(e) = self.metadata().add_vdi(&rec) {
            self.lvm().remove(&lv_name)?;
            return Err(StorageError::VdiCreate(e.to_string()));
        }

        self.add_virtual_allocation(size_virt);
        info!(uuid, size_virt, ?vdi_type, "VDI created");
        Ok(rec)
    }

    /// Grow a VDI's virtual size; shrinking is rejected. The physical grow
    /// for thick provisioning goes through the journaled inflate path.
    pub fn resize_vdi(&self, uuid: &str, new_size_virt: u64) -> Result<u64> {
        self.ensure_attached()?;
        let _guard = self.lock().acquire()?;

        let (vdi_type, lv_name) = self.lookup_vdi_lv(uuid)?;
        let path = self.lvm().lv_path(&lv_name);
        let current = match vdi_type {
            VdiType::Vhd => self.vhd().get_size_virt(&path)?,
            VdiType::Raw => self.lvm().get_info(&lv_name)?.size,
        };
        if new_size_virt < current {
            return Err(StorageError::VdiResize(
                "shrinking is not supported".to_string(),
            ));
        }
        if new_size_virt == current {
            return Ok(current);
        }

        match vdi_type {
            VdiType::Raw => self.lvm().set_size(&lv_name, calc_size_lv(new_size_virt))?,
            VdiType::Vhd => {
                if self.config().provisioning == Provisioning::Thick {
                    self.thin.inflate(uuid, calc_size_vhd_lv(new_size_virt))?;
                }
                self.vhd()
                    .set_size_virt(&path, new_size_virt)
                    .map_err(|e| StorageError::VdiResize(e.to_string()))?;
            }
        }

        self.add_virtual_allocation(new_size_virt - current);
        info!(uuid, current, new_size_virt, "VDI resized");
        Ok(new_size_virt)
    }

    /// Logically destroy a VDI: hide it, tombstone its record and leave
    /// physical reclamation to the collector
    pub fn delete_vdi(&self, uuid: &str) -> Result<()> {
        self.ensure_attached()?;
        let _guard = self.lock().acquire()?;

        let (vdi_type, lv_name) = self.lookup_vdi_lv(uuid)?;
        let lv_info = self.lvm().get_info(&lv_name)?;
        if lv_info.open {
            return Err(StorageError::VdiDelete(format!("VDI {uuid} is in use")));
        }

        let index = self.parent_child_index()?;
        let path = self.lvm().lv_path(&lv_name);
        let size_virt = match vdi_type {
            VdiType::Vhd => self.vhd().get_size_virt(&path)?,
            VdiType::Raw => lv_info.size,
        };

        if vdi_type == VdiType::Vhd {
            self.vhd().set_hidden(&path, true)?;
        }
        self.lvm().set_hidden(&lv_name, true)?;
        if index.has_children(uuid) {
            // a hidden node with descendants must not be writable
            self.lvm().set_readonly(&lv_name, true)?;
        }
        if lv_info.active {
            self.lvm().deactivate(&lv_name)?;
        }

        if self.metadata().find_vdi(uuid)?.is_some() {
            self.metadata().delete_vdi(uuid)?;
        }
        self.refcounter()
            .reset(&self.config().lvm_namespace(), uuid)?;

        self.sub_virtual_allocation(size_virt);
        self.gc().kick();
        info!(uuid, "VDI deleted (hidden, pending reclaim)");
        Ok(())
    }

    /// Attach: activate the whole chain with refcount bookkeeping, then
    /// inflate thin volumes to their fully-allocated size
    pub fn attach_vdi(&self, uuid: &str) -> Result<PathBuf> {
        self.ensure_attached()?;
        let ns = self.config().lvm_namespace();
        let (vdi_type, lv_name) = self.lookup_vdi_lv(uuid)?;

        {
            let _guard = self.lock().acquire()?;
            let index = self.parent_child_index()?;
            if index.ancestors(uuid).len() as u32 >= MAX_CHAIN_SIZE {
                return Err(StorageError::unavailable(uuid, "VHD chain too deep"));
            }

            // one unit per attach on the leaf; ancestors carry a derived
            // binary hold only
            self.refcounter().get(&ns, uuid, false)?;
            if !self.lvm().get_info(&lv_name)?.active {
                self.lvm().activate(&lv_name)?;
            }
            for ancestor in index.ancestors(uuid) {
                self.refcounter().get(&ns, &ancestor, true)?;
                if let Some((_, anc_lv)) = self.lookup_lv_any(&ancestor)? {
                    if !self.lvm().get_info(&anc_lv)?.active {
                        self.lvm().activate(&anc_lv)?;
                    }
                }
            }
        }
        // attach_thin takes the SR lock itself, so it runs outside ours

        if vdi_type == VdiType::Vhd && self.config().provisioning == Provisioning::Thin {
            self.thin.attach_thin(uuid)?;
        }
        Ok(self.lvm().lv_path(&lv_name))
    }

    /// Detach: drop refcounts, deactivate what nothing holds any more,
    /// then deflate thin volumes back to their content size
    pub fn detach_vdi(&self, uuid: &str) -> Result<()> {
        self.ensure_attached()?;
        let ns = self.config().lvm_namespace();
        let (vdi_type, lv_name) = self.lookup_vdi_lv(uuid)?;

        {
            let _guard = self.lock().acquire()?;
            let index = self.parent_child_index()?;
            let (count, _) = self.refcounter().put(&ns, uuid, false)?;
            if count == 0 {
                let lv_info = self.lvm().get_info(&lv_name)?;
                if lv_info.active && !lv_info.open {
                    self.lvm().deactivate(&lv_name)?;
                }
                for ancestor in index.ancestors(uuid) {
                    if index.derived_hold(self.refcounter(), &ns, &ancestor)? == 0 {
                        self.refcounter().put(&ns, &ancestor, true)?;
                        if let Some((_, anc_lv)) = self.lookup_lv_any(&ancestor)? {
                            if self.lvm().get_info(&anc_lv)?.active {
                                self.lvm().deactivate(&anc_lv)?;
                            }
                        }
                    }
                }
            }
        }

        if vdi_type == VdiType::Vhd && self.config().provisioning == Provisioning::Thin {
            self.thin.detach_thin(uuid)?;
        }
        Ok(())
    }

    fn lookup_vdi_lv(&self, uuid: &str) -> Result<(VdiType, String)> {
        self.lookup_lv_any(uuid)?
            .ok_or_else(|| StorageError::VdiNotFound(uuid.to_string()))
    }

    fn lookup_lv_any(&self, uuid: &str) -> Result<Option<(VdiType, String)>> {
        for vdi_type in [VdiType::Vhd, VdiType::Raw] {
            let lv_name = lv_name_of(vdi_type, uuid);
            if self.lvm().exists(&lv_name)? {
                return Ok(Some((vdi_type, lv_name)));
            }
        }
        Ok(None)
    }
}
