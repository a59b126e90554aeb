//! Snapshot/clone state machine
//!
//! A snapshot copy-on-write-forks a leaf through rename/create/hide steps:
//!
//! ```text
//! START -> JOURNALED -> RENAMED -> CHILDREN_CREATED -> HIDDEN
//!       -> REFRESHED -> FINALIZED
//! ```
//!
//! The journal entry written before the rename is the single commit point:
//! once it exists the operation is deterministically either completed or
//! undone, inline on an error or by [`CloneEngine::recover`] at the next
//! SR attach after a crash. There is no cancellation after that point.

use crate::fault::FaultPoints;
use crate::sizing::{calc_size_vhd_lv, thin_leaf_size};
use crate::thin::ThinProvisionEngine;
use crate::{JRN_CLONE, RemoteRefresher};

use chrono::{SecondsFormat, Utc};
use lvhd_common::{
    Provisioning, Result, SrConfig, StorageError, VdiMetadataRecord, VdiType,
};
use lvhd_journal::{JOURNAL_ENTRY_SIZE, Journaler};
use lvhd_lvm::{VolumeManager, lv_name_of};
use lvhd_metadata::{MetadataStore, MetadataUpdate};
use lvhd_refcount::RefCounter;
use lvhd_vhd::{MAX_CHAIN_SIZE, VhdTool};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// What kind of fork to perform
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotMode {
    /// One read-only parent, no new writable clone leaf; the base is the
    /// snapshot
    Single,
    /// Parent plus a new writable clone leaf
    Double,
    /// Like `Single`, but SR-level virtual-allocation accounting is left
    /// untouched
    Internal,
}

#[derive(Clone, Copy, Debug)]
pub struct SnapshotParams {
    pub mode: SnapshotMode,
    /// The disk is attached on other hosts: leaves get full provisioning
    /// so a later attach there never depends on an inflate racing this
    /// host, and those hosts are told to refresh their LVM view
    pub attached_on_other_hosts: bool,
}

#[derive(Clone, Debug)]
pub struct SnapshotResult {
    /// New uuid of the hidden, read-only base copy
    pub base_uuid: String,
    /// New writable leaf, `Double` mode only
    pub clone_uuid: Option<String>,
    /// Virtual size of the forked disk
    pub size_virt: u64,
}

struct CloneOp<'a> {
    orig_uuid: &'a str,
    base_uuid: &'a str,
    clon_uuid: Option<&'a str>,
    orig_type: VdiType,
    leaf_size: u64,
    attached_elsewhere: bool,
}

pub struct CloneEngine {
    config: SrConfig,
    lvm: Arc<dyn VolumeManager>,
    vhd: Arc<dyn VhdTool>,
    journal: Arc<dyn Journaler>,
    refcount: Arc<RefCounter>,
    metadata: Arc<MetadataStore>,
    thin: ThinProvisionEngine,
    remote: Arc<dyn RemoteRefresher>,
    faults: Arc<FaultPoints>,
}

impl CloneEngine {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: SrConfig,
        lvm: Arc<dyn VolumeManager>,
        vhd: Arc<dyn VhdTool>,
        journal: Arc<dyn Journaler>,
        refcount: Arc<RefCounter>,
        metadata: Arc<MetadataStore>,
        thin: ThinProvisionEngine,
        remote: Arc<dyn RemoteRefresher>,
        faults: Arc<FaultPoints>,
    ) -> Self {
        Self {
            config,
            lvm,
            vhd,
            journal,
            refcount,
            metadata,
            thin,
            remote,
            faults,
        }
    }

    fn namespace(&self) -> String {
        self.config.lvm_namespace()
    }

    /// LV of a VDI whose type is not known up front
    fn lookup_lv(&self, uuid: &str) -> Result<Option<(VdiType, String)>> {
        for vdi_type in [VdiType::Vhd, VdiType::Raw] {
            let lv_name = lv_name_of(vdi_type, uuid);
            if self.lvm.exists(&lv_name)? {
                return Ok(Some((vdi_type, lv_name)));
            }
        }
        Ok(None)
    }

    /// Copy-on-write-fork `orig_uuid`. On success the original uuid refers
    /// to a fresh writable leaf over the new base; the returned base uuid
    /// identifies the hidden, read-only copy of the old state.
    pub fn snapshot(&self, orig_uuid: &str, params: &SnapshotParams) -> Result<SnapshotResult> {
        let (orig_type, orig_lv) = self
            .lookup_lv(orig_uuid)?
            .ok_or_else(|| StorageError::VdiNotFound(orig_uuid.to_string()))?;
        let orig_info = self.lvm.get_info(&orig_lv)?;
        if orig_info.hidden {
            return Err(StorageError::unavailable(orig_uuid, "VDI is hidden"));
        }
        if !orig_info.active {
            self.lvm.activate(&orig_lv)?;
        }
        let orig_path = self.lvm.lv_path(&orig_lv);

        // rejected before any mutation
        if orig_type == VdiType::Vhd {
            let depth = self.vhd.get_depth(&orig_path)?;
            if depth >= MAX_CHAIN_SIZE {
                return Err(StorageError::unavailable(
                    orig_uuid,
                    format!("VHD chain depth {depth} at limit {MAX_CHAIN_SIZE}"),
                ));
            }
        }

        let base_uuid = Uuid::new_v4().to_string();
        let clon_uuid =
            (params.mode == SnapshotMode::Double).then(|| Uuid::new_v4().to_string());

        let size_virt = match orig_type {
            VdiType::Vhd => self.vhd.get_size_virt(&orig_path)?,
            VdiType::Raw => orig_info.size,
        };

        let thin_leaves = self.config.provisioning == Provisioning::Thin
            && !params.attached_on_other_hosts;
        let leaf_size = if thin_leaves {
            thin_leaf_size()
        } else {
            calc_size_vhd_lv(size_virt)
        };

        // estimate before the first destructive step; room for the leaves
        // plus two journal LVs
        let leaf_count = 1 + u64::from(clon_uuid.is_some());
        let required = leaf_count * leaf_size + 2 * JOURNAL_ENTRY_SIZE;
        let available = self.lvm.free_space()?;
        if available < required {
            return Err(StorageError::SrNoSpace {
                required,
                available,
            });
        }
        // the fork introduces as many metadata records as leaves; prove
        // they fit while the operation can still be refused cleanly
        self.metadata
            .ensure_space_is_available_for_vdis(leaf_count as usize)?;

        // the single commit point; keyed by the clone uuid, or by the
        // original uuid in the modes that create no clone leaf
        let jrn_key = clon_uuid.clone().unwrap_or_else(|| orig_uuid.to_string());
        let jrn_val = format!("{base_uuid}_{orig_uuid}");
        self.journal.create(JRN_CLONE, &jrn_key, &jrn_val)?;
        info!(orig_uuid, %base_uuid, mode = ?params.mode, "snapshot journaled");

        let prev_refcount = self.refcount.check(&self.namespace(), orig_uuid)?;
        let op = CloneOp {
            orig_uuid,
            base_uuid: &base_uuid,
            clon_uuid: clon_uuid.as_deref(),
            orig_type,
            leaf_size,
            attached_elsewhere: params.attached_on_other_hosts,
        };

        if let Err(e) = self.run_clone_steps(&op) {
            warn!(orig_uuid, error = %e, "snapshot failed, rolling back");
            self.undo_clone_op(orig_uuid, &base_uuid, clon_uuid.as_deref(), Some(prev_refcount))?;
            self.journal.remove(JRN_CLONE, &jrn_key)?;
            return Err(StorageError::VdiClone(e.to_string()));
        }

        // the "done" commit point
        self.journal.remove(JRN_CLONE, &jrn_key)?;

        self.finalize_clone_op(orig_uuid, &base_uuid, clon_uuid.as_deref())?;
        info!(orig_uuid, %base_uuid, "snapshot complete");
        Ok(SnapshotResult {
            base_uuid,
            clone_uuid: clon_uuid,
            size_virt,
        })
    }

    /// Steps between the journal commit points; any failure here rolls the
    /// operation back before the error is re-raised
    fn run_clone_steps(&self, op: &CloneOp<'_>) -> Result<()> {
        self.faults.fire("clone.journaled")?;
        let ns = self.namespace();
        let base_lv = lv_name_of(op.orig_type, op.base_uuid);
        let orig_old_lv = lv_name_of(op.orig_type, op.orig_uuid);

        // the original LV becomes the base; activation bookkeeping now
        // refers to it under the new uuid
        self.lvm.rename(&orig_old_lv, &base_lv)?;
        self.refcount.set(&ns, op.base_uuid, 1, 0)?;
        self.faults.fire("clone.renamed")?;

        let base_path = self.lvm.lv_path(&base_lv);

        // shrink the base before creating children so the fork never
        // consumes two full copies of space at once
        if op.orig_type == VdiType::Vhd {
            let phys = self.vhd.get_size_phys(&base_path)?;
            self.thin.deflate(&base_lv, phys)?;
        }
        self.faults.fire("clone.deflated")?;

        self.create_leaf(op.orig_uuid, &base_path, op.leaf_size)?;
        if let Some(clon_uuid) = op.clon_uuid {
            self.create_leaf(clon_uuid, &base_path, op.leaf_size)?;
        }
        self.faults.fire("clone.children")?;

        // hide strictly after the children exist: an apparently
        // unreferenced hidden parent is collectable
        if op.orig_type == VdiType::Vhd {
            self.vhd.set_hidden(&base_path, true)?;
        }
        self.lvm.set_hidden(&base_lv, true)?;
        self.lvm.set_readonly(&base_lv, true)?;
        self.faults.fire("clone.hidden")?;

        if op.attached_elsewhere {
            self.remote.refresh(&base_lv)?;
            self.remote.refresh(&lv_name_of(VdiType::Vhd, op.orig_uuid))?;
        }
        self.faults.fire("clone.refreshed")?;
        Ok(())
    }

    /// VHD-snapshot the base onto a fresh leaf LV
    fn create_leaf(&self, leaf_uuid: &str, base_path: &Path, size: u64) -> Result<()> {
        let leaf_lv = lv_name_of(VdiType::Vhd, leaf_uuid);
        self.lvm.create(&leaf_lv, size)?;
        self.vhd.snapshot(&self.lvm.lv_path(&leaf_lv), base_path)
    }

    /// Roll the fork back to the pre-journal state. Safe at any point
    /// after the journal entry exists: every sub-step checks what is
    /// actually on disk.
    fn undo_clone_op(
        &self,
        orig_uuid: &str,
        base_uuid: &str,
        clon_uuid: Option<&str>,
        prev_refcount: Option<(u32, u32)>,
    ) -> Result<()> {
        let ns = self.namespace();
        let Some((base_type, base_lv)) = self.lookup_lv(base_uuid)? else {
            // rename never happened, the original is intact
            return Ok(());
        };
        info!(orig_uuid, base_uuid, "undoing clone");

        let base_info = self.lvm.get_info(&base_lv)?;
        if base_info.read_only {
            self.lvm.set_readonly(&base_lv, false)?;
        }
        if !base_info.active {
            self.lvm.activate(&base_lv)?;
        }
        let base_path = self.lvm.lv_path(&base_lv);

        // the base was deflated mid-fork; restore full provisioning
        if base_type == VdiType::Vhd {
            let size_virt = self.vhd.get_size_virt(&base_path)?;
            self.thin.inflate(base_uuid, calc_size_vhd_lv(size_virt))?;
        }

        // drop partially-created children before the rename frees the name
        if let Some(clon_uuid) = clon_uuid {
            let clon_lv = lv_name_of(VdiType::Vhd, clon_uuid);
            if self.lvm.exists(&clon_lv)? {
                self.lvm.remove(&clon_lv)?;
            }
        }
        let orig_leaf = lv_name_of(VdiType::Vhd, orig_uuid);
        if self.lvm.exists(&orig_leaf)? {
            self.lvm.remove(&orig_leaf)?;
        }

        let orig_lv = lv_name_of(base_type, orig_uuid);
        self.lvm.rename(&base_lv, &orig_lv)?;

        let orig_path = self.lvm.lv_path(&orig_lv);
        if base_type == VdiType::Vhd && self.vhd.get_hidden(&orig_path)? {
            self.vhd.set_hidden(&orig_path, false)?;
        }
        if self.lvm.get_info(&orig_lv)?.hidden {
            self.lvm.set_hidden(&orig_lv, false)?;
        }

        self.refcount.reset(&ns, base_uuid)?;
        if let Some((count, bin)) = prev_refcount {
            self.refcount.set(&ns, orig_uuid, count, bin)?;
        }
        Ok(())
    }

    /// Final bookkeeping once the on-disk fork is complete. Every sub-step
    /// is independently idempotent (skip-if-present), so a crash mid-way
    /// just means finalize runs again from the top at the next attach.
    fn finalize_clone_op(
        &self,
        orig_uuid: &str,
        base_uuid: &str,
        clon_uuid: Option<&str>,
    ) -> Result<()> {
        let ns = self.namespace();
        let Some((base_type, base_lv)) = self.lookup_lv(base_uuid)? else {
            return Err(StorageError::unexpected(format!(
                "base LV for {base_uuid} missing at finalize"
            )));
        };
        let base_path = self.lvm.lv_path(&base_lv);

        // if neither child actually points at the base, a concurrent
        // anomaly owns the chain: drop the orphaned base rather than
        // introduce it
        let mut adopted = false;
        let mut leaves = vec![orig_uuid];
        leaves.extend(clon_uuid);
        for leaf in &leaves {
            let leaf_lv = lv_name_of(VdiType::Vhd, leaf);
            if !self.lvm.exists(&leaf_lv)? {
                continue;
            }
            let parent = self.vhd.get_parent(&self.lvm.lv_path(&leaf_lv))?;
            if parent.as_deref() == Some(base_path.as_path()) {
                adopted = true;
            }
        }
        if !adopted {
            warn!(base_uuid, "no child references the base, deleting orphan");
            self.lvm.remove(&base_lv)?;
            self.refcount.reset(&ns, base_uuid)?;
            if self.metadata.find_vdi(base_uuid)?.is_some() {
                self.metadata.delete_vdi(base_uuid)?;
            }
            return Ok(());
        }

        // the base's hold is derived from the leaf it replaced
        let (_, orig_bin) = self.refcount.check(&ns, orig_uuid)?;
        self.refcount.set(&ns, base_uuid, orig_bin + 1, orig_bin)?;

        let snapshot_time = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let orig_rec = self.metadata.find_vdi(orig_uuid)?.map(|(_, rec)| rec);

        if self.metadata.find_vdi(base_uuid)?.is_none() {
            let mut rec = VdiMetadataRecord::new(base_uuid, base_type);
            rec.hide();
            if clon_uuid.is_none() {
                // no clone leaf: the base itself is the snapshot handed
                // back to the caller
                rec.is_a_snapshot = true;
                rec.snapshot_of = orig_uuid.to_string();
                rec.snapshot_time = snapshot_time.clone();
            }
            if let Some(orig_rec) = &orig_rec {
                rec.name_label = orig_rec.name_label.clone();
                rec.name_description = orig_rec.name_description.clone();
            }
            self.metadata.add_vdi(&rec)?;
        }

        if let Some(clon) = clon_uuid {
            if self.metadata.find_vdi(clon)?.is_none() {
                let mut rec = VdiMetadataRecord::new(clon, VdiType::Vhd);
                rec.is_a_snapshot = true;
                rec.snapshot_of = orig_uuid.to_string();
                rec.snapshot_time = snapshot_time;
                if let Some(orig_rec) = &orig_rec {
                    rec.name_label = orig_rec.name_label.clone();
                    rec.name_description = orig_rec.name_description.clone();
                }
                self.metadata.add_vdi(&rec)?;
            }
        }

        // the original's stored format follows the on-disk reality: the
        // re-created leaf is always VHD
        if let Some(mut rec) = orig_rec {
            if rec.vdi_type != VdiType::Vhd {
                rec.vdi_type = VdiType::Vhd;
                self.metadata.update_metadata(&MetadataUpdate::Vdi(rec))?;
            }
        }

        let orig_leaf_lv = lv_name_of(VdiType::Vhd, orig_uuid);
        if self.lvm.exists(&orig_leaf_lv)?
            && self.vhd.get_parent(&self.lvm.lv_path(&orig_leaf_lv))?.as_deref()
                != Some(base_path.as_path())
        {
            warn!(orig_uuid, "original leaf does not reference the new base");
        }
        Ok(())
    }

    /// Replay every outstanding clone journal entry. Runs unconditionally
    /// at SR attach, before any new operation is permitted.
    pub fn recover(&self) -> Result<()> {
        for (key, value) in self.journal.get_all(JRN_CLONE)? {
            let Some((base_uuid, orig_uuid)) = value.split_once('_') else {
                return Err(StorageError::unexpected(format!(
                    "malformed clone journal value {value:?}"
                )));
            };
            // entries keyed by the original uuid come from the modes that
            // create no clone leaf
            let clon_uuid = (key != orig_uuid).then_some(key.as_str());
            self.recover_one(orig_uuid, base_uuid, clon_uuid)?;
            self.journal.remove(JRN_CLONE, &key)?;
        }
        Ok(())
    }

    fn recover_one(
        &self,
        orig_uuid: &str,
        base_uuid: &str,
        clon_uuid: Option<&str>,
    ) -> Result<()> {
        if self.lookup_lv(base_uuid)?.is_none() {
            if self.lookup_lv(orig_uuid)?.is_some() {
                // journaled but the rename never happened; the original is
                // intact and there is nothing to undo
                info!(orig_uuid, "clone never started, dropping journal entry");
                return Ok(());
            }
            return Err(StorageError::unexpected(format!(
                "neither base {base_uuid} nor original {orig_uuid} exists"
            )));
        }

        if self.children_intact(orig_uuid, clon_uuid)? {
            info!(orig_uuid, base_uuid, "completing interrupted clone");
            self.finalize_clone_op(orig_uuid, base_uuid, clon_uuid)
        } else {
            info!(orig_uuid, base_uuid, "undoing interrupted clone");
            self.undo_clone_op(orig_uuid, base_uuid, clon_uuid, None)
        }
    }

    /// All expected children exist and pass the VHD validator
    fn children_intact(&self, orig_uuid: &str, clon_uuid: Option<&str>) -> Result<bool> {
        let mut leaves = vec![orig_uuid];
        leaves.extend(clon_uuid);
        for leaf in leaves {
            let leaf_lv = lv_name_of(VdiType::Vhd, leaf);
            if !self.lvm.exists(&leaf_lv)? {
                return Ok(false);
            }
            if !self.lvm.get_info(&leaf_lv)?.active {
                self.lvm.activate(&leaf_lv)?;
            }
            if !self.vhd.check(&self.lvm.lv_path(&leaf_lv))? {
                warn!(leaf, "VHD integrity check failed");
                return Ok(false);
            }
        }
        Ok(true)
    }
}
