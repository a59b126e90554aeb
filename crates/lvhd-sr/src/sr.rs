//! The per-SR handle
//!
//! Bundles the engines with the SR-wide lock and owns the attach-time
//! recovery pass. No storage operation is permitted until [`Sr::attach`]
//! has replayed every outstanding journal entry.

use crate::clone::{CloneEngine, SnapshotMode, SnapshotParams, SnapshotResult};
use crate::fault::FaultPoints;
use crate::index::ParentChildIndex;
use crate::lock::SrLock;
use crate::thin::ThinProvisionEngine;
use crate::{GcControl, JRN_LEAF, RemoteRefresher};

use lvhd_common::{Result, SrConfig, StorageError};
use lvhd_journal::Journaler;
use lvhd_lvm::{MGT_LV_NAME, VolumeManager, parse_lv_name};
use lvhd_metadata::MetadataStore;
use lvhd_refcount::RefCounter;
use lvhd_vhd::VhdTool;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

#[derive(Debug, Default)]
struct SrStats {
    virtual_allocation: u64,
}

pub struct Sr {
    config: SrConfig,
    lvm: Arc<dyn VolumeManager>,
    vhd: Arc<dyn VhdTool>,
    journal: Arc<dyn Journaler>,
    refcount: Arc<RefCounter>,
    metadata: Arc<MetadataStore>,
    lock: Arc<SrLock>,
    gc: Arc<dyn GcControl>,
    pub(crate) thin: ThinProvisionEngine,
    clone_engine: CloneEngine,
    faults: Arc<FaultPoints>,
    stats: Mutex<SrStats>,
    attached: AtomicBool,
}

impl Sr {
    pub fn new(
        config: SrConfig,
        lvm: Arc<dyn VolumeManager>,
        vhd: Arc<dyn VhdTool>,
        journal: Arc<dyn Journaler>,
        metadata: Arc<MetadataStore>,
        gc: Arc<dyn GcControl>,
        remote: Arc<dyn RemoteRefresher>,
    ) -> Self {
        let refcount = Arc::new(RefCounter::new(&config.refcount_dir));
        let lock = Arc::new(SrLock::new(&config));
        let faults = Arc::new(FaultPoints::new());
        let thin = ThinProvisionEngine::new(
            lvm.clone(),
            vhd.clone(),
            journal.clone(),
            refcount.clone(),
            config.lvm_namespace(),
            lock.clone(),
            faults.clone(),
        );
        let clone_engine = CloneEngine::new(
            config.clone(),
            lvm.clone(),
            vhd.clone(),
            journal.clone(),
            refcount.clone(),
            metadata.clone(),
            thin.clone(),
            remote,
            faults.clone(),
        );
        Self {
            config,
            lvm,
            vhd,
            journal,
            refcount,
            metadata,
            lock,
            gc,
            thin,
            clone_engine,
            faults,
            stats: Mutex::new(SrStats::default()),
            attached: AtomicBool::new(false),
        }
    }

    /// Attach the SR. Replays every outstanding journal entry before the
    /// SR becomes usable; a crash-interrupted operation is either
    /// completed or undone here, never surfaced to callers.
    pub fn attach(&self) -> Result<()> {
        let _guard = self.lock.acquire()?;
        info!(sr = %self.config.uuid, "attaching, running recovery pass");

        // inflate recovery first: clone undo below may itself inflate
        self.thin.recover()?;
        self.clone_engine.recover()?;

        // leaf-coalesce journals belong to the collector; seeing one just
        // forces a full collector run
        if !self.journal.get_all(JRN_LEAF)?.is_empty() {
            warn!(sr = %self.config.uuid, "interrupted leaf-coalesce found");
            self.gc.kick();
        }

        self.attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Detach: stop the collector, deactivate this SR's volumes and clear
    /// its refcount namespace
    pub fn detach(&self) -> Result<()> {
        let _guard = self.lock.acquire()?;
        self.gc.abort();
        for (lv_name, lv_info) in self.lvm.scan()? {
            if parse_lv_name(&lv_name).is_none() {
                continue;
            }
            if lv_info.active && !lv_info.open {
                self.lvm.deactivate(&lv_name)?;
            }
        }
        self.refcount.reset_all(&self.config.lvm_namespace())?;
        self.attached.store(false, Ordering::SeqCst);
        info!(sr = %self.config.uuid, "detached");
        Ok(())
    }

    pub(crate) fn ensure_attached(&self) -> Result<()> {
        if self.attached.load(Ordering::SeqCst) {
            return Ok(());
        }
        Err(StorageError::unexpected("SR is not attached"))
    }

    /// Snapshot/clone under the SR lock; see [`CloneEngine::snapshot`]
    pub fn snapshot(&self, orig_uuid: &str, params: &SnapshotParams) -> Result<SnapshotResult> {
        self.ensure_attached()?;
        let _guard = self.lock.acquire()?;
        let result = self.clone_engine.snapshot(orig_uuid, params)?;
        if params.mode != SnapshotMode::Internal {
            self.stats.lock().virtual_allocation += result.size_virt;
        }
        Ok(result)
    }

    /// An SR predating the metadata volume runs in legacy mode until one
    /// is created
    pub fn is_legacy(&self) -> Result<bool> {
        Ok(!self.lvm.exists(MGT_LV_NAME)?)
    }

    /// Create and format the management volume for a legacy SR
    pub fn create_metadata_volume(
        &self,
        name_label: &str,
        name_description: &str,
    ) -> Result<()> {
        if !self.is_legacy()? {
            return Ok(());
        }
        self.lvm.create(MGT_LV_NAME, 4 * lvhd_common::MIB)?;
        let sr_info = lvhd_common::SrMetadataRecord {
            uuid: self.config.uuid.clone(),
            allocation: None,
            name_label: name_label.to_string(),
            name_description: name_description.to_string(),
        };
        self.metadata.write_metadata(&sr_info, &[])?;
        info!(sr = %self.config.uuid, "management volume created");
        Ok(())
    }

    /// Chain index built fresh from the current scan
    pub fn parent_child_index(&self) -> Result<ParentChildIndex> {
        ParentChildIndex::build(self.lvm.as_ref(), self.vhd.as_ref())
    }

    /// SR-level virtual allocation accumulated since attach
    #[must_use]
    pub fn virtual_allocation(&self) -> u64 {
        self.stats.lock().virtual_allocation
    }

    pub(crate) fn add_virtual_allocation(&self, delta: u64) {
        self.stats.lock().virtual_allocation += delta;
    }

    pub(crate) fn sub_virtual_allocation(&self, delta: u64) {
        let mut stats = self.stats.lock();
        stats.virtual_allocation = stats.virtual_allocation.saturating_sub(delta);
    }

    #[must_use]
    pub fn config(&self) -> &SrConfig {
        &self.config
    }

    #[must_use]
    pub fn faults(&self) -> &FaultPoints {
        &self.faults
    }

    #[must_use]
    pub fn thin_engine(&self) -> &ThinProvisionEngine {
        &self.thin
    }

    #[must_use]
    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    #[must_use]
    pub fn refcounter(&self) -> &RefCounter {
        &self.refcount
    }

    pub(crate) fn lvm(&self) -> &Arc<dyn VolumeManager> {
        &self.lvm
    }

    pub(crate) fn vhd(&self) -> &Arc<dyn VhdTool> {
        &self.vhd
    }

    pub(crate) fn lock(&self) -> &SrLock {
        &self.lock
    }

    pub(crate) fn gc(&self) -> &Arc<dyn GcControl> {
        &self.gc
    }
}
