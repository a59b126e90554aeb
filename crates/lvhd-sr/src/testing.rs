//! In-memory test doubles for the SR engines
//!
//! [`FakeStorage`] implements both `VolumeManager` and `VhdTool` over one
//! shared state, so an LV rename carries its VHD content along exactly
//! like a real device node would. It also records an event log and a
//! free-space low-watermark, which the ordering and space-consumption
//! tests assert against.

use crate::{GcControl, RemoteRefresher, Sr};

use lvhd_common::{
    GIB, Provisioning, Result, SrConfig, SrMetadataRecord, StorageError, roundup,
};
use lvhd_journal::MemJournaler;
use lvhd_lvm::{LVM_SIZE_INCREMENT, LvInfo, TAG_HIDDEN, VolumeManager};
use lvhd_metadata::{MetaFile, MetadataStore};
use lvhd_vhd::{MAX_VHD_SIZE, VhdTool, calc_overhead_empty};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Clone, Debug, Default)]
pub struct FakeLv {
    pub size: u64,
    pub active: bool,
    pub open: bool,
    pub read_only: bool,
    pub tags: Vec<String>,
}

/// One VHD node living inside an LV
#[derive(Clone, Debug)]
pub struct FakeVhd {
    pub size_virt: u64,
    pub size_phys: u64,
    /// Parent LV name, `None` for a chain root
    pub parent: Option<String>,
    pub hidden: bool,
    /// Cleared by tests to simulate on-disk corruption
    pub valid: bool,
}

#[derive(Default)]
struct State {
    lvs: HashMap<String, FakeLv>,
    vhds: HashMap<String, FakeVhd>,
    free: u64,
    min_free: u64,
    zeroed: Vec<(String, u64, u64)>,
    events: Vec<String>,
}

impl State {
    fn alloc(&mut self, bytes: u64) -> Result<()> {
        if self.free < bytes {
            return Err(StorageError::SrNoSpace {
                required: bytes,
                available: self.free,
            });
        }
        self.free -= bytes;
        self.min_free = self.min_free.min(self.free);
        Ok(())
    }
}

/// Fake VG + VHD tool sharing one state
pub struct FakeStorage {
    vg_name: String,
    state: Mutex<State>,
}

impl FakeStorage {
    #[must_use]
    pub fn new(vg_name: impl Into<String>, capacity: u64) -> Self {
        Self {
            vg_name: vg_name.into(),
            state: Mutex::new(State {
                free: capacity,
                min_free: capacity,
                ..State::default()
            }),
        }
    }

    fn lv_of(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn with_node<T>(&self, path: &Path, f: impl FnOnce(&mut FakeVhd) -> T) -> Result<T> {
        let lv = Self::lv_of(path);
        let mut state = self.state.lock();
        let node = state
            .vhds
            .get_mut(&lv)
            .ok_or_else(|| StorageError::VhdInvalid(lv.clone()))?;
        Ok(f(node))
    }

    pub fn lv(&self, lv_name: &str) -> Option<FakeLv> {
        self.state.lock().lvs.get(lv_name).cloned()
    }

    pub fn vhd_node(&self, lv_name: &str) -> Option<FakeVhd> {
        self.state.lock().vhds.get(lv_name).cloned()
    }

    /// Stage an LV directly (test setup); inherent so callers avoid the
    /// `VolumeManager`/`VhdTool` method-name overlap
    pub fn mk_lv(&self, lv_name: &str, size: u64) {
        VolumeManager::create(self, lv_name, size).expect("mk_lv");
    }

    /// Stage a VHD node directly with an explicit parent LV
    pub fn mk_vhd(&self, lv_name: &str, size_virt: u64, parent: Option<&str>) {
        self.state.lock().vhds.insert(
            lv_name.to_string(),
            FakeVhd {
                size_virt,
                size_phys: calc_overhead_empty(MAX_VHD_SIZE),
                parent: parent.map(str::to_string),
                hidden: false,
                valid: true,
            },
        );
    }

    pub fn rename_lv(&self, old_name: &str, new_name: &str) {
        VolumeManager::rename(self, old_name, new_name).expect("rename_lv");
    }

    pub fn resize_lv(&self, lv_name: &str, size: u64) {
        VolumeManager::set_size(self, lv_name, size).expect("resize_lv");
    }

    /// Hide an LV the way clone step 7 leaves a base: LV tag + read-only,
    /// plus the VHD-level flag when a node exists
    pub fn hide_lv(&self, lv_name: &str) {
        VolumeManager::set_hidden(self, lv_name, true).expect("hide_lv");
        VolumeManager::set_readonly(self, lv_name, true).expect("hide_lv");
        if let Some(node) = self.state.lock().vhds.get_mut(lv_name) {
            node.hidden = true;
        }
    }

    pub fn set_vhd_valid(&self, lv_name: &str, valid: bool) {
        if let Some(node) = self.state.lock().vhds.get_mut(lv_name) {
            node.valid = valid;
        }
    }

    /// Simulate the physical-size header a running consumer would leave
    /// behind (e.g. after writing some blocks)
    pub fn set_vhd_phys(&self, lv_name: &str, size_phys: u64) {
        if let Some(node) = self.state.lock().vhds.get_mut(lv_name) {
            node.size_phys = size_phys;
        }
    }

    pub fn set_open(&self, lv_name: &str, open: bool) {
        if let Some(lv) = self.state.lock().lvs.get_mut(lv_name) {
            lv.open = open;
        }
    }

    pub fn set_free_space(&self, free: u64) {
        let mut state = self.state.lock();
        state.free = free;
        state.min_free = state.min_free.min(free);
    }

    #[must_use]
    pub fn free(&self) -> u64 {
        self.state.lock().free
    }

    /// Lowest free space observed since construction
    #[must_use]
    pub fn min_free(&self) -> u64 {
        self.state.lock().min_free
    }

    pub fn reset_min_free(&self) {
        let mut state = self.state.lock();
        state.min_free = state.free;
    }

    #[must_use]
    pub fn zeroed_ranges(&self) -> Vec<(String, u64, u64)> {
        self.state.lock().zeroed.clone()
    }

    /// Significant mutations in call order, e.g. `"rename VHD-a VHD-b"`
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    #[must_use]
    pub fn lv_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().lvs.keys().cloned().collect();
        names.sort();
        names
    }

    fn info_of(name: &str, lv: &FakeLv) -> LvInfo {
        LvInfo {
            name: name.to_string(),
            size: lv.size,
            active: lv.active,
            open: lv.open,
            read_only: lv.read_only,
            hidden: lv.tags.iter().any(|t| t == TAG_HIDDEN),
            tags: lv.tags.clone(),
        }
    }
}

impl VolumeManager for FakeStorage {
    fn vg_name(&self) -> &str {
        &self.vg_name
    }

    fn create(&self, lv_name: &str, size: u64) -> Result<()> {
        let size = roundup(LVM_SIZE_INCREMENT, size.max(1));
        let mut state = self.state.lock();
        if state.lvs.contains_key(lv_name) {
            return Err(StorageError::metadata(format!("LV exists: {lv_name}")));
        }
        state.alloc(size)?;
        state.lvs.insert(
            lv_name.to_string(),
            FakeLv {
                size,
                active: true,
                ..FakeLv::default()
            },
        );
        state.events.push(format!("create {lv_name}"));
        Ok(())
    }

    fn remove(&self, lv_name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let lv = state
            .lvs
            .remove(lv_name)
            .ok_or_else(|| StorageError::LvNotFound(lv_name.to_string()))?;
        state.free += lv.size;
        state.vhds.remove(lv_name);
        state.events.push(format!("remove {lv_name}"));
        Ok(())
    }

    fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.lvs.contains_key(new_name) {
            return Err(StorageError::metadata(format!("LV exists: {new_name}")));
        }
        let lv = state
            .lvs
            .remove(old_name)
            .ok_or_else(|| StorageError::LvNotFound(old_name.to_string()))?;
        state.lvs.insert(new_name.to_string(), lv);
        // the VHD content and any children's parent pointers follow the
        // device node
        if let Some(node) = state.vhds.remove(old_name) {
            state.vhds.insert(new_name.to_string(), node);
        }
        for node in state.vhds.values_mut() {
            if node.parent.as_deref() == Some(old_name) {
                node.parent = Some(new_name.to_string());
            }
        }
        state.events.push(format!("rename {old_name} {new_name}"));
        Ok(())
    }

    fn set_size(&self, lv_name: &str, size: u64) -> Result<()> {
        let size = roundup(LVM_SIZE_INCREMENT, size.max(1));
        let mut state = self.state.lock();
        let current = state
            .lvs
            .get(lv_name)
            .ok_or_else(|| StorageError::LvNotFound(lv_name.to_string()))?
            .size;
        if size > current {
            state.alloc(size - current)?;
        } else {
            state.free += current - size;
        }
        state.lvs.get_mut(lv_name).unwrap().size = size;
        state.events.push(format!("resize {lv_name} {size}"));
        Ok(())
    }

    fn activate(&self, lv_name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let lv = state
            .lvs
            .get_mut(lv_name)
            .ok_or_else(|| StorageError::LvNotFound(lv_name.to_string()))?;
        lv.active = true;
        Ok(())
    }

    fn deactivate(&self, lv_name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let lv = state
            .lvs
            .get_mut(lv_name)
            .ok_or_else(|| StorageError::LvNotFound(lv_name.to_string()))?;
        lv.active = false;
        Ok(())
    }

    fn set_readonly(&self, lv_name: &str, read_only: bool) -> Result<()> {
        let mut state = self.state.lock();
        let lv = state
            .lvs
            .get_mut(lv_name)
            .ok_or_else(|| StorageError::LvNotFound(lv_name.to_string()))?;
        lv.read_only = read_only;
        state
            .events
            .push(format!("set-readonly {lv_name} {read_only}"));
        Ok(())
    }

    fn set_hidden(&self, lv_name: &str, hidden: bool) -> Result<()> {
        let mut state = self.state.lock();
        let lv = state
            .lvs
            .get_mut(lv_name)
            .ok_or_else(|| StorageError::LvNotFound(lv_name.to_string()))?;
        if hidden {
            if !lv.tags.iter().any(|t| t == TAG_HIDDEN) {
                lv.tags.push(TAG_HIDDEN.to_string());
            }
        } else {
            lv.tags.retain(|t| t != TAG_HIDDEN);
        }
        state.events.push(format!("set-hidden {lv_name} {hidden}"));
        Ok(())
    }

    fn add_tag(&self, lv_name: &str, tag: &str) -> Result<()> {
        let mut state = self.state.lock();
        let lv = state
            .lvs
            .get_mut(lv_name)
            .ok_or_else(|| StorageError::LvNotFound(lv_name.to_string()))?;
        lv.tags.push(tag.to_string());
        Ok(())
    }

    fn refresh(&self, _lv_name: &str) -> Result<()> {
        Ok(())
    }

    fn exists(&self, lv_name: &str) -> Result<bool> {
        Ok(self.state.lock().lvs.contains_key(lv_name))
    }

    fn get_info(&self, lv_name: &str) -> Result<LvInfo> {
        let state = self.state.lock();
        let lv = state
            .lvs
            .get(lv_name)
            .ok_or_else(|| StorageError::LvNotFound(lv_name.to_string()))?;
        Ok(Self::info_of(lv_name, lv))
    }

    fn scan(&self) -> Result<HashMap<String, LvInfo>> {
        Ok(self
            .state
            .lock()
            .lvs
            .iter()
            .map(|(name, lv)| (name.clone(), Self::info_of(name, lv)))
            .collect())
    }

    fn free_space(&self) -> Result<u64> {
        Ok(self.state.lock().free)
    }

    fn zero_range(&self, lv_name: &str, offset: u64, len: u64) -> Result<()> {
        let mut state = self.state.lock();
        if !state.lvs.contains_key(lv_name) {
            return Err(StorageError::LvNotFound(lv_name.to_string()));
        }
        state.zeroed.push((lv_name.to_string(), offset, len));
        Ok(())
    }
}

impl VhdTool for FakeStorage {
    fn create(&self, path: &Path, size_virt: u64, _reserve_full_bat: bool) -> Result<()> {
        let lv = Self::lv_of(path);
        let mut state = self.state.lock();
        if !state.lvs.contains_key(&lv) {
            return Err(StorageError::LvNotFound(lv));
        }
        state.vhds.insert(
            lv,
            FakeVhd {
                size_virt,
                size_phys: calc_overhead_empty(MAX_VHD_SIZE),
                parent: None,
                hidden: false,
                valid: true,
            },
        );
        Ok(())
    }

    fn snapshot(&self, dst: &Path, src: &Path) -> Result<()> {
        let dst_lv = Self::lv_of(dst);
        let src_lv = Self::lv_of(src);
        let mut state = self.state.lock();
        if !state.lvs.contains_key(&dst_lv) {
            return Err(StorageError::LvNotFound(dst_lv));
        }
        // a raw parent has no VHD node; the child inherits its LV size
        let size_virt = match state.vhds.get(&src_lv) {
            Some(parent) => parent.size_virt,
            None => {
                state
                    .lvs
                    .get(&src_lv)
                    .ok_or_else(|| StorageError::LvNotFound(src_lv.clone()))?
                    .size
            }
        };
        state.vhds.insert(
            dst_lv.clone(),
            FakeVhd {
                size_virt,
                size_phys: calc_overhead_empty(MAX_VHD_SIZE),
                parent: Some(src_lv.clone()),
                hidden: false,
                valid: true,
            },
        );
        state.events.push(format!("vhd-snapshot {dst_lv} {src_lv}"));
        Ok(())
    }

    fn check(&self, path: &Path) -> Result<bool> {
        let lv = Self::lv_of(path);
        Ok(self
            .state
            .lock()
            .vhds
            .get(&lv)
            .is_some_and(|node| node.valid))
    }

    fn get_depth(&self, path: &Path) -> Result<u32> {
        let state = self.state.lock();
        let mut cursor = Self::lv_of(path);
        let mut depth = 0;
        while let Some(node) = state.vhds.get(&cursor) {
            depth += 1;
            match &node.parent {
                Some(parent) if depth < 1000 => cursor = parent.clone(),
                _ => break,
            }
        }
        if depth == 0 {
            return Err(StorageError::VhdInvalid(Self::lv_of(path)));
        }
        Ok(depth)
    }

    fn get_parent(&self, path: &Path) -> Result<Option<PathBuf>> {
        let lv = Self::lv_of(path);
        let state = self.state.lock();
        let node = state
            .vhds
            .get(&lv)
            .ok_or_else(|| StorageError::VhdInvalid(lv))?;
        Ok(node
            .parent
            .as_ref()
            .map(|p| PathBuf::from(format!("/dev/{}/{}", self.vg_name, p))))
    }

    fn get_hidden(&self, path: &Path) -> Result<bool> {
        self.with_node(path, |node| node.hidden)
    }

    fn set_hidden(&self, path: &Path, hidden: bool) -> Result<()> {
        let lv = Self::lv_of(path);
        self.with_node(path, |node| node.hidden = hidden)?;
        self.state
            .lock()
            .events
            .push(format!("vhd-set-hidden {lv} {hidden}"));
        Ok(())
    }

    fn get_size_virt(&self, path: &Path) -> Result<u64> {
        self.with_node(path, |node| node.size_virt)
    }

    fn set_size_virt(&self, path: &Path, size: u64) -> Result<()> {
        self.with_node(path, |node| node.size_virt = size)
    }

    fn get_size_phys(&self, path: &Path) -> Result<u64> {
        self.with_node(path, |node| node.size_phys)
    }

    fn set_size_phys(&self, path: &Path, size: u64) -> Result<()> {
        self.with_node(path, |node| node.size_phys = size)
    }
}

/// Collector stub counting kicks/aborts
#[derive(Default)]
pub struct FakeGc {
    kicks: AtomicU32,
    aborts: AtomicU32,
}

impl FakeGc {
    #[must_use]
    pub fn kicks(&self) -> u32 {
        self.kicks.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn aborts(&self) -> u32 {
        self.aborts.load(Ordering::SeqCst)
    }
}

impl GcControl for FakeGc {
    fn kick(&self) {
        self.kicks.fetch_add(1, Ordering::SeqCst);
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records which LVs other hosts were told to refresh
#[derive(Default)]
pub struct RecordingRefresher {
    refreshed: Mutex<Vec<String>>,
}

impl RecordingRefresher {
    #[must_use]
    pub fn refreshed(&self) -> Vec<String> {
        self.refreshed.lock().clone()
    }
}

impl RemoteRefresher for RecordingRefresher {
    fn refresh(&self, lv_name: &str) -> Result<()> {
        self.refreshed.lock().push(lv_name.to_string());
        Ok(())
    }
}

/// A fully-wired SR over the fakes, rooted in `base_dir` (lock files,
/// refcount files and the metadata image live there)
pub struct TestSr {
    pub sr: Sr,
    pub storage: Arc<FakeStorage>,
    pub journal: Arc<MemJournaler>,
    pub gc: Arc<FakeGc>,
    pub refresher: Arc<RecordingRefresher>,
}

pub fn build_sr(base_dir: &Path, provisioning: Provisioning) -> TestSr {
    let mut config = SrConfig::new("test-sr", "vg-test");
    config.provisioning = provisioning;
    config.lock_dir = base_dir.join("lock");
    config.refcount_dir = base_dir.join("refcount");
    config.lock_retry.attempts = 3;
    config.lock_retry.interval_ms = 5;

    let storage = Arc::new(FakeStorage::new("vg-test", 64 * GIB));
    let journal = Arc::new(MemJournaler::new());
    let gc = Arc::new(FakeGc::default());
    let refresher = Arc::new(RecordingRefresher::default());

    let meta_file = MetaFile::open(base_dir.join("mgt.img"), false).expect("metadata image");
    let metadata = Arc::new(MetadataStore::new(meta_file));
    metadata
        .write_metadata(
            &SrMetadataRecord {
                uuid: config.uuid.clone(),
                ..SrMetadataRecord::default()
            },
            &[],
        )
        .expect("format metadata");

    let sr = Sr::new(
        config,
        storage.clone(),
        storage.clone(),
        journal.clone(),
        metadata,
        gc.clone(),
        refresher.clone(),
    );
    TestSr {
        sr,
        storage,
        journal,
        gc,
        refresher,
    }
}
