//! Thin-provisioning inflate/deflate engine
//!
//! Keeps a VHD-backing LV sized to the VHD's real allocation. Both
//! directions have a strict ordering contract:
//! - inflate: journal the current size, grow the LV, zero the stale footer
//!   at the new tail, then record the new physical size in the VHD header
//! - deflate: shrink the VHD physical-size header first, then the LV;
//!   never the other way around, or live data can be truncated
//!
//! Recovery for interrupted inflates must run before any VHD-level journal
//! recovery, because VHD undo may itself need to inflate.

use crate::fault::FaultPoints;
use crate::lock::SrLock;
use crate::sizing::{calc_size_lv, calc_size_vhd_lv};
use crate::JRN_INFLATE;

use lvhd_common::{Result, StorageError, VdiType};
use lvhd_journal::Journaler;
use lvhd_lvm::{VolumeManager, lv_name_of};
use lvhd_refcount::RefCounter;
use lvhd_vhd::{VHD_FOOTER_SIZE, VhdTool};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct ThinProvisionEngine {
    lvm: Arc<dyn VolumeManager>,
    vhd: Arc<dyn VhdTool>,
    journal: Arc<dyn Journaler>,
    refcount: Arc<RefCounter>,
    namespace: String,
    lock: Arc<SrLock>,
    faults: Arc<FaultPoints>,
}

impl ThinProvisionEngine {
    #[must_use]
    pub fn new(
        lvm: Arc<dyn VolumeManager>,
        vhd: Arc<dyn VhdTool>,
        journal: Arc<dyn Journaler>,
        refcount: Arc<RefCounter>,
        namespace: String,
        lock: Arc<SrLock>,
        faults: Arc<FaultPoints>,
    ) -> Self {
        Self {
            lvm,
            vhd,
            journal,
            refcount,
            namespace,
            lock,
            faults,
        }
    }

    /// Grow the VHD-backing LV to at least `target` bytes; no-op if it is
    /// already big enough
    pub fn inflate(&self, vdi_uuid: &str, target: u64) -> Result<()> {
        let lv_name = lv_name_of(VdiType::Vhd, vdi_uuid);
        let target = calc_size_lv(target);
        let current = self.lvm.get_info(&lv_name)?.size;
        if current >= target {
            return Ok(());
        }
        debug!(vdi_uuid, current, target, "inflating");

        // the journaled prior size is what recovery deflates back to
        self.journal
            .create(JRN_INFLATE, vdi_uuid, &current.to_string())?;
        self.faults.fire("inflate.journaled")?;

        self.lvm.set_size(&lv_name, target)?;
        self.faults.fire("inflate.grown")?;

        // the bytes at the new tail are whatever the VG held before; a
        // stale footer there must never be read as valid
        self.lvm
            .zero_range(&lv_name, target - VHD_FOOTER_SIZE, VHD_FOOTER_SIZE)?;
        self.faults.fire("inflate.zeroed")?;

        self.vhd
            .set_size_phys(&self.lvm.lv_path(&lv_name), target)?;
        self.faults.fire("inflate.header")?;

        self.journal.remove(JRN_INFLATE, vdi_uuid)?;
        Ok(())
    }

    /// Shrink the LV down to `target` bytes; no-op if it is already small
    /// enough
    pub fn deflate(&self, lv_name: &str, target: u64) -> Result<()> {
        let target = calc_size_lv(target);
        let current = self.lvm.get_info(lv_name)?.size;
        if current <= target {
            return Ok(());
        }
        debug!(lv_name, current, target, "deflating");

        // VHD metadata must agree it needs less space before the LV loses it
        self.vhd.set_size_phys(&self.lvm.lv_path(lv_name), target)?;
        self.faults.fire("deflate.header")?;

        self.lvm.set_size(lv_name, target)
    }

    /// Replay outstanding inflate journal entries: deflate each LV back to
    /// its recorded prior size and drop the entry
    pub fn recover(&self) -> Result<()> {
        for (vdi_uuid, value) in self.journal.get_all(JRN_INFLATE)? {
            let prior: u64 = value.parse().map_err(|_| {
                StorageError::unexpected(format!(
                    "unparsable inflate journal value {value:?} for {vdi_uuid}"
                ))
            })?;
            let lv_name = lv_name_of(VdiType::Vhd, &vdi_uuid);
            if self.lvm.exists(&lv_name)? {
                let current = self.lvm.get_info(&lv_name)?.size;
                if current > prior {
                    info!(%vdi_uuid, current, prior, "undoing interrupted inflate");
                    // the footer region may hold a partial write from the
                    // interrupted run
                    self.lvm.zero_range(
                        &lv_name,
                        current - VHD_FOOTER_SIZE,
                        VHD_FOOTER_SIZE,
                    )?;
                    self.deflate(&lv_name, prior)?;
                }
            }
            self.journal.remove(JRN_INFLATE, &vdi_uuid)?;
        }
        Ok(())
    }

    /// Inflate to the fully-allocated size on attach, under the SR lock.
    /// Lock acquisition is bounded and surfaces busy rather than
    /// deadlocking against a concurrent coalesce.
    pub fn attach_thin(&self, vdi_uuid: &str) -> Result<()> {
        let _guard = self.lock.acquire()?;
        let lv_name = lv_name_of(VdiType::Vhd, vdi_uuid);
        let size_virt = self.vhd.get_size_virt(&self.lvm.lv_path(&lv_name))?;
        self.inflate(vdi_uuid, calc_size_vhd_lv(size_virt))
    }

    /// Deflate back to what the VHD content actually needs, if this was the
    /// last attachment of the VDI
    pub fn detach_thin(&self, vdi_uuid: &str) -> Result<()> {
        let _guard = self.lock.acquire()?;
        let (count, _) = self.refcount.check(&self.namespace, vdi_uuid)?;
        if count > 0 {
            debug!(vdi_uuid, count, "still attached elsewhere, keeping size");
            return Ok(());
        }
        let lv_name = lv_name_of(VdiType::Vhd, vdi_uuid);
        let phys = self.vhd.get_size_phys(&self.lvm.lv_path(&lv_name))?;
        self.deflate(&lv_name, phys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::SrLock;
    use crate::testing::FakeStorage;
    use lvhd_common::{GIB, MIB, SrConfig};
    use lvhd_journal::MemJournaler;
    use tempfile::tempdir;

    fn engine(dir: &std::path::Path) -> (Arc<FakeStorage>, Arc<MemJournaler>, ThinProvisionEngine) {
        let storage = Arc::new(FakeStorage::new("vg", 64 * GIB));
        let journal = Arc::new(MemJournaler::new());
        let mut config = SrConfig::new("thin-test", "vg");
        config.lock_dir = dir.join("lock");
        config.refcount_dir = dir.join("refcount");
        let refcount = Arc::new(RefCounter::new(&config.refcount_dir));
        let lock = Arc::new(SrLock::new(&config));
        let thin = ThinProvisionEngine::new(
            storage.clone(),
            storage.clone(),
            journal.clone(),
            refcount,
            config.lvm_namespace(),
            lock,
            Arc::new(FaultPoints::new()),
        );
        (storage, journal, thin)
    }

    #[test]
    fn test_inflate_protocol() {
        let dir = tempdir().unwrap();
        let (storage, journal, thin) = engine(dir.path());
        storage.mk_lv("VHD-a", 8 * MIB);
        storage.mk_vhd("VHD-a", GIB, None);

        let target = calc_size_vhd_lv(GIB);
        thin.inflate("a", target).unwrap();

        assert_eq!(storage.lv("VHD-a").unwrap().size, target);
        assert_eq!(storage.vhd_node("VHD-a").unwrap().size_phys, target);
        // the stale footer at the new tail was cleared
        assert_eq!(
            storage.zeroed_ranges(),
            vec![("VHD-a".to_string(), target - VHD_FOOTER_SIZE, VHD_FOOTER_SIZE)]
        );
        assert!(journal.get_all(JRN_INFLATE).unwrap().is_empty());
    }

    #[test]
    fn test_inflate_noop_when_big_enough() {
        let dir = tempdir().unwrap();
        let (storage, journal, thin) = engine(dir.path());
        storage.mk_lv("VHD-a", calc_size_vhd_lv(GIB));
        storage.mk_vhd("VHD-a", GIB, None);

        thin.inflate("a", GIB).unwrap();
        assert!(journal.get_all(JRN_INFLATE).unwrap().is_empty());
        assert!(storage.zeroed_ranges().is_empty());
    }

    #[test]
    fn test_deflate_shrinks_header_and_lv() {
        let dir = tempdir().unwrap();
        let (storage, _journal, thin) = engine(dir.path());
        let big = calc_size_vhd_lv(GIB);
        storage.mk_lv("VHD-a", big);
        storage.mk_vhd("VHD-a", GIB, None);

        thin.deflate("VHD-a", 16 * MIB).unwrap();
        assert_eq!(storage.lv("VHD-a").unwrap().size, 16 * MIB);
        assert_eq!(storage.vhd_node("VHD-a").unwrap().size_phys, 16 * MIB);

        // already small enough: no-op, the header is left alone
        thin.deflate("VHD-a", big).unwrap();
        assert_eq!(storage.lv("VHD-a").unwrap().size, 16 * MIB);
    }
}
