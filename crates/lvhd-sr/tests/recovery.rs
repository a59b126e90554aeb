//! Crash-recovery scenarios
//!
//! Each test stages the exact on-disk state a crash would leave behind
//! (journal entries plus partially-mutated LVs), then runs the attach-time
//! recovery pass and checks the resolved state.

use lvhd_common::{GIB, Provisioning, StorageError, VdiType};
use lvhd_journal::Journaler;
use lvhd_sr::testing::{TestSr, build_sr};
use lvhd_sr::{JRN_CLONE, JRN_INFLATE, JRN_LEAF, calc_size_vhd_lv, thin_leaf_size};
use lvhd_vhd::VHD_FOOTER_SIZE;
use tempfile::tempdir;

const ORIG: &str = "aaaaaaaa-0000-4000-8000-000000000001";
const BASE: &str = "bbbbbbbb-0000-4000-8000-000000000002";
const CLON: &str = "cccccccc-0000-4000-8000-000000000003";

fn orig_lv() -> String {
    format!("VHD-{ORIG}")
}

fn base_lv() -> String {
    format!("VHD-{BASE}")
}

fn clon_lv() -> String {
    format!("VHD-{CLON}")
}

/// Attached SR with one 1 GiB VHD VDI
fn sr_with_vdi(dir: &std::path::Path) -> TestSr {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let t = build_sr(dir, Provisioning::Thin);
    t.sr.attach().unwrap();
    t.sr.create_vdi(ORIG, GIB, VdiType::Vhd, "disk", "").unwrap();
    t
}

/// Stage the state after clone step 7: renamed base, both children
/// snapshotted onto it, base hidden, journal entry still present
fn stage_children_created(t: &TestSr) {
    t.storage.rename_lv(&orig_lv(), &base_lv());
    t.storage.mk_lv(&orig_lv(), thin_leaf_size());
    t.storage.mk_vhd(&orig_lv(), GIB, Some(&base_lv()));
    t.storage.mk_lv(&clon_lv(), thin_leaf_size());
    t.storage.mk_vhd(&clon_lv(), GIB, Some(&base_lv()));
    t.storage.hide_lv(&base_lv());
    t.journal
        .create(JRN_CLONE, CLON, &format!("{BASE}_{ORIG}"))
        .unwrap();
}

#[test]
fn test_killed_after_journal_before_rename() {
    let dir = tempdir().unwrap();
    let t = sr_with_vdi(dir.path());
    let size_before = t.storage.lv(&orig_lv()).unwrap().size;

    // only the commit point exists; nothing destructive happened
    t.journal
        .create(JRN_CLONE, CLON, &format!("{BASE}_{ORIG}"))
        .unwrap();

    t.sr.attach().unwrap();

    // original untouched, journal drained, no base/clone LVs
    assert!(t.journal.get_all(JRN_CLONE).unwrap().is_empty());
    let orig = t.storage.lv(&orig_lv()).unwrap();
    assert_eq!(orig.size, size_before);
    assert!(!orig.tags.iter().any(|tag| tag == "hidden"));
    assert!(t.storage.lv(&base_lv()).is_none());
    assert!(t.storage.lv(&clon_lv()).is_none());
}

#[test]
fn test_killed_after_children_before_journal_removal() {
    let dir = tempdir().unwrap();
    let t = sr_with_vdi(dir.path());
    stage_children_created(&t);

    t.sr.attach().unwrap();

    // completed, not undone: base stays hidden and read-only
    assert!(t.journal.get_all(JRN_CLONE).unwrap().is_empty());
    let base = t.storage.lv(&base_lv()).unwrap();
    assert!(base.read_only);
    assert!(base.tags.iter().any(|tag| tag == "hidden"));

    // both leaves kept their parent pointers
    for leaf in [orig_lv(), clon_lv()] {
        let node = t.storage.vhd_node(&leaf).unwrap();
        assert_eq!(node.parent.as_deref(), Some(base_lv().as_str()));
    }

    // finalize introduced the records
    let (_, clone_rec) = t.sr.metadata().find_vdi(CLON).unwrap().unwrap();
    assert!(clone_rec.is_a_snapshot);
    assert_eq!(clone_rec.snapshot_of, ORIG);
    let (_, base_rec) = t.sr.metadata().find_vdi(BASE).unwrap().unwrap();
    assert!(!base_rec.managed);

    let ns = t.sr.config().lvm_namespace();
    assert_eq!(t.sr.refcounter().check(&ns, BASE).unwrap(), (1, 0));
}

#[test]
fn test_killed_after_rename_before_children_undoes() {
    let dir = tempdir().unwrap();
    let t = sr_with_vdi(dir.path());

    t.storage.rename_lv(&orig_lv(), &base_lv());
    t.journal
        .create(JRN_CLONE, CLON, &format!("{BASE}_{ORIG}"))
        .unwrap();

    t.sr.attach().unwrap();

    // renamed back and re-inflated to full provisioning
    assert!(t.storage.lv(&base_lv()).is_none());
    let orig = t.storage.lv(&orig_lv()).unwrap();
    assert!(!orig.tags.iter().any(|tag| tag == "hidden"));
    assert!(!orig.read_only);
    assert_eq!(orig.size, calc_size_vhd_lv(GIB));
    assert!(t.journal.get_all(JRN_CLONE).unwrap().is_empty());

    let ns = t.sr.config().lvm_namespace();
    assert_eq!(t.sr.refcounter().check(&ns, BASE).unwrap(), (0, 0));
}

#[test]
fn test_corrupt_child_triggers_undo() {
    let dir = tempdir().unwrap();
    let t = sr_with_vdi(dir.path());
    stage_children_created(&t);
    t.storage.set_vhd_valid(&clon_lv(), false);

    t.sr.attach().unwrap();

    // rolled back: children removed, base visible again under the
    // original uuid
    assert!(t.storage.lv(&base_lv()).is_none());
    assert!(t.storage.lv(&clon_lv()).is_none());
    let orig = t.storage.lv(&orig_lv()).unwrap();
    assert!(!orig.tags.iter().any(|tag| tag == "hidden"));
    assert!(!orig.read_only);
    assert!(!t.storage.vhd_node(&orig_lv()).unwrap().hidden);
    assert!(t.journal.get_all(JRN_CLONE).unwrap().is_empty());
}

#[test]
fn test_single_mode_entry_keyed_by_orig() {
    let dir = tempdir().unwrap();
    let t = sr_with_vdi(dir.path());

    // single-mode fork: base renamed, one leaf re-created, no clone
    t.storage.rename_lv(&orig_lv(), &base_lv());
    t.storage.mk_lv(&orig_lv(), thin_leaf_size());
    t.storage.mk_vhd(&orig_lv(), GIB, Some(&base_lv()));
    t.storage.hide_lv(&base_lv());
    t.journal
        .create(JRN_CLONE, ORIG, &format!("{BASE}_{ORIG}"))
        .unwrap();

    t.sr.attach().unwrap();

    assert!(t.journal.get_all(JRN_CLONE).unwrap().is_empty());
    // completed: the base is the snapshot
    let (_, base_rec) = t.sr.metadata().find_vdi(BASE).unwrap().unwrap();
    assert!(base_rec.is_a_snapshot);
    assert_eq!(base_rec.snapshot_of, ORIG);
}

#[test]
fn test_vanished_base_and_orig_is_unexpected_state() {
    let dir = tempdir().unwrap();
    let t = build_sr(dir.path(), Provisioning::Thin);
    t.journal
        .create(JRN_CLONE, CLON, &format!("{BASE}_{ORIG}"))
        .unwrap();

    let err = t.sr.attach().unwrap_err();
    assert!(matches!(err, StorageError::UnexpectedState(_)));
}

#[test]
fn test_recovery_is_idempotent() {
    let dir = tempdir().unwrap();
    let t = sr_with_vdi(dir.path());
    stage_children_created(&t);

    t.sr.attach().unwrap();
    let lvs_once = t.storage.lv_names();
    let (_, vdis_once) = t.sr.metadata().get_metadata().unwrap();

    t.sr.attach().unwrap();
    assert_eq!(t.storage.lv_names(), lvs_once);
    let (_, vdis_twice) = t.sr.metadata().get_metadata().unwrap();
    assert_eq!(vdis_once, vdis_twice);
}

#[test]
fn test_inflate_interrupted_before_grow() {
    let dir = tempdir().unwrap();
    let t = sr_with_vdi(dir.path());
    let size_before = t.storage.lv(&orig_lv()).unwrap().size;

    t.journal
        .create(JRN_INFLATE, ORIG, &size_before.to_string())
        .unwrap();

    t.sr.attach().unwrap();

    // the LV was never grown: deflating to the journaled size is a no-op
    assert_eq!(t.storage.lv(&orig_lv()).unwrap().size, size_before);
    assert!(t.journal.get_all(JRN_INFLATE).unwrap().is_empty());
}

#[test]
fn test_inflate_interrupted_after_grow() {
    let dir = tempdir().unwrap();
    let t = sr_with_vdi(dir.path());
    let prior = t.storage.lv(&orig_lv()).unwrap().size;
    let grown = calc_size_vhd_lv(GIB);

    t.journal
        .create(JRN_INFLATE, ORIG, &prior.to_string())
        .unwrap();
    t.storage.resize_lv(&orig_lv(), grown);

    t.sr.attach().unwrap();

    assert_eq!(t.storage.lv(&orig_lv()).unwrap().size, prior);
    assert!(t.journal.get_all(JRN_INFLATE).unwrap().is_empty());
    // the stale footer at the grown tail was cleared before the shrink
    assert!(
        t.storage
            .zeroed_ranges()
            .contains(&(orig_lv(), grown - VHD_FOOTER_SIZE, VHD_FOOTER_SIZE))
    );
}

#[test]
fn test_fault_injected_inflate_recovers() {
    let dir = tempdir().unwrap();
    let t = sr_with_vdi(dir.path());
    let prior = t.storage.lv(&orig_lv()).unwrap().size;

    // fail after the LV grew but before the VHD header knew about it
    t.sr.faults().arm("inflate.grown");
    let err = t.sr.thin_engine().inflate(ORIG, calc_size_vhd_lv(GIB));
    assert!(err.is_err());
    assert_eq!(t.journal.get_all(JRN_INFLATE).unwrap().len(), 1);
    assert!(t.storage.lv(&orig_lv()).unwrap().size > prior);

    t.sr.attach().unwrap();
    assert_eq!(t.storage.lv(&orig_lv()).unwrap().size, prior);
    assert!(t.journal.get_all(JRN_INFLATE).unwrap().is_empty());
}

#[test]
fn test_leaf_journal_kicks_collector() {
    let dir = tempdir().unwrap();
    let t = build_sr(dir.path(), Provisioning::Thin);
    t.journal.create(JRN_LEAF, ORIG, "coalescing").unwrap();

    t.sr.attach().unwrap();
    assert_eq!(t.gc.kicks(), 1);
    // the entry is the collector's to consume, not ours
    assert_eq!(t.journal.get_all(JRN_LEAF).unwrap().len(), 1);
}
