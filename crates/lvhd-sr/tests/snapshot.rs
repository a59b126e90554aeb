//! Snapshot/clone behavior over the in-memory fakes

use lvhd_common::{GIB, MIB, Provisioning, StorageError, VdiType};
use lvhd_journal::Journaler;
use lvhd_sr::testing::build_sr;
use lvhd_sr::{JRN_CLONE, SnapshotMode, SnapshotParams, calc_size_vhd_lv, thin_leaf_size};
use tempfile::tempdir;

const UUID_A: &str = "aaaaaaaa-0000-4000-8000-000000000001";

fn params(mode: SnapshotMode) -> SnapshotParams {
    SnapshotParams {
        mode,
        attached_on_other_hosts: false,
    }
}

#[test]
fn test_double_snapshot_layout() {
    let dir = tempdir().unwrap();
    let t = build_sr(dir.path(), Provisioning::Thin);
    t.sr.attach().unwrap();
    t.sr.create_vdi(UUID_A, GIB, VdiType::Vhd, "disk", "").unwrap();

    let result = t.sr.snapshot(UUID_A, &params(SnapshotMode::Double)).unwrap();
    let clone_uuid = result.clone_uuid.clone().unwrap();
    assert_eq!(result.size_virt, GIB);

    // base is hidden and read-only, at both LV and VHD level
    let base_lv = format!("VHD-{}", result.base_uuid);
    let base = t.storage.lv(&base_lv).unwrap();
    assert!(base.read_only);
    assert!(base.tags.iter().any(|tag| tag == "hidden"));
    assert!(t.storage.vhd_node(&base_lv).unwrap().hidden);

    // both leaves exist, are visible, and point at the base
    for leaf in [UUID_A, clone_uuid.as_str()] {
        let node = t.storage.vhd_node(&format!("VHD-{leaf}")).unwrap();
        assert_eq!(node.parent.as_deref(), Some(base_lv.as_str()));
        assert!(!node.hidden);
    }

    // done commit point reached: journal drained
    assert!(t.journal.get_all(JRN_CLONE).unwrap().is_empty());

    // clone record is a snapshot of the original; base is unmanaged
    let (_, clone_rec) = t.sr.metadata().find_vdi(&clone_uuid).unwrap().unwrap();
    assert!(clone_rec.is_a_snapshot);
    assert_eq!(clone_rec.snapshot_of, UUID_A);
    assert!(clone_rec.managed);
    let (_, base_rec) = t.sr.metadata().find_vdi(&result.base_uuid).unwrap().unwrap();
    assert!(!base_rec.managed);
    assert!(base_rec.read_only);

    // base holds derive from the (inactive) original leaf
    let ns = t.sr.config().lvm_namespace();
    assert_eq!(
        t.sr.refcounter().check(&ns, &result.base_uuid).unwrap(),
        (1, 0)
    );

    // create + snapshot each account one virtual disk
    assert_eq!(t.sr.virtual_allocation(), 2 * GIB);
}

#[test]
fn test_hidden_only_after_children_exist() {
    let dir = tempdir().unwrap();
    let t = build_sr(dir.path(), Provisioning::Thin);
    t.sr.attach().unwrap();
    t.sr.create_vdi(UUID_A, GIB, VdiType::Vhd, "disk", "").unwrap();
    t.sr.snapshot(UUID_A, &params(SnapshotMode::Double)).unwrap();

    let events = t.storage.events();
    let last_child = events
        .iter()
        .rposition(|e| e.starts_with("vhd-snapshot"))
        .unwrap();
    let first_hide = events
        .iter()
        .position(|e| e.starts_with("set-hidden") || e.starts_with("vhd-set-hidden"))
        .unwrap();
    assert!(
        first_hide > last_child,
        "base hidden before children existed: {events:?}"
    );
}

#[test]
fn test_no_double_space_consumption() {
    let dir = tempdir().unwrap();
    let t = build_sr(dir.path(), Provisioning::Thin);
    t.sr.attach().unwrap();
    t.sr.create_vdi(UUID_A, GIB, VdiType::Vhd, "disk", "").unwrap();

    t.storage.reset_min_free();
    let free_before = t.storage.free();
    t.sr.snapshot(UUID_A, &params(SnapshotMode::Double)).unwrap();
    let peak = free_before - t.storage.min_free();

    // never the two-full-copies amount
    assert!(peak < 2 * calc_size_vhd_lv(GIB));
    // at most the deflated parent plus two provisioned leaves
    assert!(peak <= thin_leaf_size() * 2 + 8 * MIB);
}

#[test]
fn test_single_snapshot_base_is_the_snapshot() {
    let dir = tempdir().unwrap();
    let t = build_sr(dir.path(), Provisioning::Thin);
    t.sr.attach().unwrap();
    t.sr.create_vdi(UUID_A, GIB, VdiType::Vhd, "disk", "").unwrap();

    let result = t.sr.snapshot(UUID_A, &params(SnapshotMode::Single)).unwrap();
    assert!(result.clone_uuid.is_none());

    let (_, base_rec) = t.sr.metadata().find_vdi(&result.base_uuid).unwrap().unwrap();
    assert!(base_rec.is_a_snapshot);
    assert_eq!(base_rec.snapshot_of, UUID_A);
    assert!(!base_rec.managed);

    // exactly one leaf re-created over the base
    let node = t.storage.vhd_node(&format!("VHD-{UUID_A}")).unwrap();
    assert_eq!(
        node.parent.as_deref(),
        Some(format!("VHD-{}", result.base_uuid).as_str())
    );
}

#[test]
fn test_internal_mode_skips_allocation_accounting() {
    let dir = tempdir().unwrap();
    let t = build_sr(dir.path(), Provisioning::Thin);
    t.sr.attach().unwrap();
    t.sr.create_vdi(UUID_A, GIB, VdiType::Vhd, "disk", "").unwrap();

    let before = t.sr.virtual_allocation();
    t.sr.snapshot(UUID_A, &params(SnapshotMode::Internal)).unwrap();
    assert_eq!(t.sr.virtual_allocation(), before);
}

#[test]
fn test_raw_vdi_snapshot() {
    let dir = tempdir().unwrap();
    let t = build_sr(dir.path(), Provisioning::Thin);
    t.sr.attach().unwrap();
    t.sr.create_vdi(UUID_A, GIB, VdiType::Raw, "raw disk", "").unwrap();

    let result = t.sr.snapshot(UUID_A, &params(SnapshotMode::Double)).unwrap();

    // the base keeps the raw prefix, the leaves are VHD over it
    let base_lv = format!("LV-{}", result.base_uuid);
    assert!(t.storage.lv(&base_lv).unwrap().read_only);
    let leaf = t.storage.vhd_node(&format!("VHD-{UUID_A}")).unwrap();
    assert_eq!(leaf.parent.as_deref(), Some(base_lv.as_str()));
    assert_eq!(leaf.size_virt, GIB);

    // the original's stored format followed the conversion
    let (_, orig_rec) = t.sr.metadata().find_vdi(UUID_A).unwrap().unwrap();
    assert_eq!(orig_rec.vdi_type, VdiType::Vhd);
}

#[test]
fn test_snapshot_rejects_hidden_and_missing() {
    let dir = tempdir().unwrap();
    let t = build_sr(dir.path(), Provisioning::Thin);
    t.sr.attach().unwrap();

    let err = t.sr.snapshot("no-such-uuid", &params(SnapshotMode::Double));
    assert!(matches!(err, Err(StorageError::VdiNotFound(_))));

    t.sr.create_vdi(UUID_A, GIB, VdiType::Vhd, "disk", "").unwrap();
    t.storage.hide_lv(&format!("VHD-{UUID_A}"));
    let err = t.sr.snapshot(UUID_A, &params(SnapshotMode::Double));
    assert!(matches!(err, Err(StorageError::VdiUnavailable { .. })));
}

#[test]
fn test_snapshot_rejects_deep_chain() {
    let dir = tempdir().unwrap();
    let t = build_sr(dir.path(), Provisioning::Thin);
    t.sr.attach().unwrap();

    // fabricate a chain at the depth limit
    t.storage.mk_lv("VHD-node-0", 8 * MIB);
    t.storage.mk_vhd("VHD-node-0", GIB, None);
    for i in 1..30 {
        let name = format!("VHD-node-{i}");
        t.storage.mk_lv(&name, 8 * MIB);
        t.storage.mk_vhd(&name, GIB, Some(&format!("VHD-node-{}", i - 1)));
    }

    let err = t.sr.snapshot("node-29", &params(SnapshotMode::Double));
    assert!(matches!(err, Err(StorageError::VdiUnavailable { .. })));
}

#[test]
fn test_snapshot_rejects_when_no_space() {
    let dir = tempdir().unwrap();
    let t = build_sr(dir.path(), Provisioning::Thin);
    t.sr.attach().unwrap();
    t.sr.create_vdi(UUID_A, GIB, VdiType::Vhd, "disk", "").unwrap();

    t.storage.set_free_space(MIB);
    let err = t.sr.snapshot(UUID_A, &params(SnapshotMode::Double));
    assert!(matches!(err, Err(StorageError::SrNoSpace { .. })));
    // rejected before any mutation: original untouched, no journal entry
    assert!(t.storage.lv(&format!("VHD-{UUID_A}")).is_some());
    assert!(t.journal.get_all(JRN_CLONE).unwrap().is_empty());
}

#[test]
fn test_mid_operation_failure_rolls_back() {
    let dir = tempdir().unwrap();
    let t = build_sr(dir.path(), Provisioning::Thin);
    t.sr.attach().unwrap();
    t.sr.create_vdi(UUID_A, GIB, VdiType::Vhd, "disk", "").unwrap();

    // fail right after the children are created
    t.sr.faults().arm("clone.children");
    let err = t.sr.snapshot(UUID_A, &params(SnapshotMode::Double));
    assert!(matches!(err, Err(StorageError::VdiClone(_))));

    // fully rolled back: original leaf back under its own name, no
    // base/clone leftovers, journal drained
    let lv_names = t.storage.lv_names();
    assert!(lv_names.contains(&format!("VHD-{UUID_A}")));
    assert_eq!(
        lv_names.iter().filter(|n| n.starts_with("VHD-")).count(),
        1
    );
    let orig = t.storage.lv(&format!("VHD-{UUID_A}")).unwrap();
    assert!(!orig.tags.iter().any(|tag| tag == "hidden"));
    assert!(!orig.read_only);
    assert!(t.journal.get_all(JRN_CLONE).unwrap().is_empty());
}

#[test]
fn test_attached_elsewhere_gets_full_leaves_and_refresh() {
    let dir = tempdir().unwrap();
    let t = build_sr(dir.path(), Provisioning::Thin);
    t.sr.attach().unwrap();
    t.sr.create_vdi(UUID_A, GIB, VdiType::Vhd, "disk", "").unwrap();

    let result = t
        .sr
        .snapshot(
            UUID_A,
            &SnapshotParams {
                mode: SnapshotMode::Double,
                attached_on_other_hosts: true,
            },
        )
        .unwrap();

    // full provisioning: a later attach on another host must not rely on
    // an inflate racing this one
    let clone_lv = format!("VHD-{}", result.clone_uuid.unwrap());
    assert_eq!(t.storage.lv(&clone_lv).unwrap().size, calc_size_vhd_lv(GIB));

    // the other hosts were told to re-read the renamed LVs
    let refreshed = t.refresher.refreshed();
    assert!(refreshed.contains(&format!("VHD-{}", result.base_uuid)));
    assert!(refreshed.contains(&format!("VHD-{UUID_A}")));
}
