//! Startup reconciliation after crashes and out-of-band changes

mod common;

use common::{Harness, MIB};
use rbdset::set::{METADATA_DIR, METADATA_FILE};
use rbdset::store::MetadataStore;
use rbdset::{BlockBackend, BlockRef, Device, DeviceState, RbdError, RbdSet};

fn store(h: &Harness) -> MetadataStore {
    MetadataStore::open(h.home.join(METADATA_DIR).join(METADATA_FILE), false).unwrap()
}

#[test]
fn test_interrupted_create_is_rolled_back() {
    let h = Harness::new();
    {
        let set = h.open().unwrap();
        set.add_device("base", None).unwrap();
    }

    // Crash after the image was created but before the record became Ready
    {
        let store = store(&h);
        let mut half = Device::new(
            "half".to_string(),
            None,
            BlockRef::new("rbd", "layer_half"),
            MIB,
        );
        store.insert_new(&mut half).unwrap();
        let mut never = Device::new(
            "never".to_string(),
            None,
            BlockRef::new("rbd", "layer_never"),
            MIB,
        );
        store.insert_new(&mut never).unwrap();
    }
    h.cluster
        .connect("rbd")
        .create_image("layer_half", MIB)
        .unwrap();

    let set = h.open().unwrap();
    let report = set.reconcile_report();
    assert_eq!(report.rolled_back, vec!["half".to_string(), "never".to_string()]);
    assert!(!set.has_device("half"));
    assert!(set.has_device("base"));
    assert_eq!(h.images(), vec!["layer_base".to_string()]);

    // The id can be used again
    set.add_device("half", Some("base")).unwrap();
}

#[test]
fn test_interrupted_delete_is_completed() {
    let h = Harness::new();
    {
        let set = h.open().unwrap();
        set.add_device("base", None).unwrap();
        set.add_device("child", Some("base")).unwrap();
    }

    {
        let store = store(&h);
        let mut child = store.load().unwrap().remove("child").unwrap();
        child.state = DeviceState::Deleting;
        store.save(&child).unwrap();
    }

    let set = h.open().unwrap();
    assert_eq!(
        set.reconcile_report().completed_deletes,
        vec!["child".to_string()]
    );
    assert!(!set.has_device("child"));
    assert_eq!(h.images(), vec!["layer_base".to_string()]);

    // The parent is free to go now
    set.delete_device("base").unwrap();
    assert!(h.images().is_empty());
}

#[test]
fn test_orphaned_records() {
    let h = Harness::new();
    {
        let set = h.open().unwrap();
        set.add_device("base", None).unwrap();
        set.add_device("child", Some("base")).unwrap();
        set.add_device("loner", None).unwrap();
    }

    // Images removed behind the store's back
    h.cluster.destroy_image("rbd", "layer_loner");
    h.cluster.destroy_image("rbd", "layer_base");

    let set = h.open().unwrap();
    let report = set.reconcile_report();
    assert_eq!(report.dropped_orphans, vec!["loner".to_string()]);
    // Still referenced by a child
    assert_eq!(report.kept_orphans, vec!["base".to_string()]);
    assert!(!set.has_device("loner"));
    assert!(set.has_device("base"));

    // Deleting top-down still works against the missing image
    set.delete_device("child").unwrap();
    set.delete_device("base").unwrap();
    assert!(h.images().is_empty());
}

#[test]
fn test_orphan_chain_dropped_bottom_up() {
    let h = Harness::new();
    {
        let set = h.open().unwrap();
        set.add_device("base", None).unwrap();
        set.add_device("child", Some("base")).unwrap();
    }
    h.cluster.destroy_image("rbd", "layer_child");
    h.cluster.destroy_image("rbd", "layer_base");

    let set = h.open().unwrap();
    let report = set.reconcile_report();
    assert_eq!(
        report.dropped_orphans,
        vec!["child".to_string(), "base".to_string()]
    );
    assert!(report.kept_orphans.is_empty());
    assert!(set.list_devices().is_empty());
}

#[test]
fn test_untracked_images_are_reported_not_deleted() {
    let h = Harness::new();
    {
        let set = h.open().unwrap();
        set.add_device("base", None).unwrap();
    }
    let backend = h.cluster.connect("rbd");
    backend.create_image("layer_stray", MIB).unwrap();
    backend.create_image("foreign", MIB).unwrap();

    let set = h.open().unwrap();
    assert_eq!(
        set.reconcile_report().untracked_images,
        vec!["layer_stray".to_string()]
    );
    assert_eq!(h.images().len(), 3);
}

#[test]
fn test_stale_mount_is_cleared() {
    let h = Harness::new();
    let target = h.target("base");
    {
        let set = h.open().unwrap();
        set.add_device("base", None).unwrap();
        set.mount_device("base", &target, "").unwrap();
    }
    // Unmounted outside the store, mapping left behind
    h.mounter.unmount_all();
    assert_eq!(h.cluster.mapped_count(), 1);

    let set = h.open().unwrap();
    assert_eq!(set.reconcile_report().stale_mounts, vec!["base".to_string()]);
    assert_eq!(h.cluster.mapped_count(), 0);
    assert_eq!(set.status().mounted, 0);
    drop(set);

    // The cleared state was persisted
    let set = h.open().unwrap();
    assert!(set.reconcile_report().is_clean());
    set.delete_device("base").unwrap();
}

#[test]
fn test_unreachable_cluster_fails_open() {
    let h = Harness::new();
    {
        let set = h.open().unwrap();
        set.add_device("base", None).unwrap();
    }

    h.cluster.set_reachable(false);
    assert!(matches!(
        h.open(),
        Err(RbdError::BackendUnavailable {
            transient: true,
            ..
        })
    ));

    h.cluster.set_reachable(true);
    let set = h.open().unwrap();
    assert!(set.has_device("base"));
}

#[test]
fn test_options_are_validated() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        RbdSet::new(dir.path(), true, &["rbd.backend=memory", "rbd.bogus=1"]),
        Err(RbdError::InvalidConfig(_))
    ));
    assert!(matches!(
        RbdSet::new(dir.path(), true, &["rbd.backend=memory", "rbd.basesize=lots"]),
        Err(RbdError::InvalidConfig(_))
    ));

    let set = RbdSet::new(dir.path(), true, &["rbd.backend=memory", "rbd.basesize=512M"]).unwrap();
    set.add_device("base", None).unwrap();
    assert_eq!(
        set.export_device_metadata("base").unwrap().size_bytes,
        512 * MIB
    );
}
