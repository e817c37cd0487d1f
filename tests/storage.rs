//! Persistence integration tests: snapshot round-trips, backup rotation,
//! restore, and metadata ledger behavior across reopen.
//!
//! Run with:
//!   cargo test --test storage

use tempfile::TempDir;

use topichub::model::{from_xml, to_xml, Document, Topic};
use topichub::storage::{MetadataLedger, SnapshotStore};

fn sample_document() -> Document {
    let mut doc = Document::new();
    doc.add_application("VideoViewer", "Operator UI").unwrap();
    doc.add_topic(
        "VideoViewer",
        Topic::new(
            "PTZ_CONTROL",
            "ptz_control.proto",
            "publish".parse().unwrap(),
            "Pan/tilt/zoom commands",
        ),
    )
    .unwrap();
    doc
}

#[test]
fn test_document_round_trips_through_store() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::open(dir.path(), true, 10).unwrap();

    let doc = sample_document();
    store.save_snapshot("applications.xml", &to_xml(&doc)).unwrap();
    let loaded = from_xml(&store.load_snapshot("applications.xml").unwrap()).unwrap();
    assert_eq!(loaded, doc);
}

#[test]
fn test_rotation_holds_at_limit() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::open(dir.path(), true, 5).unwrap();

    for i in 0..12 {
        store
            .save_snapshot("applications.xml", &format!("<Applications v=\"{}\"/>", i))
            .unwrap();
    }

    let backups = store.list_backups().unwrap();
    assert_eq!(backups.len(), 5);
    // Newest-first ordering.
    for pair in backups.windows(2) {
        assert!(pair[0].created >= pair[1].created);
    }
}

#[test]
fn test_rotation_is_per_snapshot_name() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::open(dir.path(), true, 2).unwrap();

    for i in 0..4 {
        store.save_snapshot("first.xml", &format!("f{}", i)).unwrap();
        store.save_snapshot("second.xml", &format!("s{}", i)).unwrap();
    }

    let backups = store.list_backups().unwrap();
    let first: Vec<_> = backups.iter().filter(|b| b.name.starts_with("first_")).collect();
    let second: Vec<_> = backups.iter().filter(|b| b.name.starts_with("second_")).collect();
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
}

#[test]
fn test_restore_round_trip_is_reversible() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::open(dir.path(), true, 10).unwrap();

    store.save_snapshot("a.xml", "generation-1").unwrap();
    store.save_snapshot("a.xml", "generation-2").unwrap();

    let gen1_backup = store
        .list_backups()
        .unwrap()
        .into_iter()
        .find(|b| store.load_backup(&b.name).unwrap() == "generation-1")
        .unwrap();

    store.restore_backup(&gen1_backup.name, "a.xml").unwrap();
    assert_eq!(store.load_snapshot("a.xml").unwrap(), "generation-1");

    // generation-2 was preserved by the restore's own backup; going back
    // is possible.
    let gen2_backup = store
        .list_backups()
        .unwrap()
        .into_iter()
        .find(|b| store.load_backup(&b.name).unwrap() == "generation-2")
        .unwrap();
    store.restore_backup(&gen2_backup.name, "a.xml").unwrap();
    assert_eq!(store.load_snapshot("a.xml").unwrap(), "generation-2");
}

#[test]
fn test_ledger_versions_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = SnapshotStore::open(dir.path(), true, 10).unwrap();
        assert_eq!(store.save_snapshot("a.xml", "1").unwrap(), 1);
        assert_eq!(store.save_snapshot("a.xml", "2").unwrap(), 2);
    }
    let store = SnapshotStore::open(dir.path(), true, 10).unwrap();
    assert_eq!(store.save_snapshot("a.xml", "3").unwrap(), 3);

    let snapshots = store.list_snapshots().unwrap();
    let entry = snapshots.iter().find(|s| s.name == "a.xml").unwrap();
    assert_eq!(entry.version, Some(3));
}

#[test]
fn test_corrupt_ledger_does_not_block_startup() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("metadata.json"), "{not json").unwrap();

    let store = SnapshotStore::open(dir.path(), true, 10).unwrap();
    // Counting restarts at 1 with a fresh ledger.
    assert_eq!(store.save_snapshot("a.xml", "x").unwrap(), 1);
}

#[test]
fn test_ledger_settings_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("metadata.json");

    let mut ledger = MetadataLedger::default();
    ledger.auto_backup = false;
    ledger.backup_interval_secs = 60;
    ledger.max_backups = 3;
    ledger.record_save("a.xml", 42);
    ledger.save(&path).unwrap();

    let reloaded = MetadataLedger::load(&path);
    assert!(!reloaded.auto_backup);
    assert_eq!(reloaded.backup_interval_secs, 60);
    assert_eq!(reloaded.max_backups, 3);
    assert_eq!(reloaded.entry("a.xml").unwrap().version, 1);
    assert_eq!(reloaded.entry("a.xml").unwrap().size, 42);

    // The serialized form keeps the wire field name.
    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.contains("\"backup_interval\""));
}

#[test]
fn test_storage_info_totals() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::open(dir.path(), true, 10).unwrap();

    store.save_snapshot("a.xml", "12345").unwrap();
    store.save_snapshot("a.xml", "67890ab").unwrap();

    let info = store.storage_info().unwrap();
    assert_eq!(info.snapshot_count, 1);
    assert_eq!(info.backup_count, 1);
    assert_eq!(info.snapshot_total_size, 7);
    assert_eq!(info.backup_total_size, 5);
    assert_eq!(info.total_size, 12);
    assert!(info.auto_backup);
    assert_eq!(info.max_backups, 10);
}
