//! Snapshot persistence and backup management
//!
//! Owns the on-disk layout: `<data>/xml/` for primary snapshots,
//! `<data>/backups/` for the rotated backup set, `<data>/metadata.json`
//! for the ledger. Three invariants hold on every write path:
//!
//! - backup-before-overwrite: a save never destroys the only copy of the
//!   previous state;
//! - atomic primary writes: content lands in a sibling temp file and is
//!   renamed into place, so a crash mid-write cannot truncate the primary;
//! - per-file exclusivity: writes to one snapshot name serialize on a
//!   per-name lock, so the backup-then-write sequence never interleaves
//!   with another writer of the same file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ledger::MetadataLedger;
use super::StorageError;

/// A primary snapshot as reported by listings.
#[derive(Clone, Debug, Serialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Ledger version counter, if the ledger knows this file.
    pub version: Option<u64>,
}

/// A backup as reported by listings. Immutable once written.
#[derive(Clone, Debug, Serialize)]
pub struct BackupInfo {
    pub name: String,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// Aggregate storage usage.
#[derive(Clone, Debug, Serialize)]
pub struct StorageInfo {
    pub snapshot_count: usize,
    pub backup_count: usize,
    pub snapshot_total_size: u64,
    pub backup_total_size: u64,
    pub total_size: u64,
    pub auto_backup: bool,
    pub max_backups: usize,
}

pub struct SnapshotStore {
    xml_dir: PathBuf,
    backup_dir: PathBuf,
    metadata_path: PathBuf,
    auto_backup: bool,
    max_backups: usize,
    ledger: Mutex<MetadataLedger>,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SnapshotStore {
    /// Open (creating directories as needed) the store rooted at `base_dir`.
    pub fn open(base_dir: &Path, auto_backup: bool, max_backups: usize) -> Result<Self, StorageError> {
        let xml_dir = base_dir.join("xml");
        let backup_dir = base_dir.join("backups");
        let metadata_path = base_dir.join("metadata.json");

        fs::create_dir_all(&xml_dir).map_err(|e| StorageError::io(&xml_dir, e))?;
        fs::create_dir_all(&backup_dir).map_err(|e| StorageError::io(&backup_dir, e))?;

        let mut ledger = MetadataLedger::load(&metadata_path);
        ledger.auto_backup = auto_backup;
        ledger.max_backups = max_backups;

        log::info!(
            "Snapshot store at {} ({} known files)",
            base_dir.display(),
            ledger.files.len()
        );

        Ok(Self {
            xml_dir,
            backup_dir,
            metadata_path,
            auto_backup,
            max_backups,
            ledger: Mutex::new(ledger),
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    fn snapshot_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_name(name)?;
        Ok(self.xml_dir.join(name))
    }

    fn backup_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_name(name)?;
        Ok(self.backup_dir.join(name))
    }

    /// The write lock for one snapshot name. Held across every sequence
    /// that must not interleave: backup-then-overwrite, backup-then-delete,
    /// backup-then-restore.
    fn file_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.write_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Persist a snapshot. Backs up any existing content first, writes
    /// atomically, and updates the ledger. Returns the new version.
    /// Concurrent saves of the same name serialize on the file lock, so
    /// each committed state lands in the backup set before the next
    /// writer overwrites it.
    pub fn save_snapshot(&self, name: &str, content: &str) -> Result<u64, StorageError> {
        let path = self.snapshot_path(name)?;
        let lock = self.file_lock(name);
        let _guard = hold(&lock);

        if path.exists() && self.auto_backup {
            self.backup_locked(name)?;
        }

        let tmp = self.xml_dir.join(format!(".{}.tmp", name));
        fs::write(&tmp, content.as_bytes()).map_err(|e| StorageError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| StorageError::io(&path, e))?;

        let version = {
            let mut ledger = self.lock_ledger();
            let version = ledger.record_save(name, content.len() as u64);
            ledger.save(&self.metadata_path)?;
            version
        };
        log::info!("Saved snapshot {} (version {})", name, version);
        Ok(version)
    }

    pub fn load_snapshot(&self, name: &str) -> Result<String, StorageError> {
        let path = self.snapshot_path(name)?;
        if !path.exists() {
            return Err(StorageError::SnapshotMissing(name.to_string()));
        }
        fs::read_to_string(&path).map_err(|e| StorageError::io(&path, e))
    }

    pub fn snapshot_exists(&self, name: &str) -> bool {
        self.snapshot_path(name).map(|p| p.exists()).unwrap_or(false)
    }

    /// Delete a snapshot, taking one final backup of it first.
    pub fn delete_snapshot(&self, name: &str) -> Result<(), StorageError> {
        let path = self.snapshot_path(name)?;
        let lock = self.file_lock(name);
        let _guard = hold(&lock);
        if !path.exists() {
            return Err(StorageError::SnapshotMissing(name.to_string()));
        }
        self.backup_locked(name)?;
        fs::remove_file(&path).map_err(|e| StorageError::io(&path, e))?;
        let mut ledger = self.lock_ledger();
        ledger.remove(name);
        ledger.save(&self.metadata_path)?;
        Ok(())
    }

    /// Copy the named snapshot into the backup set and rotate. Returns the
    /// backup filename.
    pub fn create_backup(&self, name: &str) -> Result<String, StorageError> {
        let lock = self.file_lock(name);
        let _guard = hold(&lock);
        self.backup_locked(name)
    }

    /// Backup body; the caller holds the file lock for `name`.
    fn backup_locked(&self, name: &str) -> Result<String, StorageError> {
        let source = self.snapshot_path(name)?;
        if !source.exists() {
            return Err(StorageError::SnapshotMissing(name.to_string()));
        }

        let (stem, ext) = split_name(name);
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let mut backup_name = format!("{}_{}.{}", stem, timestamp, ext);

        // The timestamp only resolves seconds; disambiguate with a counter
        // so names stay unique and sortable by creation order.
        let mut n = 0;
        while self.backup_dir.join(&backup_name).exists() {
            n += 1;
            backup_name = format!("{}_{}_{}.{}", stem, timestamp, n, ext);
        }

        let backup_path = self.backup_dir.join(&backup_name);
        fs::copy(&source, &backup_path).map_err(|e| StorageError::io(&backup_path, e))?;
        log::info!("Backed up {} as {}", name, backup_name);

        self.rotate_backups(&stem, &ext)?;
        Ok(backup_name)
    }

    /// Keep only the newest `max_backups` backups for one base name.
    fn rotate_backups(&self, stem: &str, ext: &str) -> Result<(), StorageError> {
        let prefix = format!("{}_", stem);
        let suffix = format!(".{}", ext);

        let mut backups: Vec<(PathBuf, DateTime<Utc>, String)> = Vec::new();
        let entries =
            fs::read_dir(&self.backup_dir).map_err(|e| StorageError::io(&self.backup_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&self.backup_dir, e))?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !file_name.starts_with(&prefix) || !file_name.ends_with(&suffix) {
                continue;
            }
            // The piece between prefix and suffix must be the timestamp
            // the backup writer appends; a sibling snapshot whose name
            // extends this stem (`a_b.xml` next to `a.xml`) also matches
            // the prefix test and must not be rotated here.
            let middle = file_name
                .len()
                .checked_sub(suffix.len())
                .filter(|end| *end >= prefix.len())
                .map(|end| &file_name[prefix.len()..end]);
            if !middle.is_some_and(is_backup_timestamp) {
                continue;
            }
            let meta = entry.metadata().map_err(|e| StorageError::io(&entry.path(), e))?;
            backups.push((entry.path(), modified_time(&meta), file_name));
        }

        // Newest first; equal mtimes fall back to the name, which embeds
        // the creation timestamp and counter.
        backups.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));

        for (path, _, file_name) in backups.into_iter().skip(self.max_backups) {
            fs::remove_file(&path).map_err(|e| StorageError::io(&path, e))?;
            log::info!("Rotated out old backup {}", file_name);
        }
        Ok(())
    }

    /// Restore a backup over a target snapshot. The target's current
    /// content is backed up first, so a restore is itself undoable.
    pub fn restore_backup(&self, backup_name: &str, target_name: &str) -> Result<(), StorageError> {
        let backup_path = self.backup_path(backup_name)?;
        if !backup_path.exists() {
            return Err(StorageError::BackupMissing(backup_name.to_string()));
        }
        let target_path = self.snapshot_path(target_name)?;
        let lock = self.file_lock(target_name);
        let _guard = hold(&lock);

        if target_path.exists() {
            self.backup_locked(target_name)?;
        }

        fs::copy(&backup_path, &target_path).map_err(|e| StorageError::io(&target_path, e))?;
        let size = fs::metadata(&target_path)
            .map_err(|e| StorageError::io(&target_path, e))?
            .len();

        let mut ledger = self.lock_ledger();
        ledger.record_save(target_name, size);
        ledger.save(&self.metadata_path)?;

        log::info!("Restored {} from backup {}", target_name, backup_name);
        Ok(())
    }

    /// List primary snapshots, newest first. Read-only.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, StorageError> {
        let ledger = self.lock_ledger();
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.xml_dir).map_err(|e| StorageError::io(&self.xml_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&self.xml_dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata().map_err(|e| StorageError::io(&entry.path(), e))?;
            out.push(SnapshotInfo {
                version: ledger.entry(&name).map(|e| e.version),
                size: meta.len(),
                modified: modified_time(&meta),
                name,
            });
        }
        out.sort_by(|a, b| b.modified.cmp(&a.modified).then(b.name.cmp(&a.name)));
        Ok(out)
    }

    /// List backups, newest first. Read-only.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, StorageError> {
        let mut out = Vec::new();
        let entries =
            fs::read_dir(&self.backup_dir).map_err(|e| StorageError::io(&self.backup_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&self.backup_dir, e))?;
            let meta = entry.metadata().map_err(|e| StorageError::io(&entry.path(), e))?;
            out.push(BackupInfo {
                name: entry.file_name().to_string_lossy().to_string(),
                size: meta.len(),
                created: created_time(&meta),
                modified: modified_time(&meta),
            });
        }
        out.sort_by(|a, b| b.created.cmp(&a.created).then(b.name.cmp(&a.name)));
        Ok(out)
    }

    /// Aggregate usage. Read-only.
    pub fn storage_info(&self) -> Result<StorageInfo, StorageError> {
        let snapshots = self.list_snapshots()?;
        let backups = self.list_backups()?;
        let snapshot_total_size: u64 = snapshots.iter().map(|s| s.size).sum();
        let backup_total_size: u64 = backups.iter().map(|b| b.size).sum();
        Ok(StorageInfo {
            snapshot_count: snapshots.len(),
            backup_count: backups.len(),
            snapshot_total_size,
            backup_total_size,
            total_size: snapshot_total_size + backup_total_size,
            auto_backup: self.auto_backup,
            max_backups: self.max_backups,
        })
    }

    pub fn load_backup(&self, backup_name: &str) -> Result<String, StorageError> {
        let path = self.backup_path(backup_name)?;
        if !path.exists() {
            return Err(StorageError::BackupMissing(backup_name.to_string()));
        }
        fs::read_to_string(&path).map_err(|e| StorageError::io(&path, e))
    }

    fn lock_ledger(&self) -> MutexGuard<'_, MetadataLedger> {
        // A poisoned ledger lock means a panic mid-update; the ledger is
        // advisory bookkeeping, so recover the guard rather than abort.
        match self.ledger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Hold a file lock, recovering the guard if a previous holder panicked.
/// The disk state a panicking writer leaves behind is at worst a stale
/// temp file, which the next rename replaces.
fn hold(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Whether `suffix` has the `YYYYMMDD_HHMMSS` shape (optionally `_{n}`)
/// that `create_backup` appends after the stem.
fn is_backup_timestamp(suffix: &str) -> bool {
    let bytes = suffix.as_bytes();
    if bytes.len() < 15 {
        return false;
    }
    let digits = |range: std::ops::Range<usize>| bytes[range].iter().all(u8::is_ascii_digit);
    if !digits(0..8) || bytes[8] != b'_' || !digits(9..15) {
        return false;
    }
    match &bytes[15..] {
        [] => true,
        [b'_', rest @ ..] => !rest.is_empty() && rest.iter().all(u8::is_ascii_digit),
        _ => false,
    }
}

/// Reject names that escape the managed directories.
fn validate_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.starts_with('.')
    {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn split_name(name: &str) -> (String, String) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), ext.to_string()),
        _ => (name.to_string(), "bak".to_string()),
    }
}

fn modified_time(meta: &fs::Metadata) -> DateTime<Utc> {
    meta.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now())
}

fn created_time(meta: &fs::Metadata) -> DateTime<Utc> {
    // Creation time is not available on every filesystem; fall back to
    // the modification time, which rotation ordering tolerates.
    meta.created()
        .or_else(|_| meta.modified())
        .map(DateTime::from)
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> SnapshotStore {
        SnapshotStore::open(dir.path(), true, 10).unwrap()
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save_snapshot("applications.xml", "<a/>").unwrap();
        assert_eq!(store.load_snapshot("applications.xml").unwrap(), "<a/>");
    }

    #[test]
    fn test_first_save_creates_no_backup() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save_snapshot("applications.xml", "v1").unwrap();
        assert!(store.list_backups().unwrap().is_empty());
    }

    #[test]
    fn test_backup_before_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save_snapshot("applications.xml", "v1").unwrap();
        store.save_snapshot("applications.xml", "v2").unwrap();

        let backups = store.list_backups().unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(store.load_backup(&backups[0].name).unwrap(), "v1");
        assert_eq!(store.load_snapshot("applications.xml").unwrap(), "v2");
    }

    #[test]
    fn test_versions_increment() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(store.save_snapshot("a.xml", "1").unwrap(), 1);
        assert_eq!(store.save_snapshot("a.xml", "2").unwrap(), 2);
        assert_eq!(store.save_snapshot("a.xml", "3").unwrap(), 3);
    }

    #[test]
    fn test_rotation_keeps_newest_n() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path(), true, 3).unwrap();
        for i in 0..6 {
            store.save_snapshot("a.xml", &format!("v{}", i)).unwrap();
        }
        // 6 saves: 5 backups created, rotated down to 3.
        let backups = store.list_backups().unwrap();
        assert_eq!(backups.len(), 3);
        // The newest three backups hold v2, v3, v4 (v5 is the primary).
        let mut contents: Vec<String> = backups
            .iter()
            .map(|b| store.load_backup(&b.name).unwrap())
            .collect();
        contents.sort();
        assert_eq!(contents, vec!["v2", "v3", "v4"]);
    }

    #[test]
    fn test_restore_is_reversible() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save_snapshot("a.xml", "old").unwrap();
        store.save_snapshot("a.xml", "current").unwrap();

        let backups = store.list_backups().unwrap();
        let old_backup = backups[0].name.clone();
        assert_eq!(store.load_backup(&old_backup).unwrap(), "old");

        store.restore_backup(&old_backup, "a.xml").unwrap();
        assert_eq!(store.load_snapshot("a.xml").unwrap(), "old");

        // The pre-restore content was itself backed up.
        let backups = store.list_backups().unwrap();
        assert!(backups.iter().any(|b| b.name == old_backup));
        assert!(backups
            .iter()
            .any(|b| store.load_backup(&b.name).unwrap() == "current"));
    }

    #[test]
    fn test_restore_missing_backup_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save_snapshot("a.xml", "v1").unwrap();
        let before = store.list_backups().unwrap().len();

        let err = store.restore_backup("a_19700101_000000.xml", "a.xml").unwrap_err();
        assert!(matches!(err, StorageError::BackupMissing(_)));
        assert_eq!(store.list_backups().unwrap().len(), before);
        assert_eq!(store.load_snapshot("a.xml").unwrap(), "v1");
    }

    #[test]
    fn test_listings_do_not_mutate() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save_snapshot("a.xml", "v1").unwrap();
        store.save_snapshot("a.xml", "v2").unwrap();

        let before: Vec<String> = store.list_backups().unwrap().iter().map(|b| b.name.clone()).collect();
        let _ = store.storage_info().unwrap();
        let _ = store.list_snapshots().unwrap();
        let after: Vec<String> = store.list_backups().unwrap().iter().map(|b| b.name.clone()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_delete_backs_up_first() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save_snapshot("a.xml", "v1").unwrap();
        store.delete_snapshot("a.xml").unwrap();

        assert!(!store.snapshot_exists("a.xml"));
        let backups = store.list_backups().unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(store.load_backup(&backups[0].name).unwrap(), "v1");
    }

    #[test]
    fn test_path_escapes_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(matches!(
            store.save_snapshot("../evil.xml", "x"),
            Err(StorageError::InvalidName(_))
        ));
        assert!(matches!(
            store.load_snapshot("a/b.xml"),
            Err(StorageError::InvalidName(_))
        ));
    }

    #[test]
    fn test_concurrent_saves_keep_every_prior_state() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store(&dir));
        store.save_snapshot("applications.xml", "committed").unwrap();

        // Two racing writers of the same file. Each must back up the
        // state it found before overwriting it.
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let mut writers = Vec::new();
        for content in ["AAAA", "BBBB"] {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            writers.push(std::thread::spawn(move || {
                barrier.wait();
                store.save_snapshot("applications.xml", content).unwrap();
            }));
        }
        for writer in writers {
            writer.join().unwrap();
        }

        let primary = store.load_snapshot("applications.xml").unwrap();
        assert!(primary == "AAAA" || primary == "BBBB");

        let backups: Vec<String> = store
            .list_backups()
            .unwrap()
            .iter()
            .map(|b| store.load_backup(&b.name).unwrap())
            .collect();
        let loser = if primary == "AAAA" { "BBBB" } else { "AAAA" };
        assert!(backups.iter().any(|c| c == "committed"));
        assert!(backups.iter().any(|c| c == loser));
    }

    #[test]
    fn test_rotation_scoped_to_own_base_name() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path(), true, 2).unwrap();

        // a_b.xml's backups share the "a_" prefix with a.xml's.
        store.save_snapshot("a_b.xml", "sibling v0").unwrap();
        store.save_snapshot("a_b.xml", "sibling v1").unwrap();
        store.save_snapshot("a_b.xml", "sibling v2").unwrap();

        for i in 0..4 {
            store.save_snapshot("a.xml", &format!("v{}", i)).unwrap();
        }

        // Rotating a.xml left a_b.xml's backups untouched, and held
        // a.xml's own set at the limit.
        let backups = store.list_backups().unwrap();
        let sibling = backups.iter().filter(|b| b.name.starts_with("a_b_")).count();
        assert_eq!(sibling, 2);
        assert_eq!(backups.len() - sibling, 2);
    }

    #[test]
    fn test_backup_names_sortable_and_unique() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save_snapshot("a.xml", "v0").unwrap();
        // Burst of saves inside one second still yields distinct backups.
        store.save_snapshot("a.xml", "v1").unwrap();
        store.save_snapshot("a.xml", "v2").unwrap();
        store.save_snapshot("a.xml", "v3").unwrap();
        let backups = store.list_backups().unwrap();
        assert_eq!(backups.len(), 3);
        let mut names: Vec<&str> = backups.iter().map(|b| b.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 3);
    }
}
