//! Metadata ledger
//!
//! A JSON document persisted alongside the snapshots, mapping each
//! snapshot filename to a monotonically increasing version counter plus
//! size and timestamp, together with the global backup settings. Read on
//! startup, rewritten after every successful persist.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StorageError;

/// Ledger format version.
const LEDGER_VERSION: &str = "1.0";

/// Per-snapshot bookkeeping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub version: u64,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataLedger {
    pub version: String,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub files: BTreeMap<String, FileEntry>,
    pub auto_backup: bool,
    #[serde(rename = "backup_interval")]
    pub backup_interval_secs: u64,
    pub max_backups: usize,
}

impl Default for MetadataLedger {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: LEDGER_VERSION.to_string(),
            created: now,
            last_modified: now,
            files: BTreeMap::new(),
            auto_backup: true,
            backup_interval_secs: 300,
            max_backups: 10,
        }
    }
}

impl MetadataLedger {
    /// Load the ledger, falling back to defaults when the file is missing
    /// or unreadable (a corrupt ledger must never block startup).
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(ledger) => ledger,
                Err(e) => {
                    log::warn!("Metadata ledger {} is corrupt ({}), starting fresh", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                log::warn!("Failed to read metadata ledger {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&mut self, path: &Path) -> Result<(), StorageError> {
        self.last_modified = Utc::now();
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| StorageError::Ledger(e.to_string()))?;
        fs::write(path, json).map_err(|e| StorageError::io(path, e))
    }

    /// Record a successful persist: bump the version counter, update size
    /// and timestamp. Returns the new version.
    pub fn record_save(&mut self, name: &str, size: u64) -> u64 {
        let entry = self.files.entry(name.to_string()).or_insert(FileEntry {
            version: 0,
            size: 0,
            modified: Utc::now(),
        });
        entry.version += 1;
        entry.size = size;
        entry.modified = Utc::now();
        entry.version
    }

    pub fn entry(&self, name: &str) -> Option<&FileEntry> {
        self.files.get(name)
    }

    pub fn remove(&mut self, name: &str) {
        self.files.remove(name);
    }
}
