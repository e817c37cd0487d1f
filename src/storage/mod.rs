//! Durable persistence: snapshots, rotated backups, and the metadata ledger.

mod file_manager;
mod ledger;

use std::path::Path;
use std::time::Duration;

use thiserror::Error;

pub use file_manager::{BackupInfo, SnapshotInfo, SnapshotStore, StorageInfo};
pub use ledger::{FileEntry, MetadataLedger};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot not found: {0}")]
    SnapshotMissing(String),
    #[error("backup not found: {0}")]
    BackupMissing(String),
    #[error("invalid file name: {0}")]
    InvalidName(String),
    #[error("metadata ledger error: {0}")]
    Ledger(String),
    #[error("save timed out after {0:?}")]
    Timeout(Duration),
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
