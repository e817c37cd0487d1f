//! Engine configuration
//!
//! One flat struct with serde support so deployments can load it from a
//! JSON file; every field has a working default.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the persistence tree (xml/, backups/, metadata.json).
    pub data_dir: PathBuf,
    /// Filename of the primary shared snapshot.
    pub snapshot_name: String,
    /// Quiet window between an edit and the autosave write.
    pub debounce_secs: u64,
    /// Upper bound on one snapshot write.
    pub save_timeout_secs: u64,
    /// Backups retained per snapshot name.
    pub max_backups: usize,
    /// Back up the previous content before an overwrite.
    pub auto_backup: bool,
    /// Periodic backup interval recorded in the metadata ledger.
    pub backup_interval_secs: u64,
    /// Sessions silent this long are swept.
    pub session_idle_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            snapshot_name: "applications.xml".to_string(),
            debounce_secs: 2,
            save_timeout_secs: 10,
            max_backups: 10,
            auto_backup: true,
            backup_interval_secs: 300,
            session_idle_timeout_secs: 300,
        }
    }
}

impl EngineConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn save_timeout(&self) -> Duration {
        Duration::from_secs(self.save_timeout_secs)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }
}
