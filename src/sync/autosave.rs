//! Debounced background persistence
//!
//! Mutations mark a snapshot dirty; the worker waits out a quiet window
//! before writing so a burst of edits costs one disk write. At most one
//! save per filename is in flight at a time. Dirty marks arriving during
//! a save set a follow-up flag and trigger another save when the first
//! completes, so the last write always reflects the latest state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task;
use tokio::time;

use crate::storage::{SnapshotStore, StorageError};

/// Per-snapshot persistence state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveState {
    /// On-disk content matches the in-memory document.
    Clean,
    /// Edited since the last save; a save is scheduled.
    Dirty,
    /// A save is currently running.
    Saving,
    /// The last save attempt failed; treated as dirty for retry.
    Failed,
}

/// Messages into the autosave worker.
#[derive(Debug)]
pub enum SaveTrigger {
    /// Content changed; save after the debounce window.
    Dirty(String),
    /// Save immediately, skipping the debounce window.
    Flush(String),
}

/// Produces the bytes to persist for a named snapshot.
///
/// The worker calls this at save time rather than capturing content at
/// dirty time, so coalesced saves pick up the latest state.
pub trait SnapshotSource: Send + Sync + 'static {
    fn render(&self, name: &str) -> Result<String, StorageError>;
}

struct PendingSave {
    deadline: time::Instant,
}

pub struct AutosaveWorker {
    store: Arc<SnapshotStore>,
    source: Arc<dyn SnapshotSource>,
    debounce: Duration,
    save_timeout: Duration,
    trigger_rx: mpsc::Receiver<SaveTrigger>,
    shutdown_rx: broadcast::Receiver<()>,
    state_tx: mpsc::Sender<(String, SaveState)>,
}

/// Handle for feeding the worker.
#[derive(Clone)]
pub struct AutosaveHandle {
    trigger_tx: mpsc::Sender<SaveTrigger>,
}

impl AutosaveHandle {
    pub async fn mark_dirty(&self, name: &str) {
        let _ = self.trigger_tx.send(SaveTrigger::Dirty(name.to_string())).await;
    }

    pub async fn flush(&self, name: &str) {
        let _ = self.trigger_tx.send(SaveTrigger::Flush(name.to_string())).await;
    }
}

impl AutosaveWorker {
    /// Build the worker plus its feed handle and state notification stream.
    pub fn new(
        store: Arc<SnapshotStore>,
        source: Arc<dyn SnapshotSource>,
        debounce: Duration,
        save_timeout: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> (Self, AutosaveHandle, mpsc::Receiver<(String, SaveState)>) {
        let (trigger_tx, trigger_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = mpsc::channel(64);
        let worker = Self {
            store,
            source,
            debounce,
            save_timeout,
            trigger_rx,
            shutdown_rx,
            state_tx,
        };
        (worker, AutosaveHandle { trigger_tx }, state_rx)
    }

    pub fn spawn(self) -> task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        // Snapshots waiting out their debounce window.
        let mut pending: HashMap<String, PendingSave> = HashMap::new();
        // Snapshots with a save in flight; the flag records whether a
        // follow-up save is owed.
        let mut in_flight: HashMap<String, bool> = HashMap::new();
        let (done_tx, mut done_rx) = mpsc::channel::<(String, bool)>(16);

        loop {
            let next_deadline = pending.values().map(|p| p.deadline).min();
            tokio::select! {
                trigger = self.trigger_rx.recv() => {
                    let Some(trigger) = trigger else { break };
                    let (name, flush) = match trigger {
                        SaveTrigger::Dirty(name) => (name, false),
                        SaveTrigger::Flush(name) => (name, true),
                    };
                    if let Some(owed) = in_flight.get_mut(&name) {
                        *owed = true;
                        continue;
                    }
                    self.notify(&name, SaveState::Dirty).await;
                    let deadline = if flush {
                        time::Instant::now()
                    } else {
                        time::Instant::now() + self.debounce
                    };
                    let entry = pending.entry(name).or_insert(PendingSave { deadline });
                    // A flush overrides a pending debounce, never the
                    // other way around.
                    if flush {
                        entry.deadline = deadline;
                    }
                }
                _ = sleep_until_opt(next_deadline), if next_deadline.is_some() => {
                    let now = time::Instant::now();
                    let due: Vec<String> = pending
                        .iter()
                        .filter(|(_, p)| p.deadline <= now)
                        .map(|(name, _)| name.clone())
                        .collect();
                    for name in due {
                        pending.remove(&name);
                        in_flight.insert(name.clone(), false);
                        self.notify(&name, SaveState::Saving).await;
                        self.start_save(name, done_tx.clone());
                    }
                }
                result = done_rx.recv() => {
                    let Some((name, ok)) = result else { break };
                    let owed = in_flight.remove(&name).unwrap_or(false);
                    if ok {
                        self.notify(&name, SaveState::Clean).await;
                    } else {
                        self.notify(&name, SaveState::Failed).await;
                    }
                    // A failed save retries on the next cycle; an owed
                    // follow-up reschedules immediately either way.
                    if owed || !ok {
                        pending.insert(name, PendingSave {
                            deadline: time::Instant::now() + self.debounce,
                        });
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    self.final_flush(pending, in_flight).await;
                    return;
                }
            }
        }
        // Trigger channel closed without shutdown signal; still flush.
        self.final_flush(pending, in_flight).await;
    }

    fn start_save(&self, name: String, done_tx: mpsc::Sender<(String, bool)>) {
        let store = Arc::clone(&self.store);
        let source = Arc::clone(&self.source);
        let save_timeout = self.save_timeout;
        tokio::spawn(async move {
            let ok = run_save(&store, source.as_ref(), &name, save_timeout).await;
            let _ = done_tx.send((name, ok)).await;
        });
    }

    /// Synchronously persist everything still pending or owed. Called
    /// once on shutdown so edits made inside the debounce window are
    /// not lost.
    async fn final_flush(&self, pending: HashMap<String, PendingSave>, in_flight: HashMap<String, bool>) {
        let mut names: Vec<String> = pending.into_keys().collect();
        names.extend(in_flight.into_iter().filter(|(_, owed)| *owed).map(|(n, _)| n));
        names.sort();
        names.dedup();
        for name in names {
            let ok = run_save(&self.store, self.source.as_ref(), &name, self.save_timeout).await;
            if ok {
                self.notify(&name, SaveState::Clean).await;
            } else {
                log::error!("Final flush of {} failed", name);
                self.notify(&name, SaveState::Failed).await;
            }
        }
    }

    async fn notify(&self, name: &str, state: SaveState) {
        let _ = self.state_tx.send((name.to_string(), state)).await;
    }
}

async fn sleep_until_opt(deadline: Option<time::Instant>) {
    match deadline {
        Some(d) => time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Render and persist one snapshot, off the async threads and bounded
/// by the save timeout. Returns whether the save succeeded.
///
/// A timed-out save keeps running on its blocking thread; the store's
/// per-file lock serializes it against the retry, so the two writes
/// cannot interleave.
async fn run_save(
    store: &Arc<SnapshotStore>,
    source: &dyn SnapshotSource,
    name: &str,
    save_timeout: Duration,
) -> bool {
    let content = match source.render(name) {
        Ok(content) => content,
        Err(e) => {
            log::error!("Failed to render snapshot {}: {}", name, e);
            return false;
        }
    };
    let store = Arc::clone(store);
    let owned_name = name.to_string();
    let save = task::spawn_blocking(move || store.save_snapshot(&owned_name, &content));
    match time::timeout(save_timeout, save).await {
        Ok(Ok(Ok(version))) => {
            log::debug!("Autosaved {} at version {}", name, version);
            true
        }
        Ok(Ok(Err(e))) => {
            log::error!("Autosave of {} failed: {}", name, e);
            false
        }
        Ok(Err(e)) => {
            log::error!("Autosave task for {} panicked: {}", name, e);
            false
        }
        Err(_) => {
            log::error!(
                "Autosave of {} exceeded {}",
                name,
                StorageError::Timeout(save_timeout)
            );
            false
        }
    }
}
