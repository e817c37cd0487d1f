//! The engine core: one object tying replication, sessions, and storage
//! together
//!
//! All mutation paths converge here. A local edit (from the REST surface
//! or a session) is pre-checked against the current tree, committed as an
//! operation, broadcast to the other sessions, validated, and scheduled
//! for a debounced save. A remote op frame takes the same path minus the
//! pre-check, since the merge seam resolves conflicts instead.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::task;
use tokio::time;

use crate::config::EngineConfig;
use crate::convergent::{
    seed_from_document, CommitOrigin, OpEnvelope, Operation, ReplicationAdapter, TopicField,
    TopicTreeReplica,
};
use crate::error::EngineError;
use crate::model::{from_xml, to_xml, validate, Direction, Document, ModelError, Violation};
use crate::session::{SessionBroadcaster, SessionEvent, SessionId, SessionTransport};
use crate::storage::{SnapshotStore, StorageError};
use crate::sync::autosave::{AutosaveHandle, AutosaveWorker, SaveState, SnapshotSource};

/// A requested edit of the shared tree, before it becomes an operation.
#[derive(Clone, Debug)]
pub enum Mutation {
    AddApplication {
        name: String,
        description: String,
    },
    RemoveApplication {
        name: String,
    },
    SetApplicationDescription {
        name: String,
        value: String,
    },
    AddTopic {
        app: String,
        name: String,
        proto: String,
        direction: Direction,
        description: String,
    },
    RemoveTopic {
        app: String,
        name: String,
    },
    SetTopicField {
        app: String,
        name: String,
        field: TopicField,
        value: String,
    },
}

/// Result of a committed mutation. Validation findings are advisory and
/// never roll the edit back.
#[derive(Clone, Debug)]
pub struct MutationOutcome {
    pub document: Document,
    pub warnings: Vec<Violation>,
}

/// Observable engine health, surfaced on the status endpoint.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct EngineStatus {
    pub last_save_error: Option<String>,
    pub last_validation: Vec<Violation>,
    pub save_state: Option<SaveState>,
}

/// Latest rendered snapshot, refreshed on every commit so the autosave
/// worker persists current state without touching the replica lock.
struct RenderedSnapshot {
    xml: Mutex<String>,
}

impl SnapshotSource for RenderedSnapshot {
    fn render(&self, _name: &str) -> Result<String, StorageError> {
        match self.xml.lock() {
            Ok(xml) => Ok(xml.clone()),
            Err(poisoned) => Ok(poisoned.into_inner().clone()),
        }
    }
}

pub struct SyncCoordinator {
    adapter: Arc<ReplicationAdapter>,
    sessions: Arc<SessionBroadcaster>,
    store: Arc<SnapshotStore>,
    autosave: AutosaveHandle,
    rendered: Arc<RenderedSnapshot>,
    status: RwLock<EngineStatus>,
    snapshot_name: String,
    save_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
    autosave_task: tokio::sync::Mutex<Option<task::JoinHandle<()>>>,
}

impl SyncCoordinator {
    /// Bring the engine up: open storage, load or initialize the snapshot,
    /// seed the replica, and start the background workers.
    pub async fn start(config: &EngineConfig) -> Result<Arc<Self>, EngineError> {
        let store = Arc::new(SnapshotStore::open(
            &config.data_dir,
            config.auto_backup,
            config.max_backups,
        )?);

        let initial = match store.load_snapshot(&config.snapshot_name) {
            Ok(xml) => {
                let doc = from_xml(&xml)?;
                log::info!(
                    "Loaded snapshot {} ({} applications)",
                    config.snapshot_name,
                    doc.applications.len()
                );
                doc
            }
            Err(StorageError::SnapshotMissing(_)) => {
                log::info!("No snapshot {}, starting empty", config.snapshot_name);
                Document::new()
            }
            Err(e) => return Err(e.into()),
        };

        let mut replica = TopicTreeReplica::new(format!("engine-{}", uuid::Uuid::new_v4()));
        seed_from_document(&mut replica, &initial);
        let adapter = ReplicationAdapter::new(replica);

        let rendered = Arc::new(RenderedSnapshot {
            xml: Mutex::new(to_xml(&initial)),
        });

        let (shutdown_tx, _) = broadcast::channel(1);
        let (worker, autosave, state_rx) = AutosaveWorker::new(
            Arc::clone(&store),
            Arc::clone(&rendered) as Arc<dyn SnapshotSource>,
            config.debounce(),
            config.save_timeout(),
            shutdown_tx.subscribe(),
        );
        let autosave_task = worker.spawn();

        let coordinator = Arc::new(Self {
            adapter,
            sessions: SessionBroadcaster::new(),
            store,
            autosave,
            rendered,
            status: RwLock::new(EngineStatus::default()),
            snapshot_name: config.snapshot_name.clone(),
            save_timeout: config.save_timeout(),
            shutdown_tx,
            autosave_task: tokio::sync::Mutex::new(Some(autosave_task)),
        });

        coordinator.spawn_save_state_task(state_rx);
        coordinator.spawn_remote_relay_task();
        coordinator.spawn_idle_sweep_task(config.session_idle_timeout());

        Ok(coordinator)
    }

    pub fn sessions(&self) -> &Arc<SessionBroadcaster> {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn snapshot_name(&self) -> &str {
        &self.snapshot_name
    }

    pub async fn document(&self) -> Document {
        self.adapter.snapshot().await
    }

    pub async fn status(&self) -> EngineStatus {
        self.status.read().await.clone()
    }

    /// Commit a local edit. Structural conflicts (duplicate names, missing
    /// parents) are rejected before any operation is created; validation
    /// findings are returned but never block the commit.
    pub async fn apply_mutation(
        &self,
        origin: Option<&SessionId>,
        mutation: Mutation,
    ) -> Result<MutationOutcome, EngineError> {
        let current = self.adapter.snapshot().await;
        let op = translate(&current, mutation)?;

        let envelope = self.adapter.apply_local(op).await;
        let document = self.after_commit().await;
        let warnings = self.status.read().await.last_validation.clone();

        self.sessions.broadcast_frame(&envelope, origin).await;
        self.sessions
            .broadcast(
                SessionEvent::DocumentChanged {
                    document: document.clone(),
                },
                origin,
            )
            .await;

        Ok(MutationOutcome { document, warnings })
    }

    /// Ingest a replication frame from a session. Duplicate frames are
    /// dropped silently; the follow-up fan-out happens on the relay task.
    pub async fn apply_remote_frame(&self, envelope: OpEnvelope) -> bool {
        self.adapter.apply_remote(envelope).await
    }

    /// Re-render, validate, and schedule a save. Runs after every commit,
    /// local or remote.
    async fn after_commit(&self) -> Document {
        let document = self.adapter.snapshot().await;
        let xml = to_xml(&document);
        match self.rendered.xml.lock() {
            Ok(mut slot) => *slot = xml,
            Err(poisoned) => *poisoned.into_inner() = xml,
        }

        let findings = validate(&document);
        for violation in &findings {
            log::warn!("{}: {} ({:?})", violation.path, violation.message, violation.severity);
        }
        self.status.write().await.last_validation = findings;

        self.autosave.mark_dirty(&self.snapshot_name).await;
        document
    }

    /// Persist immediately, bypassing the debounce window. Returns the new
    /// snapshot version.
    pub async fn save_now(&self) -> Result<u64, EngineError> {
        let document = self.adapter.snapshot().await;
        let xml = to_xml(&document);
        let store = Arc::clone(&self.store);
        let name = self.snapshot_name.clone();
        let save = task::spawn_blocking(move || store.save_snapshot(&name, &xml));
        match time::timeout(self.save_timeout, save).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(e)) => Err(EngineError::TaskFailed(e.to_string())),
            Err(_) => Err(StorageError::Timeout(self.save_timeout).into()),
        }
    }

    /// Restore a backup over the primary snapshot and reload the shared
    /// tree from it. All sessions receive the restored document.
    pub async fn restore_backup(&self, backup_name: &str) -> Result<Document, EngineError> {
        let store = Arc::clone(&self.store);
        let backup = backup_name.to_string();
        let target = self.snapshot_name.clone();
        // Reload from the backup file itself, which is immutable, rather
        // than reading the primary back: an autosave landing right after
        // the restore could otherwise change what gets reloaded.
        let restore = task::spawn_blocking(move || {
            store.restore_backup(&backup, &target)?;
            store.load_backup(&backup)
        });
        let xml = match time::timeout(self.save_timeout, restore).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => return Err(EngineError::TaskFailed(e.to_string())),
            Err(_) => return Err(StorageError::Timeout(self.save_timeout).into()),
        };
        let restored = from_xml(&xml)?;

        // Restored content enters the tree as fresh local operations so
        // every connected session converges onto it.
        let current = self.adapter.snapshot().await;
        for app in &current.applications {
            self.adapter
                .apply_local(Operation::RemoveApplication {
                    name: app.name.clone(),
                })
                .await;
        }
        for app in &restored.applications {
            self.adapter
                .apply_local(Operation::AddApplication {
                    name: app.name.clone(),
                    description: app.description.clone(),
                })
                .await;
            for topic in &app.topics {
                self.adapter
                    .apply_local(Operation::AddTopic {
                        app: app.name.clone(),
                        name: topic.name.clone(),
                        proto: topic.proto.clone(),
                        direction: topic.direction,
                        description: topic.description.clone(),
                    })
                    .await;
            }
        }

        let document = self.after_commit().await;
        self.sessions
            .broadcast(
                SessionEvent::DocumentChanged {
                    document: document.clone(),
                },
                None,
            )
            .await;
        Ok(document)
    }

    /// Attach a session: register its transport and announce presence.
    pub async fn connect_session(&self, id: SessionId, transport: Arc<dyn SessionTransport>) {
        self.sessions.register(id, transport).await;
    }

    pub async fn disconnect_session(&self, id: &SessionId) {
        self.sessions.unregister(id).await;
    }

    /// Relay a presence event from one session to the rest.
    pub async fn relay_cursor(&self, origin: &SessionId, position: serde_json::Value) {
        self.sessions.touch(origin).await;
        self.sessions
            .broadcast(
                SessionEvent::CursorPosition {
                    session_id: origin.clone(),
                    position,
                },
                Some(origin),
            )
            .await;
    }

    /// Drain the autosave worker and stop the background tasks. The final
    /// flush persists any edits still inside the debounce window.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        // Join the worker so its final flush completes before the caller
        // proceeds to exit.
        let handle = self.autosave_task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("Autosave worker ended abnormally: {}", e);
            }
        }
    }

    fn spawn_save_state_task(
        self: &Arc<Self>,
        mut state_rx: tokio::sync::mpsc::Receiver<(String, SaveState)>,
    ) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((name, state)) = state_rx.recv().await {
                let mut status = coordinator.status.write().await;
                status.save_state = Some(state);
                match state {
                    SaveState::Failed => {
                        status.last_save_error = Some(format!("autosave of {} failed", name));
                    }
                    SaveState::Clean => {
                        status.last_save_error = None;
                    }
                    _ => {}
                }
            }
        });
    }

    /// React to remote commits: re-render, validate, schedule a save, and
    /// fan the change out. Remote frames carry no session identity at this
    /// layer, so the fan-out goes to every session; the originator already
    /// holds the op and applies the echo idempotently.
    fn spawn_remote_relay_task(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let mut commits = self.adapter.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = commits.recv() => {
                        match result {
                            Ok(commit) if commit.origin == CommitOrigin::Remote => {
                                let document = coordinator.after_commit().await;
                                coordinator
                                    .sessions
                                    .broadcast_frame(&commit.envelope, None)
                                    .await;
                                coordinator
                                    .sessions
                                    .broadcast(SessionEvent::DocumentChanged { document }, None)
                                    .await;
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Relay task lagged by {} commits", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    fn spawn_idle_sweep_task(self: &Arc<Self>, idle: Duration) {
        let coordinator = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        // Check a few times per window so sweeps land near the deadline.
        let period = (idle / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        coordinator.sessions.sweep_idle(idle).await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }
}

/// Turn a mutation request into an operation, enforcing the structural
/// rules against the current tree.
fn translate(current: &Document, mutation: Mutation) -> Result<Operation, ModelError> {
    match mutation {
        Mutation::AddApplication { name, description } => {
            if current.application(&name).is_some() {
                return Err(ModelError::DuplicateApplication(name));
            }
            Ok(Operation::AddApplication { name, description })
        }
        Mutation::RemoveApplication { name } => {
            if current.application(&name).is_none() {
                return Err(ModelError::ApplicationNotFound(name));
            }
            Ok(Operation::RemoveApplication { name })
        }
        Mutation::SetApplicationDescription { name, value } => {
            if current.application(&name).is_none() {
                return Err(ModelError::ApplicationNotFound(name));
            }
            Ok(Operation::SetApplicationDescription { name, value })
        }
        Mutation::AddTopic {
            app,
            name,
            proto,
            direction,
            description,
        } => {
            let Some(existing) = current.application(&app) else {
                return Err(ModelError::ApplicationNotFound(app));
            };
            if existing.topic(&name).is_some() {
                return Err(ModelError::DuplicateTopic { app, topic: name });
            }
            Ok(Operation::AddTopic {
                app,
                name,
                proto,
                direction,
                description,
            })
        }
        Mutation::RemoveTopic { app, name } => {
            let Some(existing) = current.application(&app) else {
                return Err(ModelError::ApplicationNotFound(app));
            };
            if existing.topic(&name).is_none() {
                return Err(ModelError::TopicNotFound { app, topic: name });
            }
            Ok(Operation::RemoveTopic { app, name })
        }
        Mutation::SetTopicField {
            app,
            name,
            field,
            value,
        } => {
            let Some(existing) = current.application(&app) else {
                return Err(ModelError::ApplicationNotFound(app));
            };
            if existing.topic(&name).is_none() {
                return Err(ModelError::TopicNotFound { app, topic: name });
            }
            Ok(Operation::SetTopicField {
                app,
                name,
                field,
                value,
            })
        }
    }
}
