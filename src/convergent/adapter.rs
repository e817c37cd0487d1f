//! The replication seam
//!
//! Wraps the replica behind the contract the rest of the engine programs
//! against: apply a local op, ingest a remote op, and observe every
//! committed op through one change hook that distinguishes local from
//! remote origin. The origin controls re-broadcast: a remote op is relayed
//! to local sessions, a local op is never echoed back to its originator.

use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::model::Document;

use super::horizon::Horizon;
use super::operation::{OpEnvelope, Operation};
use super::replica::TopicTreeReplica;

/// Where a committed op came from, as seen by this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOrigin {
    Local,
    Remote,
}

/// A committed op delivered through the change hook.
#[derive(Clone, Debug)]
pub struct CommittedOp {
    pub origin: CommitOrigin,
    pub envelope: OpEnvelope,
}

/// Thin adapter over the replica: one normalized path for every mutation.
pub struct ReplicationAdapter {
    replica: RwLock<TopicTreeReplica>,
    commits: broadcast::Sender<CommittedOp>,
}

impl ReplicationAdapter {
    pub fn new(replica: TopicTreeReplica) -> Arc<Self> {
        let (commits, _) = broadcast::channel(256);
        Arc::new(Self {
            replica: RwLock::new(replica),
            commits,
        })
    }

    /// Commit a locally-originated op and fire the change hook.
    pub async fn apply_local(&self, op: Operation) -> OpEnvelope {
        let envelope = self.replica.write().await.apply_local(op);
        let _ = self.commits.send(CommittedOp {
            origin: CommitOrigin::Local,
            envelope: envelope.clone(),
        });
        envelope
    }

    /// Ingest an op committed by another replica. Returns false (and fires
    /// no hook) if it was already known.
    pub async fn apply_remote(&self, envelope: OpEnvelope) -> bool {
        let fresh = self.replica.write().await.apply_remote(envelope.clone());
        if fresh {
            let _ = self.commits.send(CommittedOp {
                origin: CommitOrigin::Remote,
                envelope,
            });
        }
        fresh
    }

    /// Subscribe to the change-notification hook.
    pub fn subscribe(&self) -> broadcast::Receiver<CommittedOp> {
        self.commits.subscribe()
    }

    /// Materialized snapshot of the current document.
    pub async fn snapshot(&self) -> Document {
        self.replica.read().await.materialize()
    }

    pub async fn horizon(&self) -> Horizon {
        self.replica.read().await.horizon().clone()
    }

    /// Ops a peer's horizon has not seen, for catching up a new session.
    pub async fn operations_since(&self, since: &Horizon) -> Vec<OpEnvelope> {
        self.replica.read().await.operations_since(since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hook_fires_with_origin() {
        let adapter = ReplicationAdapter::new(TopicTreeReplica::new("A"));
        let mut rx = adapter.subscribe();

        adapter
            .apply_local(Operation::AddApplication {
                name: "V".into(),
                description: String::new(),
            })
            .await;
        let commit = rx.recv().await.unwrap();
        assert_eq!(commit.origin, CommitOrigin::Local);

        let remote = TopicTreeReplica::new("B").apply_local(Operation::AddApplication {
            name: "W".into(),
            description: String::new(),
        });
        assert!(adapter.apply_remote(remote).await);
        let commit = rx.recv().await.unwrap();
        assert_eq!(commit.origin, CommitOrigin::Remote);
    }

    #[tokio::test]
    async fn test_duplicate_remote_fires_no_hook() {
        let adapter = ReplicationAdapter::new(TopicTreeReplica::new("A"));
        let mut rx = adapter.subscribe();

        let env = TopicTreeReplica::new("B").apply_local(Operation::AddApplication {
            name: "V".into(),
            description: String::new(),
        });
        assert!(adapter.apply_remote(env.clone()).await);
        assert!(!adapter.apply_remote(env).await);

        let _ = rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
