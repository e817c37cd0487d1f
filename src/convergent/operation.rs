//! The primitive operations on the shared topic tree
//!
//! Every mutation of the document model is expressed as one of these ops,
//! so local and remote edits flow through a single normalized path.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::Direction;

use super::horizon::{Horizon, ReplicaId, SeqNum};

/// Unique identifier for an operation.
pub type OpId = Uuid;

/// Latest-wins scalar fields of a topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicField {
    Proto,
    Description,
}

/// An atomic edit of the shared Applications/Topics tree.
///
/// Applications and topics are identified by name; concurrent adds of the
/// same name converge onto one item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    AddApplication {
        name: String,
        description: String,
    },

    /// Informed remove: only discards state the remover's horizon had seen,
    /// including the application's own topics.
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

    /// Informed remove scoped to one application.
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

impl Operation {
    /// Name of the application this op affects.
    pub fn app_name(&self) -> &str {
        match self {
            Operation::AddApplication { name, .. } => name,
            Operation::RemoveApplication { name } => name,
            Operation::SetApplicationDescription { name, .. } => name,
            Operation::AddTopic { app, .. } => app,
            Operation::RemoveTopic { app, .. } => app,
            Operation::SetTopicField { app, .. } => app,
        }
    }

    /// Name of the topic this op affects, if it targets one.
    pub fn topic_name(&self) -> Option<&str> {
        match self {
            Operation::AddTopic { name, .. } => Some(name),
            Operation::RemoveTopic { name, .. } => Some(name),
            Operation::SetTopicField { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// An operation wrapped with authorship metadata for transmission, storage
/// and conflict resolution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpEnvelope {
    /// Unique ID for this operation.
    pub id: OpId,

    /// Which replica authored this operation.
    pub author: ReplicaId,

    /// Sequence number within the author's stream.
    pub seq: SeqNum,

    /// Wall-clock milliseconds, for latest-wins tiebreaking.
    pub timestamp_ms: u64,

    /// What the author had seen when it created this operation.
    pub horizon: Horizon,

    pub op: Operation,
}

impl OpEnvelope {
    pub fn new(author: ReplicaId, seq: SeqNum, horizon: Horizon, op: Operation) -> Self {
        Self {
            id: Uuid::new_v4(),
            author,
            seq,
            timestamp_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
            horizon,
            op,
        }
    }

    /// Whether this operation's author had seen another operation.
    pub fn had_seen(&self, other: &OpEnvelope) -> bool {
        self.horizon.has_seen(&other.author, other.seq)
    }

    /// Deterministic ordering key for latest-wins resolution and creation
    /// order: timestamp, then author, then sequence number.
    pub fn order_key(&self) -> (u64, &ReplicaId, SeqNum) {
        (self.timestamp_ms, &self.author, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_targets() {
        let op = Operation::AddTopic {
            app: "VideoViewer".into(),
            name: "PTZ_CONTROL".into(),
            proto: "ptz_ctl.proto".into(),
            direction: Direction::Publish,
            description: String::new(),
        };
        assert_eq!(op.app_name(), "VideoViewer");
        assert_eq!(op.topic_name(), Some("PTZ_CONTROL"));

        let op = Operation::RemoveApplication { name: "VideoViewer".into() };
        assert_eq!(op.topic_name(), None);
    }

    #[test]
    fn test_envelope_had_seen() {
        let mut h = Horizon::new();
        h.observe(&"A".into(), 5);

        let later = OpEnvelope::new(
            "B".into(),
            1,
            h,
            Operation::RemoveApplication { name: "x".into() },
        );
        let earlier = OpEnvelope::new(
            "A".into(),
            3,
            Horizon::new(),
            Operation::AddApplication { name: "x".into(), description: String::new() },
        );

        assert!(later.had_seen(&earlier));
        assert!(!earlier.had_seen(&later));
    }

    #[test]
    fn test_envelope_cbor_round_trip() {
        let env = OpEnvelope::new(
            "A".into(),
            1,
            Horizon::new(),
            Operation::SetTopicField {
                app: "V".into(),
                name: "T".into(),
                field: TopicField::Proto,
                value: "new.proto".into(),
            },
        );
        let mut buf = Vec::new();
        ciborium::into_writer(&env, &mut buf).unwrap();
        let restored: OpEnvelope = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(env, restored);
    }
}
