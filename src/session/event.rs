//! Control and presence events on the real-time channel
//!
//! These travel as tagged JSON text messages; replication-op frames travel
//! separately as CBOR binary frames.

use serde::{Deserialize, Serialize};

use crate::model::Document;

/// Opaque identifier of one connected editing session.
pub type SessionId = String;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A session connected; `session_count` is the new total.
    Joined {
        session_id: SessionId,
        session_count: usize,
    },

    /// A session disconnected; `session_count` is the updated total.
    Left {
        session_id: SessionId,
        session_count: usize,
    },

    /// Presence: a session's pointer moved. Relayed to everyone except the
    /// originating session.
    CursorPosition {
        session_id: SessionId,
        position: serde_json::Value,
    },

    /// The shared document changed; carries the new snapshot.
    DocumentChanged { document: Document },
}
