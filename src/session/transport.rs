//! Session transport seam
//!
//! A transport is the live outbound half of one session's connection. The
//! broadcaster only knows this trait; the server glue bridges it to a
//! WebSocket, and tests use the channel-backed implementation directly.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::convergent::OpEnvelope;

use super::event::SessionEvent;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Session channel closed")]
    Closed,

    #[error("Encoding failed: {0}")]
    Encoding(String),
}

/// Outbound payload, already encoded for the wire: control events as JSON
/// text, replication-op frames as CBOR bytes.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Event(String),
    Frame(Vec<u8>),
}

#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn send_event(&self, event: &SessionEvent) -> Result<(), TransportError>;
    async fn send_frame(&self, envelope: &OpEnvelope) -> Result<(), TransportError>;
}

/// Transport over a bounded tokio channel. The receiving side is drained
/// by the connection task (or by a test).
///
/// Sends never wait: a full buffer means the peer has stopped draining,
/// and a stalled session must not hold up the broadcast loop, so it is
/// reported as closed and swept by the broadcaster.
pub struct ChannelTransport {
    tx: mpsc::Sender<Outbound>,
}

impl ChannelTransport {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    fn push(&self, outbound: Outbound) -> Result<(), TransportError> {
        self.tx.try_send(outbound).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl SessionTransport for ChannelTransport {
    async fn send_event(&self, event: &SessionEvent) -> Result<(), TransportError> {
        let json = serde_json::to_string(event).map_err(|e| TransportError::Encoding(e.to_string()))?;
        self.push(Outbound::Event(json))
    }

    async fn send_frame(&self, envelope: &OpEnvelope) -> Result<(), TransportError> {
        let mut buf = Vec::new();
        ciborium::into_writer(envelope, &mut buf)
            .map_err(|e| TransportError::Encoding(e.to_string()))?;
        self.push(Outbound::Frame(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport_delivers() {
        let (transport, mut rx) = ChannelTransport::channel(4);
        transport
            .send_event(&SessionEvent::Joined {
                session_id: "s1".into(),
                session_count: 1,
            })
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            Outbound::Event(json) => assert!(json.contains("\"joined\"")),
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_channel_reports_error() {
        let (transport, rx) = ChannelTransport::channel(1);
        drop(rx);
        let err = transport
            .send_event(&SessionEvent::Left {
                session_id: "s1".into(),
                session_count: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
