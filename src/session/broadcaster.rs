//! Session registry and fan-out
//!
//! Tracks connected sessions and delivers change notifications and
//! presence events. A failed send is treated as an implicit disconnect of
//! that session: it is unregistered (announcing `left` to the survivors)
//! and the broadcast loop carries on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::convergent::OpEnvelope;

use super::event::{SessionEvent, SessionId};
use super::transport::SessionTransport;

struct SessionEntry {
    transport: Arc<dyn SessionTransport>,
    last_seen: DateTime<Utc>,
}

/// What a broadcast delivers: a control event or a replication-op frame.
enum Payload<'a> {
    Event(&'a SessionEvent),
    Frame(&'a OpEnvelope),
}

#[derive(Default)]
pub struct SessionBroadcaster {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
}

impl SessionBroadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Add a session, then announce `joined` (with the new total) to every
    /// other session.
    pub async fn register(&self, id: SessionId, transport: Arc<dyn SessionTransport>) {
        let count = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(
                id.clone(),
                SessionEntry {
                    transport,
                    last_seen: Utc::now(),
                },
            );
            sessions.len()
        };
        log::info!("Session {} connected ({} total)", id, count);
        self.broadcast(
            SessionEvent::Joined {
                session_id: id.clone(),
                session_count: count,
            },
            Some(&id),
        )
        .await;
    }

    /// Remove a session and announce `left` with the updated total.
    /// Idempotent: unknown ids are a no-op.
    pub async fn unregister(&self, id: &SessionId) {
        let removed = self.sessions.write().await.remove(id).is_some();
        if !removed {
            return;
        }
        let count = self.session_count().await;
        log::info!("Session {} disconnected ({} total)", id, count);
        self.broadcast(
            SessionEvent::Left {
                session_id: id.clone(),
                session_count: count,
            },
            None,
        )
        .await;
    }

    /// Record traffic from a session, for liveness tracking.
    pub async fn touch(&self, id: &SessionId) {
        if let Some(entry) = self.sessions.write().await.get_mut(id) {
            entry.last_seen = Utc::now();
        }
    }

    /// Send an event to every registered session except `exclude`.
    pub async fn broadcast(&self, event: SessionEvent, exclude: Option<&SessionId>) {
        self.fan_out(Payload::Event(&event), exclude).await;
    }

    /// Send a replication-op frame to every registered session except
    /// `exclude`.
    pub async fn broadcast_frame(&self, envelope: &OpEnvelope, exclude: Option<&SessionId>) {
        self.fan_out(Payload::Frame(envelope), exclude).await;
    }

    async fn fan_out(&self, payload: Payload<'_>, exclude: Option<&SessionId>) {
        let failed = self.deliver(&payload, exclude).await;

        // Failed sessions are gone: drop them, then announce each `left`.
        // The announcements themselves may expose more dead sessions, so
        // keep draining until a round delivers cleanly.
        let mut pending: Vec<SessionId> = failed;
        while !pending.is_empty() {
            let mut next = Vec::new();
            for id in pending {
                if self.sessions.write().await.remove(&id).is_none() {
                    continue;
                }
                log::warn!("Session {} send failed, treating as disconnect", id);
                let count = self.session_count().await;
                let left = SessionEvent::Left {
                    session_id: id,
                    session_count: count,
                };
                next.extend(self.deliver(&Payload::Event(&left), None).await);
            }
            pending = next;
        }
    }

    /// One delivery round. Returns the ids whose sends failed; never
    /// aborts the loop early.
    async fn deliver(&self, payload: &Payload<'_>, exclude: Option<&SessionId>) -> Vec<SessionId> {
        let targets: Vec<(SessionId, Arc<dyn SessionTransport>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(id, _)| Some(*id) != exclude)
                .map(|(id, entry)| (id.clone(), Arc::clone(&entry.transport)))
                .collect()
        };

        let mut failed = Vec::new();
        for (id, transport) in targets {
            let result = match payload {
                Payload::Event(event) => transport.send_event(event).await,
                Payload::Frame(envelope) => transport.send_frame(envelope).await,
            };
            if let Err(e) = result {
                log::debug!("Send to session {} failed: {}", id, e);
                failed.push(id);
            }
        }
        failed
    }

    /// Unregister sessions with no traffic within the liveness window.
    /// Returns the swept ids.
    pub async fn sweep_idle(&self, idle: Duration) -> Vec<SessionId> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(idle).unwrap_or_else(|_| chrono::Duration::seconds(300));
        let stale: Vec<SessionId> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, entry)| entry.last_seen < cutoff)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &stale {
            log::info!("Session {} idle past liveness window, unregistering", id);
            self.unregister(id).await;
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::transport::{ChannelTransport, Outbound};
    use tokio::sync::mpsc;

    async fn connect(
        broadcaster: &SessionBroadcaster,
        id: &str,
    ) -> mpsc::Receiver<Outbound> {
        let (transport, rx) = ChannelTransport::channel(16);
        broadcaster
            .register(id.to_string(), Arc::new(transport))
            .await;
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn test_join_announced_to_others_only() {
        let broadcaster = SessionBroadcaster::new();
        let mut rx_a = connect(&broadcaster, "A").await;
        let mut rx_b = connect(&broadcaster, "B").await;

        // A heard about B joining; B heard nothing (its own join excluded).
        let a_events = drain(&mut rx_a);
        assert_eq!(a_events.len(), 1);
        match &a_events[0] {
            Outbound::Event(json) => {
                assert!(json.contains("\"joined\""));
                assert!(json.contains("\"session_count\":2"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_origin() {
        let broadcaster = SessionBroadcaster::new();
        let mut rx_a = connect(&broadcaster, "A").await;
        let mut rx_b = connect(&broadcaster, "B").await;
        let mut rx_c = connect(&broadcaster, "C").await;
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        let origin = "B".to_string();
        broadcaster
            .broadcast(
                SessionEvent::CursorPosition {
                    session_id: origin.clone(),
                    position: serde_json::json!({"x": 1}),
                },
                Some(&origin),
            )
            .await;

        assert_eq!(drain(&mut rx_a).len(), 1);
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(drain(&mut rx_c).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_unregisters_without_aborting() {
        let broadcaster = SessionBroadcaster::new();
        let mut rx_a = connect(&broadcaster, "A").await;
        let rx_b = connect(&broadcaster, "B").await;
        let mut rx_c = connect(&broadcaster, "C").await;
        drain(&mut rx_a);
        drain(&mut rx_c);

        // B dies only after everyone is registered, so the first failed
        // send happens during the cursor broadcast below rather than
        // during C's join announcement.
        drop(rx_b);

        broadcaster
            .broadcast(
                SessionEvent::CursorPosition {
                    session_id: "A".into(),
                    position: serde_json::json!(null),
                },
                Some(&"A".to_string()),
            )
            .await;

        assert!(!broadcaster.contains(&"B".to_string()).await);
        assert_eq!(broadcaster.session_count().await, 2);

        // C got the cursor event and then B's implicit `left`.
        let c_events = drain(&mut rx_c);
        assert_eq!(c_events.len(), 2);
        match &c_events[1] {
            Outbound::Event(json) => assert!(json.contains("\"left\"")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unregister_closes_outbound_channel() {
        let broadcaster = SessionBroadcaster::new();
        let mut rx_a = connect(&broadcaster, "A").await;

        // The registry holds the only sender, so removing the session
        // ends the receiver. Connection tasks rely on this to learn
        // they have been swept.
        broadcaster.unregister(&"A".to_string()).await;
        assert!(rx_a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let broadcaster = SessionBroadcaster::new();
        let mut rx_a = connect(&broadcaster, "A").await;
        broadcaster.unregister(&"ghost".to_string()).await;
        assert!(drain(&mut rx_a).is_empty());

        broadcaster.unregister(&"A".to_string()).await;
        broadcaster.unregister(&"A".to_string()).await;
        assert_eq!(broadcaster.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_idle_unregisters_stale() {
        let broadcaster = SessionBroadcaster::new();
        let _rx_a = connect(&broadcaster, "A").await;
        let _rx_b = connect(&broadcaster, "B").await;

        // Zero-width liveness window: everything is stale.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let swept = broadcaster.sweep_idle(Duration::from_millis(1)).await;
        assert_eq!(swept.len(), 2);
        assert_eq!(broadcaster.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_touch_keeps_session_alive() {
        let broadcaster = SessionBroadcaster::new();
        let _rx_a = connect(&broadcaster, "A").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        broadcaster.touch(&"A".to_string()).await;

        let swept = broadcaster.sweep_idle(Duration::from_millis(5)).await;
        assert!(swept.is_empty());
        assert_eq!(broadcaster.session_count().await, 1);
    }
}
