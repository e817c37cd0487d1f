//! WebSocket session bridge
//!
//! Each connection gets a channel-backed transport registered with the
//! broadcaster; a writer task drains it into the socket sink while this
//! task reads inbound frames. Text frames carry JSON control events,
//! binary frames carry CBOR op envelopes. Any inbound traffic refreshes
//! the session's liveness clock.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use warp::ws::{Message, WebSocket};

use crate::convergent::OpEnvelope;
use crate::session::{ChannelTransport, Outbound, SessionEvent, SessionId, SessionTransport};
use crate::sync::SyncCoordinator;

const OUTBOUND_BUFFER: usize = 64;

pub async fn handle_session(socket: WebSocket, session_id: SessionId, engine: Arc<SyncCoordinator>) {
    let (mut sink, mut stream) = socket.split();
    let (transport, mut outbound_rx) = ChannelTransport::channel(OUTBOUND_BUFFER);
    let transport: Arc<ChannelTransport> = Arc::new(transport);

    engine
        .connect_session(session_id.clone(), Arc::clone(&transport) as Arc<dyn SessionTransport>)
        .await;
    log::info!("Session {} connected", session_id);

    // Catch the new session up with the current tree before any deltas.
    let catch_up = SessionEvent::DocumentChanged {
        document: engine.document().await,
    };
    let _ = transport.send_event(&catch_up).await;
    // The broadcaster now holds the only sender. When the session is
    // unregistered (idle sweep or failed send) the channel closes, the
    // writer drains out, and the socket is closed from this side.
    drop(transport);

    let writer = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            let message = match outbound {
                Outbound::Event(text) => Message::text(text),
                Outbound::Frame(bytes) => Message::binary(bytes),
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::close()).await;
    });

    while let Some(result) = stream.next().await {
        let message = match result {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Session {} socket error: {}", session_id, e);
                break;
            }
        };

        // A session the broadcaster has already dropped gets no further
        // say; close out rather than processing frames from it.
        if !engine.sessions().contains(&session_id).await {
            log::info!("Session {} no longer registered, closing", session_id);
            break;
        }
        engine.sessions().touch(&session_id).await;

        if message.is_close() {
            break;
        } else if message.is_text() {
            if let Ok(text) = message.to_str() {
                handle_control(&engine, &session_id, text).await;
            }
        } else if message.is_binary() {
            handle_frame(&engine, &session_id, message.as_bytes()).await;
        }
        // Ping/pong is answered by warp itself.
    }

    engine.disconnect_session(&session_id).await;
    writer.abort();
    log::info!("Session {} disconnected", session_id);
}

/// Inbound JSON control message. Only presence traffic is accepted from
/// clients; join/left/document events are server-originated and ignored
/// if a client sends them.
async fn handle_control(engine: &Arc<SyncCoordinator>, session_id: &SessionId, text: &str) {
    match serde_json::from_str::<SessionEvent>(text) {
        Ok(SessionEvent::CursorPosition { position, .. }) => {
            engine.relay_cursor(session_id, position).await;
        }
        Ok(other) => {
            log::debug!(
                "Session {} sent server-only event {:?}, ignoring",
                session_id,
                std::mem::discriminant(&other)
            );
        }
        Err(e) => {
            log::warn!("Session {} sent unparseable control message: {}", session_id, e);
        }
    }
}

/// Inbound CBOR op envelope, fed to the merge seam. Malformed frames are
/// logged and dropped; the connection stays up.
async fn handle_frame(engine: &Arc<SyncCoordinator>, session_id: &SessionId, bytes: &[u8]) {
    match ciborium::from_reader::<OpEnvelope, _>(bytes) {
        Ok(envelope) => {
            let applied = engine.apply_remote_frame(envelope).await;
            if !applied {
                log::debug!("Session {} sent an already-known op", session_id);
            }
        }
        Err(e) => {
            log::warn!("Session {} sent malformed op frame: {}", session_id, e);
        }
    }
}
