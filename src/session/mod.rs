//! Connected editing sessions: registry, transports, and fan-out
//!
//! Sessions are ephemeral and never persisted; each one is an opaque id
//! plus a live transport handle that dies with the connection.

mod broadcaster;
mod event;
mod transport;

pub use broadcaster::SessionBroadcaster;
pub use event::{SessionEvent, SessionId};
pub use transport::{ChannelTransport, Outbound, SessionTransport, TransportError};
