//! Real-time WebSocket connection hub.
//!
//! This crate manages many concurrent bidirectional message connections,
//! groups them into named rooms, and broadcasts to a room or to everyone,
//! with thread-safe join/leave and per-connection state.
//!
//! # Features
//!
//! - **Connections** over `tokio-tungstenite` with serialized writes, typed
//!   reads, ping/pong liveness, and one-shot close semantics
//! - **Clients** binding a connection to an identity with arbitrary
//!   key/value session state
//! - **Rooms**: named multicast groups with snapshot-based broadcast, so a
//!   slow member never stalls the rest
//! - **Hub**: the owned registry of all clients and rooms, with lifecycle
//!   hooks and idempotent shutdown
//! - **Router**: optional demultiplexing of `{type, payload, id}` envelopes
//!   to per-type async handlers over a single connection
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use wshub::{Connection, ConnectionConfig, Hub, Router};
//!
//! let hub = Hub::new();
//! let router = Arc::new(Router::new());
//!
//! router.handle("chat", |client, envelope| async move {
//!     let room = client.hub().unwrap().get_room("lobby");
//!     room.broadcast(envelope.to_message()?).await
//! });
//!
//! // For each accepted WebSocket stream:
//! async fn accept(
//!     hub: Hub,
//!     router: Arc<Router>,
//!     stream: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
//!     user_id: String,
//! ) -> wshub::HubResult<()> {
//!     let conn = Connection::new(stream, ConnectionConfig::default());
//!     let client = hub.new_client(conn, user_id)?;
//!     client.join("lobby")?;
//!     tokio::spawn(async move { router.run_client(client).await });
//!     Ok(())
//! }
//! ```
//!
//! # Concurrency model
//!
//! One lightweight task per connection runs the read/route loop; hub and
//! room operations may be called concurrently from any number of those tasks
//! plus external broadcasters. Every registry and membership set has its own
//! lock and every mutation or broadcast follows snapshot-under-lock, release,
//! then act, so critical sections stay short and no slow peer stalls an
//! unrelated broadcast. No path nests hub, room, and client locks.
//!
//! Ordering: nothing is guaranteed across different senders broadcasting
//! concurrently; delivery order to one receiver matches the order writes
//! were issued to that receiver's connection, because each connection
//! serializes its own writes.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod message;
pub mod room;
pub mod router;

// Re-exports for convenience
pub use client::Client;
pub use config::{ConnectionConfig, HubConfig};
pub use connection::{Connection, ConnectionId};
pub use error::{CloseCode, HubError, HubResult};
pub use hub::{Hub, HubStats};
pub use message::{CloseFrame, Message};
pub use router::{Envelope, Router};

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory connections for tests: the sink and stream halves are
    //! unbounded channels standing in for a socket.

    use std::pin::Pin;
    use std::task::{Context, Poll};

    use futures_channel::mpsc;
    use futures_util::{Sink, SinkExt};

    use crate::config::ConnectionConfig;
    use crate::connection::Connection;
    use crate::error::{HubError, HubResult};
    use crate::message::Message;

    /// Frames the connection has written.
    pub(crate) type Outbound = mpsc::UnboundedReceiver<Message>;
    /// Feeds frames into the connection's read side.
    pub(crate) type Inbound = mpsc::UnboundedSender<HubResult<Message>>;

    /// Create a connection backed by channels, with default config.
    pub(crate) fn channel_connection() -> (Connection, Outbound, Inbound) {
        channel_connection_with(ConnectionConfig::default())
    }

    /// Create a connection backed by channels.
    pub(crate) fn channel_connection_with(
        config: ConnectionConfig,
    ) -> (Connection, Outbound, Inbound) {
        let (out_tx, out_rx) = mpsc::unbounded::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded::<HubResult<Message>>();
        let sink = out_tx.sink_map_err(|e| HubError::send_failed(e.to_string()));
        let conn = Connection::from_parts(sink, in_rx, config);
        (conn, out_rx, in_tx)
    }

    /// A sink whose sends never complete, standing in for a peer that has
    /// stopped draining its socket.
    pub(crate) struct StuckSink;

    impl Sink<Message> for StuckSink {
        type Error = HubError;

        fn poll_ready(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), HubError>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _msg: Message) -> Result<(), HubError> {
            Ok(())
        }

        fn poll_flush(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), HubError>> {
            Poll::Pending
        }

        fn poll_close(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), HubError>> {
            Poll::Pending
        }
    }

    /// Create a connection whose writes never complete.
    pub(crate) fn stuck_connection() -> Connection {
        Connection::from_parts(
            StuckSink,
            futures_util::stream::pending::<HubResult<Message>>(),
            ConnectionConfig::default(),
        )
    }
}
