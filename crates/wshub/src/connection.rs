//! WebSocket connection handling.
//!
//! This module provides the [`Connection`] type: one physical duplex socket
//! with read/write/ping/close primitives and one-shot close semantics. Writes
//! are serialized through an internal lock so concurrent senders never
//! interleave frame bytes; the close transition is guarded and fires the
//! registered close callback exactly once regardless of concurrent callers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::error::{CloseCode, HubError, HubResult};
use crate::message::Message;

/// A unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new random connection ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create a connection ID from a UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

type FrameSink = Box<dyn Sink<Message, Error = HubError> + Send + Unpin>;
type FrameStream = Box<dyn Stream<Item = HubResult<Message>> + Send + Unpin>;
type CloseCallback = Box<dyn FnOnce() + Send>;

/// One duplex message connection.
///
/// The connection moves from open to closed exactly once: via an explicit
/// [`close`](Self::close), a transport error on read, or a peer close frame.
/// All paths converge on the same guarded transition, which fires the
/// registered close callback a single time.
///
/// Reads are pulled by one logical reader (the session loop); writes may come
/// from any number of tasks concurrently and are serialized internally.
pub struct Connection {
    /// The unique connection ID.
    id: ConnectionId,
    /// The write half; the lock serializes whole frames.
    writer: Mutex<FrameSink>,
    /// The read half.
    reader: Mutex<FrameStream>,
    /// Whether the close transition has happened.
    closed: AtomicBool,
    /// Callback fired exactly once on close.
    on_close: parking_lot::Mutex<Option<CloseCallback>>,
    /// Wakes ping callers when the reader observes a pong.
    pong_notify: Notify,
    /// Wakes blocked reads when the connection closes underneath them.
    close_notify: Notify,
    /// Inbound frame size bound; 0 disables.
    read_limit: AtomicUsize,
    /// Configuration for this connection.
    config: ConnectionConfig,
}

impl Connection {
    /// Create a connection from an accepted WebSocket stream.
    pub fn new<S>(stream: WebSocketStream<S>, config: ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = stream.split();
        let sink = sink
            .sink_map_err(HubError::from)
            .with(|msg: Message| {
                futures_util::future::ready(Ok::<_, HubError>(tungstenite::Message::from(msg)))
            });
        let stream = stream.map(|res| res.map(Message::from).map_err(HubError::from));
        Self::from_parts(sink, stream, config)
    }

    /// Create a connection from arbitrary sink/stream halves.
    ///
    /// This is the seam for custom transports and for tests, which drive a
    /// connection with in-memory channels instead of a socket.
    pub fn from_parts<Si, St>(sink: Si, stream: St, config: ConnectionConfig) -> Self
    where
        Si: Sink<Message, Error = HubError> + Send + Unpin + 'static,
        St: Stream<Item = HubResult<Message>> + Send + Unpin + 'static,
    {
        Self {
            id: ConnectionId::new(),
            writer: Mutex::new(Box::new(sink)),
            reader: Mutex::new(Box::new(stream)),
            closed: AtomicBool::new(false),
            on_close: parking_lot::Mutex::new(None),
            pong_notify: Notify::new(),
            close_notify: Notify::new(),
            read_limit: AtomicUsize::new(config.max_message_size),
            config,
        }
    }

    /// Get the connection ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the connection configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Check if the connection has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Bound the size of inbound frames; 0 disables the bound.
    ///
    /// A frame over the limit closes the connection with status 1009.
    pub fn set_read_limit(&self, limit: usize) {
        self.read_limit.store(limit, Ordering::Relaxed);
    }

    /// Register the callback fired when the connection closes.
    ///
    /// If the connection has already closed the callback runs immediately, so
    /// registration can never miss the transition.
    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        if self.is_closed() {
            callback();
            return;
        }
        let mut slot = self.on_close.lock();
        if self.is_closed() {
            drop(slot);
            callback();
        } else {
            *slot = Some(callback);
        }
    }

    /// Receive the next data frame.
    ///
    /// Blocks until a text or binary frame arrives, the connection closes, or
    /// the configured read timeout elapses. Control frames are handled
    /// transparently: pings are answered with pongs, pongs wake
    /// [`ping`](Self::ping) callers, and a peer close frame completes the
    /// close transition and surfaces as [`HubError::Closed`].
    ///
    /// Dropping the returned future cancels the read without consuming a
    /// frame and without closing the connection.
    pub async fn read(&self) -> HubResult<Message> {
        loop {
            match self.next_frame().await? {
                Message::Ping(data) => {
                    debug!(connection_id = %self.id, "received ping, sending pong");
                    if let Err(e) = self.write(Message::pong(data)).await {
                        warn!(connection_id = %self.id, error = %e, "failed to send pong");
                    }
                }
                Message::Pong(_) => {
                    self.pong_notify.notify_waiters();
                }
                Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|f| (f.code, f.reason.into_owned()))
                        .unwrap_or((CloseCode::NoStatus.as_u16(), String::new()));
                    debug!(connection_id = %self.id, code, "received close frame");
                    self.transition_closed();
                    return Err(HubError::closed(code, reason));
                }
                msg => {
                    let limit = self.read_limit.load(Ordering::Relaxed);
                    if limit > 0 && msg.len() > limit {
                        let size = msg.len();
                        let _ = self
                            .close_with_reason(CloseCode::MessageTooBig, "message too big")
                            .await;
                        return Err(HubError::MessageTooBig { size, limit });
                    }
                    return Ok(msg);
                }
            }
        }
    }

    /// Receive the next frame, requiring it to be text.
    ///
    /// A binary frame is consumed and reported as
    /// [`HubError::ExpectedTextMessage`].
    pub async fn read_text(&self) -> HubResult<String> {
        let msg = self.read().await?;
        let kind = msg.kind();
        msg.into_text()
            .ok_or(HubError::ExpectedTextMessage { received: kind })
    }

    /// Receive the next frame, requiring it to be binary.
    ///
    /// A text frame is consumed and reported as
    /// [`HubError::ExpectedBinaryMessage`].
    pub async fn read_binary(&self) -> HubResult<Vec<u8>> {
        let msg = self.read().await?;
        match msg {
            Message::Binary(data) => Ok(data),
            other => Err(HubError::ExpectedBinaryMessage {
                received: other.kind(),
            }),
        }
    }

    /// Send a frame.
    ///
    /// Safe for concurrent callers; the internal write lock guarantees no
    /// byte interleaving between two sends. Fails with
    /// [`HubError::ConnectionClosed`] after the connection has closed.
    pub async fn write(&self, msg: Message) -> HubResult<()> {
        if self.is_closed() {
            return Err(HubError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        writer.send(msg).await
    }

    /// Send a text frame.
    pub async fn write_text(&self, text: impl Into<String>) -> HubResult<()> {
        self.write(Message::text(text)).await
    }

    /// Send a binary frame.
    pub async fn write_binary(&self, data: impl Into<Vec<u8>>) -> HubResult<()> {
        self.write(Message::binary(data)).await
    }

    /// Send a JSON value as a text frame.
    pub async fn write_json<T: serde::Serialize>(&self, value: &T) -> HubResult<()> {
        let msg = Message::from_json(value)?;
        self.write(msg).await
    }

    /// Probe liveness: send a ping and wait for the matching pong.
    ///
    /// The pong is observed by the read path, so something must be reading
    /// the connection for the probe to complete. Fails with
    /// [`HubError::Timeout`] after the configured pong timeout.
    pub async fn ping(&self) -> HubResult<()> {
        let pong = self.pong_notify.notified();
        tokio::pin!(pong);
        pong.as_mut().enable();

        let closed = self.close_notify.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();

        self.write(Message::ping(Vec::new())).await?;

        tokio::select! {
            _ = &mut pong => Ok(()),
            _ = &mut closed => Err(HubError::ConnectionClosed),
            () = tokio::time::sleep(self.config.pong_timeout) => Err(HubError::Timeout),
        }
    }

    /// Close the connection with a normal status.
    ///
    /// Idempotent; see [`close_with_reason`](Self::close_with_reason).
    pub async fn close(&self) -> HubResult<()> {
        self.close_with_reason(CloseCode::Normal, "").await
    }

    /// Close the connection with a status code and reason.
    ///
    /// Idempotent: the first caller sends the close frame and fires the close
    /// callback; later callers are no-ops.
    pub async fn close_with_reason(
        &self,
        code: CloseCode,
        reason: impl Into<String>,
    ) -> HubResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let reason = reason.into();
        {
            // Best effort: the peer may already be gone.
            let mut writer = self.writer.lock().await;
            let _ = writer.send(Message::close(code, reason.clone())).await;
            let _ = writer.close().await;
        }
        if self.transition_closed() {
            debug!(
                connection_id = %self.id,
                code = code.as_u16(),
                reason = %reason,
                "connection closed"
            );
        }
        Ok(())
    }

    /// Pull the next raw frame off the read half.
    async fn next_frame(&self) -> HubResult<Message> {
        if self.is_closed() {
            return Err(HubError::ConnectionClosed);
        }
        let closed = self.close_notify.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        if self.is_closed() {
            return Err(HubError::ConnectionClosed);
        }

        let mut reader = self.reader.lock().await;
        let item = tokio::select! {
            item = reader.next() => item,
            _ = &mut closed => return Err(HubError::ConnectionClosed),
            () = read_deadline(self.config.read_timeout) => return Err(HubError::Timeout),
        };
        drop(reader);

        match item {
            Some(Ok(msg)) => Ok(msg),
            Some(Err(e)) => {
                self.transition_closed();
                Err(e)
            }
            None => {
                self.transition_closed();
                Err(HubError::ConnectionClosed)
            }
        }
    }

    /// Perform the one-shot open-to-closed transition.
    ///
    /// Returns true for the caller that actually performed it. Wakes blocked
    /// reads and pings, then fires the close callback.
    fn transition_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.close_notify.notify_waiters();
        let callback = self.on_close.lock().take();
        if let Some(callback) = callback {
            callback();
        }
        true
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Sleep until the read timeout elapses, or forever when none is set.
async fn read_deadline(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}
