//! Hub-bound clients.
//!
//! A [`Client`] binds one [`Connection`](crate::Connection) to an identity,
//! carries arbitrary per-connection key/value state, and tracks the set of
//! rooms it has joined. Clients are created only through
//! [`Hub::new_client`](crate::Hub::new_client) and live until their
//! connection closes or the hub shuts down.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::Value;

use crate::connection::Connection;
use crate::error::{HubError, HubResult};
use crate::hub::{Hub, HubInner};
use crate::message::Message;

/// A hub-bound identity wrapping one connection plus session state.
///
/// The back-reference to the hub is non-owning; a client outliving its hub
/// can still send on its connection but can no longer touch rooms.
///
/// Lock discipline: the room-name set here and each room's member set are
/// updated one at a time, never while holding the other. That keeps join and
/// leave free of lock-order cycles with broadcasts, at the cost of a brief
/// window where the two sides of an in-flight join or leave disagree.
pub struct Client {
    /// The client identity.
    id: String,
    /// The underlying connection.
    conn: Connection,
    /// Non-owning back-reference to the owning hub.
    hub: Weak<HubInner>,
    /// Arbitrary per-connection key/value state.
    data: RwLock<HashMap<String, Value>>,
    /// Names of the rooms this client has joined.
    rooms: RwLock<HashSet<String>>,
}

impl Client {
    pub(crate) fn new(id: String, conn: Connection, hub: Weak<HubInner>) -> Self {
        Self {
            id,
            conn,
            hub,
            data: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashSet::new()),
        }
    }

    /// Get the client identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Get a handle to the owning hub, if it is still alive.
    pub fn hub(&self) -> Option<Hub> {
        self.hub.upgrade().map(Hub::from_inner)
    }

    /// Check if the underlying connection has closed.
    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Store a value in the per-connection state.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.write().insert(key.into(), value.into());
    }

    /// Fetch a value from the per-connection state.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    /// Fetch a string value from the per-connection state.
    ///
    /// Returns `None` if the key is absent or the value is not a string.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.data.read().get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    /// Send a frame on this client's connection.
    pub async fn send(&self, msg: Message) -> HubResult<()> {
        self.conn.write(msg).await
    }

    /// Send a text frame.
    pub async fn send_text(&self, text: impl Into<String>) -> HubResult<()> {
        self.conn.write_text(text).await
    }

    /// Send a binary frame.
    pub async fn send_binary(&self, data: impl Into<Vec<u8>>) -> HubResult<()> {
        self.conn.write_binary(data).await
    }

    /// Send a JSON value as a text frame.
    pub async fn send_json<T: serde::Serialize>(&self, value: &T) -> HubResult<()> {
        self.conn.write_json(value).await
    }

    /// Join a room, creating it if it does not exist yet.
    ///
    /// Fails with [`HubError::ConnectionClosed`] once the connection has
    /// closed; a removed client can never re-enter a room.
    pub fn join(self: &Arc<Self>, room: &str) -> HubResult<()> {
        if self.is_closed() {
            return Err(HubError::ConnectionClosed);
        }
        let hub = self.hub.upgrade().ok_or(HubError::HubClosed)?;
        if hub.is_closed() {
            return Err(HubError::HubClosed);
        }
        let room_handle = Hub::from_inner(hub).get_room(room);
        room_handle.join(Arc::clone(self));
        self.rooms.write().insert(room.to_string());
        // The connection may have closed while the memberships were going
        // in; removal has already stripped this client then, so undo them.
        if self.is_closed() {
            self.rooms.write().remove(room);
            room_handle.leave(&self.id);
            return Err(HubError::ConnectionClosed);
        }
        Ok(())
    }

    /// Leave a room.
    ///
    /// Removing a membership that does not exist is a no-op; a room name the
    /// hub has never seen reports [`HubError::RoomNotFound`].
    pub fn leave(&self, room: &str) -> HubResult<()> {
        self.rooms.write().remove(room);
        let hub = self.hub.upgrade().ok_or(HubError::HubClosed)?;
        if hub.is_closed() {
            return Err(HubError::HubClosed);
        }
        let found = Hub::from_inner(hub).room(room);
        match found {
            Some(r) => {
                r.leave(&self.id);
                Ok(())
            }
            None => Err(HubError::room_not_found(room)),
        }
    }

    /// Snapshot the names of the rooms this client belongs to.
    pub fn rooms(&self) -> Vec<String> {
        self.rooms.read().iter().cloned().collect()
    }

    /// Check membership in a room by name.
    pub fn in_room(&self, name: &str) -> bool {
        self.rooms.read().contains(name)
    }

    /// Close this client's connection with a normal status.
    pub async fn close(&self) -> HubResult<()> {
        self.conn.close().await
    }

    /// Drop a room membership without touching the room side.
    pub(crate) fn forget_room(&self, name: &str) {
        self.rooms.write().remove(name);
    }

    /// Snapshot and clear all room memberships.
    pub(crate) fn take_rooms(&self) -> Vec<String> {
        let mut rooms = self.rooms.write();
        rooms.drain().collect()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("connection_id", &self.conn.id())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
