//! The connection hub.
//!
//! A [`Hub`] is the registry of all live clients and all named rooms. It is
//! an explicitly owned object handed to collaborators by handle; its
//! lifecycle is tied to server startup and shutdown. Cloning a `Hub` clones
//! the handle, not the registry.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::config::HubConfig;
use crate::connection::Connection;
use crate::error::{CloseCode, HubError, HubResult};
use crate::message::Message;
use crate::room::Room;

/// A connect/disconnect lifecycle hook.
///
/// Hooks run on their own spawned task, fire-and-forget: they must not be
/// relied on for ordering, and a slow hook never blocks connect or
/// disconnect handling.
pub type Hook = Arc<dyn Fn(Arc<Client>) + Send + Sync>;

/// Counters describing a hub's lifetime activity.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    /// Number of currently registered clients.
    pub clients: usize,
    /// Number of rooms currently in the registry.
    pub rooms: usize,
    /// Total clients ever registered.
    pub total_connected: usize,
    /// Total clients ever removed.
    pub total_disconnected: usize,
}

/// The top-level registry of clients and rooms; the broadcast root.
///
/// All mutation and broadcast paths follow snapshot-under-lock, release,
/// then act, and no path acquires more than one of the hub registry, a room
/// lock, or a client lock at a time.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

pub(crate) struct HubInner {
    /// All live clients keyed by id.
    clients: DashMap<String, Arc<Client>>,
    /// All rooms keyed by name.
    rooms: DashMap<String, Arc<Room>>,
    /// Whether the hub has shut down.
    closed: AtomicBool,
    /// Hook fired when a client registers.
    on_connect: parking_lot::RwLock<Option<Hook>>,
    /// Hook fired when a client is removed.
    on_disconnect: parking_lot::RwLock<Option<Hook>>,
    /// Total clients ever registered.
    total_connected: AtomicUsize,
    /// Total clients ever removed.
    total_disconnected: AtomicUsize,
    /// Hub configuration.
    config: HubConfig,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    /// Create a hub with default configuration.
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a hub with the given configuration.
    pub fn with_config(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                clients: DashMap::new(),
                rooms: DashMap::new(),
                closed: AtomicBool::new(false),
                on_connect: parking_lot::RwLock::new(None),
                on_disconnect: parking_lot::RwLock::new(None),
                total_connected: AtomicUsize::new(0),
                total_disconnected: AtomicUsize::new(0),
                config,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<HubInner>) -> Self {
        Self { inner }
    }

    /// Get the hub configuration.
    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Check whether the hub has shut down.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Set the hook fired when a client registers.
    pub fn on_connect<F>(&self, hook: F)
    where
        F: Fn(Arc<Client>) + Send + Sync + 'static,
    {
        *self.inner.on_connect.write() = Some(Arc::new(hook));
    }

    /// Set the hook fired when a client is removed.
    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: Fn(Arc<Client>) + Send + Sync + 'static,
    {
        *self.inner.on_disconnect.write() = Some(Arc::new(hook));
    }

    /// Register a new client for a connection.
    ///
    /// This is the only creation path for clients. The connection's close
    /// callback is wired to hub-side removal, so however the connection ends
    /// the registry and room memberships are cleaned up exactly once.
    ///
    /// Registering an id that is already present closes and replaces the
    /// previous client. Fails with [`HubError::HubClosed`] after shutdown.
    pub fn new_client(
        &self,
        conn: Connection,
        id: impl Into<String>,
    ) -> HubResult<Arc<Client>> {
        if self.is_closed() {
            return Err(HubError::HubClosed);
        }
        let id = id.into();
        let client = Arc::new(Client::new(
            id.clone(),
            conn,
            Arc::downgrade(&self.inner),
        ));

        let weak_hub = Arc::downgrade(&self.inner);
        let weak_client = Arc::downgrade(&client);
        client
            .connection()
            .set_close_callback(Box::new(move || {
                if let (Some(inner), Some(client)) = (weak_hub.upgrade(), weak_client.upgrade()) {
                    HubInner::remove_client(&inner, &client);
                }
            }));

        // A concurrent close may have started after the check above; the
        // registry insert below would leak past shutdown, so re-check while
        // the entry is in place.
        if let Some(old) = self.inner.clients.insert(id.clone(), Arc::clone(&client)) {
            debug!(client_id = %id, "replacing existing client with same id");
            tokio::spawn(async move {
                let _ = old
                    .connection()
                    .close_with_reason(CloseCode::PolicyViolation, "superseded by new connection")
                    .await;
            });
        }
        if self.is_closed() {
            self.inner.clients.remove(&id);
            return Err(HubError::HubClosed);
        }

        self.inner.total_connected.fetch_add(1, Ordering::Relaxed);
        debug!(
            client_id = %id,
            connection_id = %client.connection().id(),
            total = self.inner.clients.len(),
            "client registered"
        );

        if let Some(hook) = self.inner.on_connect.read().clone() {
            let client = Arc::clone(&client);
            tokio::spawn(async move { hook(client) });
        }

        Ok(client)
    }

    /// Look up a client by id.
    pub fn client(&self, id: &str) -> Option<Arc<Client>> {
        self.inner.clients.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Snapshot all registered clients.
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.inner
            .clients
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Get the number of registered clients.
    pub fn len(&self) -> usize {
        self.inner.clients.len()
    }

    /// Check if no clients are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.clients.is_empty()
    }

    /// Get or create the room with the given name.
    ///
    /// Repeated calls with the same name yield the same room.
    pub fn get_room(&self, name: &str) -> Arc<Room> {
        let entry = self
            .inner
            .rooms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Room::new(name)));
        Arc::clone(entry.value())
    }

    /// Look up a room by name without creating it.
    pub fn room(&self, name: &str) -> Option<Arc<Room>> {
        self.inner.rooms.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Snapshot the names of all rooms.
    pub fn room_names(&self) -> Vec<String> {
        self.inner.rooms.iter().map(|e| e.key().clone()).collect()
    }

    /// Delete a room.
    ///
    /// Strips the room name from every current member's membership set; a
    /// later [`get_room`](Self::get_room) with the same name yields a fresh,
    /// empty room. Returns whether a room was removed.
    pub fn delete_room(&self, name: &str) -> bool {
        let Some((_, room)) = self.inner.rooms.remove(name) else {
            return false;
        };
        for member in room.members() {
            member.forget_room(name);
        }
        room.clear();
        debug!(room = %name, "room deleted");
        true
    }

    /// Send a frame to one client by id.
    pub async fn send_to(&self, id: &str, msg: Message) -> HubResult<()> {
        let client = self
            .client(id)
            .ok_or_else(|| HubError::client_not_found(id))?;
        client.send(msg).await
    }

    /// Broadcast a frame to every registered client.
    ///
    /// Same failure policy as room broadcast: delivery continues past
    /// failures and the most recent error is returned.
    pub async fn broadcast(&self, msg: Message) -> HubResult<()> {
        self.deliver(None, msg).await
    }

    /// Broadcast a text frame to every registered client.
    pub async fn broadcast_text(&self, text: impl Into<String>) -> HubResult<()> {
        self.broadcast(Message::text(text)).await
    }

    /// Broadcast a JSON value to every registered client as a text frame.
    pub async fn broadcast_json<T: serde::Serialize>(&self, value: &T) -> HubResult<()> {
        self.broadcast(Message::from_json(value)?).await
    }

    /// Broadcast a frame to every registered client except one.
    pub async fn broadcast_except(&self, except: &str, msg: Message) -> HubResult<()> {
        self.deliver(Some(except), msg).await
    }

    /// Get activity counters.
    pub fn stats(&self) -> HubStats {
        HubStats {
            clients: self.inner.clients.len(),
            rooms: self.inner.rooms.len(),
            total_connected: self.inner.total_connected.load(Ordering::Relaxed),
            total_disconnected: self.inner.total_disconnected.load(Ordering::Relaxed),
        }
    }

    /// Shut the hub down.
    ///
    /// Idempotent and terminal: the first caller closes every registered
    /// connection (each close drives removal and the disconnect hook through
    /// the close callback) and empties both registries. Later calls are
    /// no-ops. No new clients are accepted afterwards.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let clients = self.clients();
        info!(clients = clients.len(), "hub shutting down");
        for client in clients {
            let _ = client
                .connection()
                .close_with_reason(CloseCode::GoingAway, "hub shutting down")
                .await;
        }
        // The close callbacks have emptied the client registry; rooms are
        // empty shells now and the name map goes with them.
        self.inner.clients.clear();
        self.inner.rooms.clear();
    }

    /// Snapshot-then-send fan-out shared by the broadcast variants.
    ///
    /// Sends run concurrently, one per client, so a slow receiver only
    /// delays its own delivery. Failures are folded in client order; the
    /// last one wins.
    async fn deliver(&self, except: Option<&str>, msg: Message) -> HubResult<()> {
        let clients: Vec<_> = self
            .clients()
            .into_iter()
            .filter(|c| except != Some(c.id()))
            .collect();
        let results = join_all(clients.iter().map(|c| c.send(msg.clone()))).await;
        let mut last_err = None;
        for (client, result) in clients.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    client_id = %client.id(),
                    error = %e,
                    "broadcast delivery failed"
                );
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("clients", &self.inner.clients.len())
            .field("rooms", &self.inner.rooms.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl HubInner {
    /// Whether the hub has shut down.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remove a client from the registry and every room it belonged to.
    ///
    /// Invoked by the connection close callback, so it runs exactly once per
    /// client regardless of how the session ended. Idempotent: a client that
    /// was already removed (or superseded by a newer client with the same
    /// id) only has its memberships stripped.
    ///
    /// Acquires at most one room lock at a time and never a room lock
    /// together with the registry.
    pub(crate) fn remove_client(inner: &Arc<Self>, client: &Arc<Client>) {
        let removed = inner
            .clients
            .remove_if(client.id(), |_, registered| Arc::ptr_eq(registered, client))
            .is_some();

        for name in client.take_rooms() {
            let room = inner.rooms.get(&name).map(|e| Arc::clone(e.value()));
            if let Some(room) = room {
                room.leave(client.id());
            }
        }

        if removed {
            inner.total_disconnected.fetch_add(1, Ordering::Relaxed);
            debug!(
                client_id = %client.id(),
                remaining = inner.clients.len(),
                "client removed"
            );
            if let Some(hook) = inner.on_disconnect.read().clone() {
                let client = Arc::clone(client);
                tokio::spawn(async move { hook(client) });
            }
        }
    }
}
