//! Named multicast groups.
//!
//! A [`Room`] is a named set of clients with thread-safe membership and
//! broadcast. Rooms are created lazily through
//! [`Hub::get_room`](crate::Hub::get_room) and identified by name: asking for
//! the same name twice yields the same room.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;
use tracing::warn;

use crate::client::Client;
use crate::error::HubResult;
use crate::message::Message;

/// A named multicast group of clients.
///
/// Every broadcast and read-only walk follows snapshot-then-act: the member
/// set is copied under the lock, the lock is released, and delivery happens
/// on the copy. A slow member can therefore never stall room mutation or
/// delivery to other members.
pub struct Room {
    /// The room name; unique within a hub.
    name: String,
    /// Member clients keyed by client id.
    clients: RwLock<HashMap<String, Arc<Client>>>,
}

impl Room {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Get the room name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a client to the room. Adding an existing member is a no-op.
    pub fn join(&self, client: Arc<Client>) {
        self.clients
            .write()
            .insert(client.id().to_string(), client);
    }

    /// Remove a client from the room by id. Unknown ids are a no-op.
    pub fn leave(&self, id: &str) {
        self.clients.write().remove(id);
    }

    /// Get the number of members.
    pub fn size(&self) -> usize {
        self.clients.read().len()
    }

    /// Check if the room has no members.
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Check membership by client id.
    pub fn has(&self, id: &str) -> bool {
        self.clients.read().contains_key(id)
    }

    /// Snapshot the current members.
    pub fn members(&self) -> Vec<Arc<Client>> {
        self.clients.read().values().map(Arc::clone).collect()
    }

    /// Run a callback for each member.
    ///
    /// The callback runs on a snapshot outside the room lock, so it may
    /// safely re-enter the room (join, leave, broadcast).
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Client>),
    {
        for client in self.members() {
            f(&client);
        }
    }

    /// Broadcast a frame to every member.
    ///
    /// Delivery failures do not abort the rest of the fan-out; each failure
    /// is logged and the most recent one is returned ("last error wins").
    pub async fn broadcast(&self, msg: Message) -> HubResult<()> {
        self.deliver(None, msg).await
    }

    /// Broadcast a text frame to every member.
    pub async fn broadcast_text(&self, text: impl Into<String>) -> HubResult<()> {
        self.broadcast(Message::text(text)).await
    }

    /// Broadcast a JSON value to every member as a text frame.
    pub async fn broadcast_json<T: serde::Serialize>(&self, value: &T) -> HubResult<()> {
        self.broadcast(Message::from_json(value)?).await
    }

    /// Broadcast a frame to every member except one, typically the sender.
    pub async fn broadcast_except(&self, except: &str, msg: Message) -> HubResult<()> {
        self.deliver(Some(except), msg).await
    }

    /// Broadcast a text frame to every member except one.
    pub async fn broadcast_text_except(
        &self,
        except: &str,
        text: impl Into<String>,
    ) -> HubResult<()> {
        self.broadcast_except(except, Message::text(text)).await
    }

    /// Remove every member, without touching client-side membership sets.
    pub(crate) fn clear(&self) {
        self.clients.write().clear();
    }

    /// Snapshot-then-send fan-out shared by the broadcast variants.
    ///
    /// Sends run concurrently, one per member, so a slow member only delays
    /// its own delivery. Failures are folded in member order; the last one
    /// wins.
    async fn deliver(&self, except: Option<&str>, msg: Message) -> HubResult<()> {
        let members: Vec<_> = self
            .members()
            .into_iter()
            .filter(|c| except != Some(c.id()))
            .collect();
        let results = join_all(members.iter().map(|c| c.send(msg.clone()))).await;
        let mut last_err = None;
        for (client, result) in members.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    room = %self.name,
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

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HubError;
    use crate::hub::Hub;
    use crate::testing::channel_connection;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_join_leave_idempotent() {
        let hub = Hub::new();
        let (conn, _out, _inb) = channel_connection();
        let client = hub.new_client(conn, "a").unwrap();

        let room = hub.get_room("lobby");
        room.join(Arc::clone(&client));
        room.join(Arc::clone(&client));
        assert_eq!(room.size(), 1);
        assert!(room.has("a"));

        room.leave("a");
        room.leave("a");
        assert_eq!(room.size(), 0);
        assert!(room.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_members() {
        let hub = Hub::new();
        let (conn_a, mut out_a, _inb_a) = channel_connection();
        let (conn_b, mut out_b, _inb_b) = channel_connection();
        let a = hub.new_client(conn_a, "a").unwrap();
        let b = hub.new_client(conn_b, "b").unwrap();
        a.join("lobby").unwrap();
        b.join("lobby").unwrap();

        let room = hub.room("lobby").unwrap();
        room.broadcast_text("hi").await.unwrap();

        assert_eq!(out_a.next().await.unwrap(), Message::text("hi"));
        assert_eq!(out_b.next().await.unwrap(), Message::text("hi"));
    }

    #[tokio::test]
    async fn test_broadcast_except_skips_sender() {
        let hub = Hub::new();
        let (conn_a, mut out_a, _inb_a) = channel_connection();
        let (conn_b, mut out_b, _inb_b) = channel_connection();
        let a = hub.new_client(conn_a, "a").unwrap();
        let b = hub.new_client(conn_b, "b").unwrap();
        a.join("lobby").unwrap();
        b.join("lobby").unwrap();

        let room = hub.room("lobby").unwrap();
        room.broadcast_text_except("a", "hi").await.unwrap();
        room.broadcast_text("all").await.unwrap();

        // "a" only sees the second broadcast.
        assert_eq!(out_a.next().await.unwrap(), Message::text("all"));
        assert_eq!(out_b.next().await.unwrap(), Message::text("hi"));
        assert_eq!(out_b.next().await.unwrap(), Message::text("all"));
    }

    #[tokio::test]
    async fn test_broadcast_last_error_wins() {
        let hub = Hub::new();
        let (conn_a, _out_a, _inb_a) = channel_connection();
        let (conn_b, mut out_b, _inb_b) = channel_connection();
        let a = hub.new_client(conn_a, "a").unwrap();
        let b = hub.new_client(conn_b, "b").unwrap();

        a.join("lobby").unwrap();
        b.join("lobby").unwrap();
        let room = hub.room("lobby").unwrap();

        a.connection().close().await.unwrap();
        // Membership cleanup ran through the close callback; re-add the dead
        // client to force a delivery failure.
        room.join(Arc::clone(&a));

        let err = room.broadcast_text("hi").await.unwrap_err();
        assert!(matches!(err, HubError::ConnectionClosed));
        // The live member still received the frame.
        let mut saw_hi = false;
        while let Ok(Some(msg)) = out_b.try_next() {
            if msg == Message::text("hi") {
                saw_hi = true;
            }
        }
        assert!(saw_hi);
    }

    #[tokio::test]
    async fn test_stuck_member_does_not_stall_delivery() {
        let hub = Hub::new();
        let stuck = hub
            .new_client(crate::testing::stuck_connection(), "stuck")
            .unwrap();
        let (conn_b, mut out_b, _inb_b) = channel_connection();
        let b = hub.new_client(conn_b, "b").unwrap();
        stuck.join("lobby").unwrap();
        b.join("lobby").unwrap();

        let room = hub.room("lobby").unwrap();
        let broadcast = tokio::spawn(async move { room.broadcast_text("hi").await });

        // The healthy member gets the frame even though the stuck member's
        // send never completes.
        let frame = tokio::time::timeout(std::time::Duration::from_millis(200), out_b.next())
            .await
            .expect("healthy member starved by stuck member")
            .unwrap();
        assert_eq!(frame, Message::text("hi"));
        broadcast.abort();
    }

    #[tokio::test]
    async fn test_for_each_may_reenter() {
        let hub = Hub::new();
        let (conn, _out, _inb) = channel_connection();
        let client = hub.new_client(conn, "a").unwrap();
        client.join("lobby").unwrap();

        let room = hub.room("lobby").unwrap();
        let mut seen = Vec::new();
        room.for_each(|c| {
            // Re-entering the room from the callback must not deadlock.
            assert!(room.has(c.id()));
            seen.push(c.id().to_string());
        });
        assert_eq!(seen, vec!["a".to_string()]);
    }
}
