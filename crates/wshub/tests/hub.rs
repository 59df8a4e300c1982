//! End-to-end tests for the hub over in-memory connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_channel::mpsc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;

use wshub::{
    Connection, ConnectionConfig, Envelope, Hub, HubConfig, HubError, Message, Router,
};

type Outbound = mpsc::UnboundedReceiver<Message>;
type Inbound = mpsc::UnboundedSender<Result<Message, HubError>>;

/// A connection whose socket is a pair of unbounded channels.
fn channel_connection() -> (Connection, Outbound, Inbound) {
    let (out_tx, out_rx) = mpsc::unbounded::<Message>();
    let (in_tx, in_rx) = mpsc::unbounded::<Result<Message, HubError>>();
    let sink = out_tx.sink_map_err(|e| HubError::send_failed(e.to_string()));
    let conn = Connection::from_parts(sink, in_rx, ConnectionConfig::default());
    (conn, out_rx, in_tx)
}

/// Collect the data frames currently buffered on an outbound channel.
fn drain_data_frames(outbound: &mut Outbound) -> Vec<Message> {
    let mut frames = Vec::new();
    while let Ok(Some(msg)) = outbound.try_next() {
        if msg.is_data() {
            frames.push(msg);
        }
    }
    frames
}

/// Wait until the condition holds or a short deadline passes.
async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn lobby_broadcast_scenario() {
    let hub = Hub::new();
    let (conn1, mut out1, _in1) = channel_connection();
    let (conn2, mut out2, _in2) = channel_connection();

    let c1 = hub.new_client(conn1, "a").unwrap();
    let c2 = hub.new_client(conn2, "b").unwrap();
    c1.join("lobby").unwrap();
    c2.join("lobby").unwrap();

    hub.room("lobby").unwrap().broadcast_text("hi").await.unwrap();
    assert_eq!(out1.next().await.unwrap(), Message::text("hi"));
    assert_eq!(out2.next().await.unwrap(), Message::text("hi"));

    c1.leave("lobby").unwrap();
    assert_eq!(hub.room("lobby").unwrap().size(), 1);
    assert!(!c1.in_room("lobby"));
    assert!(c2.in_room("lobby"));
}

#[tokio::test]
async fn membership_symmetry() {
    let hub = Hub::new();
    let mut clients = Vec::new();
    for i in 0..4 {
        let (conn, _out, _inb) = channel_connection();
        let client = hub.new_client(conn, format!("c{i}")).unwrap();
        client.join("red").unwrap();
        if i % 2 == 0 {
            client.join("blue").unwrap();
        }
        clients.push(client);
    }

    for client in &clients {
        for name in ["red", "blue"] {
            let room = hub.get_room(name);
            assert_eq!(client.in_room(name), room.has(client.id()));
        }
    }
}

#[tokio::test]
async fn removal_leaves_no_dangling_membership() {
    let hub = Hub::new();
    let (conn, _out, _inb) = channel_connection();
    let client = hub.new_client(conn, "a").unwrap();
    client.join("red").unwrap();
    client.join("blue").unwrap();

    client.close().await.unwrap();

    assert!(client.rooms().is_empty());
    assert_eq!(hub.room("red").unwrap().size(), 0);
    assert_eq!(hub.room("blue").unwrap().size(), 0);
    assert!(hub.client("a").is_none());
}

#[tokio::test]
async fn room_identity_and_reset() {
    let hub = Hub::new();
    let first = hub.get_room("x");
    assert!(Arc::ptr_eq(&first, &hub.get_room("x")));

    let (conn, _out, _inb) = channel_connection();
    let client = hub.new_client(conn, "a").unwrap();
    client.join("x").unwrap();

    assert!(hub.delete_room("x"));
    assert!(!client.in_room("x"));

    let fresh = hub.get_room("x");
    assert!(!Arc::ptr_eq(&first, &fresh));
    assert!(fresh.is_empty());
}

#[tokio::test]
async fn hub_close_is_idempotent_and_terminal() {
    let hub = Hub::new();
    let disconnects = Arc::new(AtomicUsize::new(0));
    {
        let disconnects = Arc::clone(&disconnects);
        hub.on_disconnect(move |_client| {
            disconnects.fetch_add(1, Ordering::SeqCst);
        });
    }

    let (conn1, _out1, _in1) = channel_connection();
    let (conn2, _out2, _in2) = channel_connection();
    let c1 = hub.new_client(conn1, "a").unwrap();
    let _c2 = hub.new_client(conn2, "b").unwrap();
    c1.join("lobby").unwrap();

    // Two concurrent closers; only one performs the shutdown.
    let h1 = hub.clone();
    let h2 = hub.clone();
    tokio::join!(h1.close(), h2.close());

    assert!(hub.is_closed());
    assert!(hub.is_empty());
    assert!(hub.room_names().is_empty());

    // Each disconnect hook fires exactly once per client.
    eventually(|| disconnects.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 2);

    // Closed hubs reject new clients.
    let (conn3, _out3, _in3) = channel_connection();
    assert!(matches!(
        hub.new_client(conn3, "late"),
        Err(HubError::HubClosed)
    ));
}

#[tokio::test]
async fn hub_close_unblocks_blocked_reader() {
    let hub = Hub::new();
    let (conn, _out, _inb) = channel_connection();
    let c1 = hub.new_client(conn, "a").unwrap();

    let reader = {
        let c1 = Arc::clone(&c1);
        tokio::spawn(async move { c1.connection().read().await })
    };
    tokio::task::yield_now().await;

    hub.close().await;

    let err = reader.await.unwrap().unwrap_err();
    assert!(matches!(err, HubError::ConnectionClosed));
    assert!(hub.is_empty());

    // A second close is a no-op.
    hub.close().await;
    assert!(hub.is_empty());
}

#[tokio::test]
async fn connect_hook_fires_per_client() {
    let hub = Hub::new();
    let connects = Arc::new(AtomicUsize::new(0));
    {
        let connects = Arc::clone(&connects);
        hub.on_connect(move |_client| {
            connects.fetch_add(1, Ordering::SeqCst);
        });
    }

    let (conn1, _out1, _in1) = channel_connection();
    let (conn2, _out2, _in2) = channel_connection();
    hub.new_client(conn1, "a").unwrap();
    hub.new_client(conn2, "b").unwrap();

    eventually(|| connects.load(Ordering::SeqCst) == 2).await;
}

#[tokio::test]
async fn concurrent_sends_never_interleave() {
    let hub = Hub::new();
    let (conn, mut out, _inb) = channel_connection();
    let client = hub.new_client(conn, "a").unwrap();

    let mut tasks = Vec::new();
    for i in 0..32 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            client.send_text(format!("message-{i}")).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // Every frame arrives whole; no two messages' bytes mix.
    let frames = drain_data_frames(&mut out);
    assert_eq!(frames.len(), 32);
    let mut seen: Vec<String> = frames
        .into_iter()
        .map(|m| m.into_text().unwrap())
        .collect();
    seen.sort();
    for (i, text) in seen.iter().enumerate() {
        assert!(text.starts_with("message-"));
        assert_eq!(seen.iter().filter(|t| *t == text).count(), 1, "{i}");
    }
}

#[tokio::test]
async fn broadcast_delivers_exactly_once_per_member() {
    let hub = Hub::new();
    let mut outs = Vec::new();
    for i in 0..3 {
        let (conn, out, _inb) = channel_connection();
        std::mem::drop(_inb);
        let client = hub.new_client(conn, format!("c{i}")).unwrap();
        client.join("room").unwrap();
        outs.push(out);
    }

    hub.room("room").unwrap().broadcast_text("m").await.unwrap();

    for out in &mut outs {
        let frames = drain_data_frames(out);
        assert_eq!(frames, vec![Message::text("m")]);
    }
}

#[tokio::test]
async fn hub_broadcast_except_skips_sender() {
    let hub = Hub::new();
    let (conn1, mut out1, _in1) = channel_connection();
    let (conn2, mut out2, _in2) = channel_connection();
    hub.new_client(conn1, "a").unwrap();
    hub.new_client(conn2, "b").unwrap();

    hub.broadcast_except("a", Message::text("psst")).await.unwrap();
    hub.broadcast_text("all").await.unwrap();

    assert_eq!(out1.next().await.unwrap(), Message::text("all"));
    assert_eq!(out2.next().await.unwrap(), Message::text("psst"));
    assert_eq!(out2.next().await.unwrap(), Message::text("all"));
}

#[tokio::test]
async fn router_session_end_to_end() {
    let hub = Hub::with_config(HubConfig::new().without_heartbeat());
    let router = Arc::new(Router::new());
    router.handle("chat", |client, envelope| async move {
        let hub = client.hub().ok_or(HubError::HubClosed)?;
        let text = envelope
            .payload_as::<serde_json::Value>()?
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        hub.get_room("lobby")
            .broadcast_text_except(client.id(), text)
            .await
    });

    let (conn1, mut out1, in1) = channel_connection();
    let (conn2, mut out2, _in2) = channel_connection();
    let c1 = hub.new_client(conn1, "a").unwrap();
    let c2 = hub.new_client(conn2, "b").unwrap();
    c1.join("lobby").unwrap();
    c2.join("lobby").unwrap();

    let session = {
        let router = Arc::clone(&router);
        tokio::spawn(async move { router.run_client(c1).await })
    };

    let envelope = Envelope::new("chat", json!({"text": "hello room"}));
    in1.unbounded_send(Ok(envelope.to_message().unwrap())).unwrap();

    // The other member sees the chat line; the sender does not.
    assert_eq!(out2.next().await.unwrap(), Message::text("hello room"));

    // Peer goes away; the session returns the close error and cleans up.
    in1.unbounded_send(Ok(Message::close(wshub::CloseCode::Normal, "done")))
        .unwrap();
    let err = session.await.unwrap().unwrap_err();
    assert!(err.is_normal_close());

    eventually(|| hub.client("a").is_none()).await;
    assert_eq!(hub.room("lobby").unwrap().size(), 1);
    assert!(drain_data_frames(&mut out1).is_empty());
}
