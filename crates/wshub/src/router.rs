//! Typed message routing over a single connection.
//!
//! The [`Router`] demultiplexes structured [`Envelope`] messages to per-type
//! handlers. [`Router::run_client`] is the per-connection session loop: it
//! reads frames, decodes envelopes, and dispatches them until the read side
//! fails, then cleans the connection up.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::Client;
use crate::error::{HubError, HubResult};
use crate::message::Message;

/// The routable unit sent over a connection once the router layer is used.
///
/// Wire format: a single text frame containing
/// `{"type": string, "payload": <opaque JSON>, "id"?: string}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The message type used to select a handler.
    #[serde(rename = "type")]
    pub kind: String,
    /// The opaque payload; interpreted only by the handler.
    #[serde(default)]
    pub payload: Value,
    /// Optional correlation id echoed by request/response protocols.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Envelope {
    /// Create a new envelope.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            id: None,
        }
    }

    /// Set the correlation id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Decode the payload into a typed value.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> HubResult<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| HubError::decode_failed(e.to_string()))
    }

    /// Encode the envelope as a text frame.
    pub fn to_message(&self) -> HubResult<Message> {
        Message::from_json(self)
    }
}

/// An async handler for one envelope type.
pub type Handler =
    Arc<dyn Fn(Arc<Client>, Envelope) -> Pin<Box<dyn Future<Output = HubResult<()>> + Send>> + Send + Sync>;

/// Demultiplexes envelopes to per-type handlers.
///
/// One handler per type; registering a type again replaces the previous
/// handler. Envelopes with no matching handler go to the default handler, or
/// are silently dropped when none is set.
#[derive(Default)]
pub struct Router {
    /// Handlers keyed by envelope type.
    handlers: RwLock<HashMap<String, Handler>>,
    /// Fallback for unregistered types.
    fallback: RwLock<Option<Handler>>,
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for an envelope type.
    ///
    /// Last registration wins: re-registering a type replaces the previous
    /// handler rather than erroring.
    pub fn handle<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Client>, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HubResult<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |client, envelope| Box::pin(handler(client, envelope)));
        self.handlers.write().insert(kind.into(), handler);
    }

    /// Register the fallback handler for unregistered types.
    pub fn default_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Client>, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HubResult<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |client, envelope| Box::pin(handler(client, envelope)));
        *self.fallback.write() = Some(handler);
    }

    /// Dispatch one envelope to its handler.
    ///
    /// Handler errors propagate to the caller. An envelope with no handler
    /// and no fallback is dropped with a debug log; that is a documented
    /// no-op, not a failure.
    pub async fn route(&self, client: Arc<Client>, envelope: Envelope) -> HubResult<()> {
        let handler = {
            let handlers = self.handlers.read();
            handlers.get(&envelope.kind).cloned()
        };
        let handler = match handler {
            Some(h) => h,
            None => match self.fallback.read().clone() {
                Some(h) => h,
                None => {
                    debug!(
                        client_id = %client.id(),
                        kind = %envelope.kind,
                        "no handler for message type, dropping"
                    );
                    return Ok(());
                }
            },
        };
        handler(client, envelope).await
    }

    /// Run the session loop for one client.
    ///
    /// Reads text frames, decodes them as envelopes, and routes each one;
    /// intended to run on its own task, one per client. A frame that is not
    /// a valid envelope is logged and skipped; binary frames are ignored
    /// (the envelope protocol is text-only). The loop ends when a read
    /// fails - including a peer close - or a handler errors, and always
    /// closes the connection on the way out so hub bookkeeping runs.
    ///
    /// When the hub config sets a heartbeat interval, ping frames are
    /// interleaved with reads on that cadence.
    pub async fn run_client(&self, client: Arc<Client>) -> HubResult<()> {
        let heartbeat = client
            .hub()
            .and_then(|hub| hub.config().heartbeat_interval);
        let mut ticker = heartbeat.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately.
            interval.reset();
            interval
        });

        let result = loop {
            let frame = match ticker.as_mut() {
                Some(ticker) => {
                    tokio::select! {
                        frame = client.connection().read() => frame,
                        _ = ticker.tick() => {
                            if let Err(e) = client.connection().write(Message::ping(Vec::new())).await {
                                break Err(e);
                            }
                            continue;
                        }
                    }
                }
                None => client.connection().read().await,
            };

            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => {
                        if let Err(e) = self.route(Arc::clone(&client), envelope).await {
                            warn!(client_id = %client.id(), error = %e, "handler failed");
                            break Err(e);
                        }
                    }
                    Err(e) => {
                        warn!(client_id = %client.id(), error = %e, "malformed envelope, skipping");
                    }
                },
                Ok(other) => {
                    debug!(
                        client_id = %client.id(),
                        kind = other.kind(),
                        "ignoring non-text frame"
                    );
                }
                Err(e) => break Err(e),
            }
        };

        let _ = client.close().await;
        result
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("types", &self.handlers.read().len())
            .field("has_default", &self.fallback.read().is_some())
            .finish()
    }
}
