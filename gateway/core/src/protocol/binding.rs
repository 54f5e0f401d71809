//! Protocol bindings
//!
//! A binding ties one namespaced session to the tool server serving it. It
//! owns the once-only handshake and, for the push carrier, the registered
//! outbound sink.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use super::carrier::NamespacedId;
use super::message::{JsonRpcError, JsonRpcMessage};
use super::sink::RawByteSink;
use crate::error::{GatewayError, Result};

// ============================================================================
// Collaborator traits
// ============================================================================

/// The tool-protocol server behind a session
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Perform the protocol handshake
    async fn initialize(&self, params: Value) -> std::result::Result<Value, JsonRpcError>;

    /// Handle any post-handshake call or notification
    async fn call(&self, method: &str, params: Value) -> std::result::Result<Value, JsonRpcError>;

    /// Release server-side resources
    async fn shutdown(&self);
}

/// Wires new sessions to upstream tool servers
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Create a tool server for the session
    ///
    /// # Errors
    ///
    /// Any failure to reach the upstream; surfaced to the caller.
    async fn connect(&self, id: &NamespacedId) -> Result<Arc<dyn ToolServer>>;

    /// The session is gone; drop any upstream state for it
    async fn disconnect(&self, id: &NamespacedId);
}

// ============================================================================
// Binding
// ============================================================================

/// One live protocol session
pub struct ProtocolBinding {
    id: NamespacedId,
    server: Arc<dyn ToolServer>,
    handshake: OnceCell<Value>,
    last_activity: Mutex<Instant>,
    push_sink: tokio::sync::Mutex<Option<RawByteSink>>,
}

impl ProtocolBinding {
    /// Bind `server` to `id`
    #[must_use]
    pub fn new(id: NamespacedId, server: Arc<dyn ToolServer>) -> Self {
        Self {
            id,
            server,
            handshake: OnceCell::new(),
            last_activity: Mutex::new(Instant::now()),
            push_sink: tokio::sync::Mutex::new(None),
        }
    }

    /// The namespaced id this binding was created for
    #[must_use]
    pub fn id(&self) -> &NamespacedId {
        &self.id
    }

    /// Whether the handshake has completed
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.handshake.initialized()
    }

    /// Record activity now
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time of last activity
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Run (or replay) the handshake
    ///
    /// Concurrent callers wait on the first; only one `initialize` reaches
    /// the server. A failed handshake may be retried.
    async fn handshake(&self, params: Value) -> std::result::Result<Value, JsonRpcError> {
        let server = Arc::clone(&self.server);
        self.handshake
            .get_or_try_init(|| async move { server.initialize(params).await })
            .await
            .cloned()
    }

    /// Process one inbound message, returning the reply if one is due
    ///
    /// # Errors
    ///
    /// `Validation` for a call arriving before the handshake.
    pub async fn process(&self, msg: JsonRpcMessage) -> Result<Option<JsonRpcMessage>> {
        self.touch();

        if msg.is_response() {
            tracing::trace!(session = %self.id, "Client response received, nothing to reply");
            return Ok(None);
        }

        let params = msg.params.unwrap_or(Value::Null);
        let method = msg.method.unwrap_or_default();

        let outcome = if method == super::message::INITIALIZE {
            self.handshake(params).await
        } else {
            if !self.is_initialized() {
                return Err(GatewayError::Validation(format!(
                    "'{method}' called before initialize"
                )));
            }
            self.server.call(&method, params).await
        };

        if msg.id.is_none() {
            if let Err(e) = outcome {
                tracing::debug!(session = %self.id, method = %method, error = %e, "Notification failed");
            }
            return Ok(None);
        }

        Ok(Some(match outcome {
            Ok(result) => JsonRpcMessage::response(msg.id, result),
            Err(error) => JsonRpcMessage::error_response(msg.id, error),
        }))
    }

    /// Install the push carrier's outbound sink, returning the previous one
    pub async fn replace_push_sink(&self, sink: RawByteSink) -> Option<RawByteSink> {
        self.push_sink.lock().await.replace(sink)
    }

    /// Whether a push sink is currently installed
    pub async fn has_push_sink(&self) -> bool {
        self.push_sink.lock().await.is_some()
    }

    /// Write bytes to the push sink
    ///
    /// # Errors
    ///
    /// `Validation` if no push sink is open, `Internal` if the write fails.
    pub async fn write_push(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.push_sink.lock().await;
        let sink = guard.as_mut().ok_or_else(|| {
            GatewayError::Validation(format!(
                "session '{}' has no open push stream",
                self.id.bare()
            ))
        })?;
        sink.write_bytes(bytes)
            .await
            .map_err(|e| GatewayError::Internal(format!("push write failed: {e}")))
    }

    /// Close the push sink and shut the server down
    pub async fn shutdown(&self) {
        if let Some(mut sink) = self.push_sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                tracing::debug!(session = %self.id, error = %e, "Push sink close failed");
            }
        }
        self.server.shutdown().await;
    }
}

impl std::fmt::Debug for ProtocolBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolBinding")
            .field("id", &self.id)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}
