//! Protocol Session Manager
//!
//! Bridges the tool protocol's two carriers onto persistent per-client
//! bindings.
//!
//! # Identity
//!
//! Every inbound id is normalized against the carrier it arrived on before it
//! touches the table, so `push:abc`, `request:abc` and `request:push:abc` can
//! never alias one another's entries. Only bare ids leave this module.
//!
//! # Creation
//!
//! ```text
//!   lookup(id) ─ hit, same id ───────────────────────────► reuse
//!       │
//!       ├─ hit, wrong id ─► discard (warn) ─┐
//!       │                                   ▼
//!       └─ miss ─────────► per-id creation lock ─► re-check ─► connect
//!                                                              │
//!                          table entry won by someone else? ◄──┘
//!                             yes: shut candidate down, adopt winner
//!                             no:  insert candidate
//! ```
//!
//! Creation locks are per namespaced id, so first handshakes on different
//! ids never wait on each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::binding::{ProtocolBinding, UpstreamConnector};
use super::carrier::{normalize_id, CarrierKind, NamespacedId};
use super::frame::FrameCodec;
use super::message::JsonRpcMessage;
use super::sink::{ByteSink, RawByteSink};
use super::ProtocolConfig;
use crate::error::{GatewayError, Result};

/// Result of one request-carrier exchange
#[derive(Clone, Debug, PartialEq)]
pub struct ExchangeOutcome {
    /// Bare session id, safe to echo to the client
    pub session_id: String,
    /// The reply written to the sink, if one was due
    pub response: Option<JsonRpcMessage>,
}

/// Manager-wide counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Bindings currently registered
    pub active: usize,
    /// Bindings created
    pub created: u64,
    /// Creations that lost a race and adopted the winner
    pub adopted: u64,
    /// Mis-keyed bindings discarded and recreated
    pub recreated: u64,
    /// Bindings torn down
    pub torn_down: u64,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    adopted: AtomicU64,
    recreated: AtomicU64,
    torn_down: AtomicU64,
}

/// Table of protocol bindings keyed by namespaced id
pub struct ProtocolSessionManager {
    table: DashMap<NamespacedId, Arc<ProtocolBinding>>,
    creation_locks: DashMap<NamespacedId, Arc<tokio::sync::Mutex<()>>>,
    connector: Arc<dyn UpstreamConnector>,
    codec: FrameCodec,
    config: ProtocolConfig,
    counters: Counters,
}

impl ProtocolSessionManager {
    /// Create a manager that connects new sessions through `connector`
    pub fn new(connector: Arc<dyn UpstreamConnector>, config: ProtocolConfig) -> Self {
        Self {
            table: DashMap::new(),
            creation_locks: DashMap::new(),
            connector,
            codec: FrameCodec::new(config.max_frame_size),
            config,
            counters: Counters::default(),
        }
    }

    /// Manager configuration
    #[must_use]
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    // ========================================================================
    // Lookup / creation
    // ========================================================================

    fn normalize(raw_id: &str, kind: CarrierKind) -> Result<NamespacedId> {
        let id = normalize_id(raw_id, kind);
        if id.bare().is_empty() {
            return Err(GatewayError::Validation(format!(
                "session id '{raw_id}' is empty once namespaces are removed"
            )));
        }
        Ok(id)
    }

    fn existing(&self, id: &NamespacedId) -> Option<Arc<ProtocolBinding>> {
        self.table.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop a binding whose own id disagrees with its table key
    async fn discard_miskeyed(&self, key: &NamespacedId, binding: Arc<ProtocolBinding>) {
        tracing::warn!(
            key = %key,
            bound_to = %binding.id(),
            "Protocol binding registered under the wrong id, recreating"
        );
        self.table
            .remove_if(key, |_, current| Arc::ptr_eq(current, &binding));
        self.counters.recreated.fetch_add(1, Ordering::Relaxed);
        binding.shutdown().await;
    }

    /// Return the binding for `id`, creating it on a cold start
    ///
    /// # Errors
    ///
    /// Whatever the upstream connector reports.
    pub async fn lookup(&self, id: &NamespacedId) -> Result<Arc<ProtocolBinding>> {
        if let Some(binding) = self.existing(id) {
            if binding.id() == id {
                binding.touch();
                return Ok(binding);
            }
            self.discard_miskeyed(id, binding).await;
        }

        let lock = Arc::clone(
            self.creation_locks
                .entry(id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .value(),
        );
        let creating = lock.lock().await;

        if let Some(binding) = self.existing(id) {
            if binding.id() == id {
                binding.touch();
                return Ok(binding);
            }
            self.discard_miskeyed(id, binding).await;
        }

        let server = match self.connector.connect(id).await {
            Ok(server) => server,
            Err(e) => {
                drop(creating);
                self.creation_locks
                    .remove_if(id, |_, l| Arc::ptr_eq(l, &lock) && Arc::strong_count(l) <= 2);
                return Err(e);
            }
        };
        let candidate = Arc::new(ProtocolBinding::new(id.clone(), server));

        let winner = match self.table.entry(id.clone()) {
            Entry::Occupied(entry) if entry.get().id() == id => Some(Arc::clone(entry.get())),
            Entry::Occupied(mut entry) => {
                // Mis-keyed entry appeared while connecting; ours replaces it
                let stale = entry.insert(Arc::clone(&candidate));
                self.counters.recreated.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %id, bound_to = %stale.id(), "Replaced mis-keyed protocol binding");
                None
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&candidate));
                None
            }
        };

        match winner {
            Some(winner) => {
                self.counters.adopted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(session = %id, "Lost creation race, adopting existing binding");
                candidate.shutdown().await;
                winner.touch();
                Ok(winner)
            }
            None => {
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                tracing::info!(session = %id, "Protocol session created");
                Ok(candidate)
            }
        }
    }

    // ========================================================================
    // Request carrier
    // ========================================================================

    /// Handle one request-carrier exchange
    ///
    /// The reply, if any, is written as plain JSON through a [`RawByteSink`]
    /// and the reply sink is closed.
    ///
    /// # Errors
    ///
    /// - `Validation` for a bad envelope, an empty id, a call before the
    ///   handshake, or a reply sink that refuses identity mode
    /// - connector failures on cold start
    /// - `Internal` if writing the reply fails
    pub async fn handle_request(
        &self,
        raw_id: &str,
        message: JsonRpcMessage,
        reply: Box<dyn ByteSink>,
    ) -> Result<ExchangeOutcome> {
        message.validate()?;
        let id = Self::normalize(raw_id, CarrierKind::Request)?;
        let mut reply = RawByteSink::new(reply)
            .map_err(|e| GatewayError::Validation(format!("reply sink unusable: {e}")))?;

        let binding = self.lookup(&id).await?;
        let response = binding.process(message).await?;

        if let Some(ref msg) = response {
            let body = serde_json::to_vec(msg)
                .map_err(|e| GatewayError::Internal(format!("failed to encode reply: {e}")))?;
            reply
                .write_bytes(&body)
                .await
                .map_err(|e| GatewayError::Internal(format!("reply write failed: {e}")))?;
        }
        if let Err(e) = reply.close().await {
            tracing::debug!(session = %id, error = %e, "Reply sink close failed");
        }

        Ok(ExchangeOutcome {
            session_id: id.bare().to_string(),
            response,
        })
    }

    // ========================================================================
    // Push carrier
    // ========================================================================

    /// Register the long-lived outbound sink for a push session
    ///
    /// A previously registered sink is closed. Returns the bare session id.
    ///
    /// # Errors
    ///
    /// `Validation` for an empty id or a sink that refuses identity mode;
    /// connector failures on cold start.
    pub async fn open_push(&self, raw_id: &str, sink: Box<dyn ByteSink>) -> Result<String> {
        let id = Self::normalize(raw_id, CarrierKind::Push)?;
        let sink = RawByteSink::new(sink)
            .map_err(|e| GatewayError::Validation(format!("push sink unusable: {e}")))?;

        let binding = self.lookup(&id).await?;
        if let Some(mut previous) = binding.replace_push_sink(sink).await {
            tracing::debug!(session = %id, "Replacing push stream");
            let _ = previous.close().await;
        }
        Ok(id.bare().to_string())
    }

    /// Handle one inbound push-carrier message
    ///
    /// The reply, if any, is framed and written to the registered push sink.
    /// A failed write is a detected disconnect: the session is torn down.
    ///
    /// # Errors
    ///
    /// As [`handle_request`](Self::handle_request), plus `Validation` if no
    /// push sink is registered. That check runs before any connect or tool
    /// call, so a rejected message leaves no session behind.
    pub async fn handle_push(&self, raw_id: &str, message: JsonRpcMessage) -> Result<Option<JsonRpcMessage>> {
        message.validate()?;
        let id = Self::normalize(raw_id, CarrierKind::Push)?;

        // Push sessions only come into being through open_push
        let binding = match self.existing(&id) {
            Some(binding) if binding.id() == &id && binding.has_push_sink().await => binding,
            _ => {
                return Err(GatewayError::Validation(format!(
                    "session '{}' has no open push stream",
                    id.bare()
                )))
            }
        };
        binding.touch();
        let response = binding.process(message).await?;

        if let Some(ref msg) = response {
            self.write_frame(&id, &binding, msg).await?;
        }
        Ok(response)
    }

    /// Push a server-initiated message to a push session
    ///
    /// # Errors
    ///
    /// `SessionNotFound` if there is no such push session; write failures as
    /// in [`handle_push`](Self::handle_push).
    pub async fn notify(&self, raw_id: &str, message: &JsonRpcMessage) -> Result<()> {
        let id = Self::normalize(raw_id, CarrierKind::Push)?;
        let binding = self
            .existing(&id)
            .ok_or_else(|| GatewayError::SessionNotFound(id.bare().to_string()))?;
        self.write_frame(&id, &binding, message).await
    }

    async fn write_frame(
        &self,
        id: &NamespacedId,
        binding: &ProtocolBinding,
        msg: &JsonRpcMessage,
    ) -> Result<()> {
        let frame = self
            .codec
            .encode(msg)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        match binding.write_push(&frame).await {
            Ok(()) => Ok(()),
            Err(GatewayError::Internal(reason)) => {
                tracing::warn!(session = %id, reason = %reason, "Push carrier disconnected, tearing down");
                self.teardown_id(id).await;
                Err(GatewayError::Internal(reason))
            }
            Err(other) => Err(other),
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    async fn teardown_id(&self, id: &NamespacedId) -> bool {
        let Some((_, binding)) = self.table.remove(id) else {
            return false;
        };
        self.creation_locks.remove(id);
        binding.shutdown().await;
        self.connector.disconnect(id).await;
        self.counters.torn_down.fetch_add(1, Ordering::Relaxed);
        tracing::info!(session = %id, "Protocol session torn down");
        true
    }

    /// Explicitly end a session; returns whether one existed
    pub async fn teardown(&self, raw_id: &str, kind: CarrierKind) -> bool {
        self.teardown_id(&normalize_id(raw_id, kind)).await
    }

    /// Tear down request-carrier sessions idle for at least `max_idle`
    ///
    /// Push sessions are bound to a live connection and are never reaped.
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let idle: Vec<NamespacedId> = self
            .table
            .iter()
            .filter(|entry| {
                entry.key().kind() == CarrierKind::Request
                    && now.saturating_duration_since(entry.value().last_activity()) >= max_idle
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for id in idle {
            if self.teardown_id(&id).await {
                reaped += 1;
            }
        }
        if reaped > 0 {
            tracing::debug!(reaped, remaining = self.table.len(), "Reaped idle protocol sessions");
        }
        reaped
    }

    /// Reap idle request sessions until `shutdown` fires
    pub async fn run_reaper(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reap_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.reap_idle(self.config.idle_timeout).await;
                }
            }
        }
    }

    /// Tear down every session
    pub async fn shutdown_all(&self) -> usize {
        let ids: Vec<NamespacedId> = self.table.iter().map(|e| e.key().clone()).collect();
        let mut count = 0;
        for id in ids {
            if self.teardown_id(&id).await {
                count += 1;
            }
        }
        tracing::info!(count, "All protocol sessions shut down");
        count
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Whether a session exists for `raw_id` on `kind`
    #[must_use]
    pub fn contains(&self, raw_id: &str, kind: CarrierKind) -> bool {
        self.table.contains_key(&normalize_id(raw_id, kind))
    }

    /// Whether that session has completed its handshake
    #[must_use]
    pub fn is_initialized(&self, raw_id: &str, kind: CarrierKind) -> bool {
        self.existing(&normalize_id(raw_id, kind))
            .is_some_and(|b| b.is_initialized())
    }

    /// Bare ids of sessions on `kind`
    #[must_use]
    pub fn session_ids(&self, kind: CarrierKind) -> Vec<String> {
        let mut ids: Vec<String> = self
            .table
            .iter()
            .filter(|e| e.key().kind() == kind)
            .map(|e| e.key().bare().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Number of sessions across both carriers
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether there are no sessions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Manager-wide counters
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            active: self.table.len(),
            created: self.counters.created.load(Ordering::Relaxed),
            adopted: self.counters.adopted.load(Ordering::Relaxed),
            recreated: self.counters.recreated.load(Ordering::Relaxed),
            torn_down: self.counters.torn_down.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn insert_raw(&self, key: NamespacedId, binding: Arc<ProtocolBinding>) {
        self.table.insert(key, binding);
    }
}

impl std::fmt::Debug for ProtocolSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolSessionManager")
            .field("sessions", &self.table.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
