//! Gateway - The Composed Core
//!
//! Wires the streaming registry, credential gate, dispatcher and protocol
//! manager together from one [`GatewayConfig`], and owns the background
//! maintenance tasks:
//!
//! - the stream sweeper, which evicts closed sessions after their grace window
//! - the protocol reaper, which tears down idle request-carrier sessions
//!
//! Front doors (HTTP, push sockets) hold an `Arc<Gateway>` and call into the
//! component they need.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{TransformPipeline, UsageRecorder};
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::protocol::{ProtocolSessionManager, UpstreamConnector};
use crate::routing::{
    DispatchOutcome, DispatchRequest, KeyRotationGate, ProviderCatalog, RequestDispatcher,
};
use crate::streaming::{new_session_id, StreamingSessionRegistry};

/// The assembled gateway core
pub struct Gateway {
    registry: Arc<StreamingSessionRegistry>,
    gate: Arc<KeyRotationGate>,
    dispatcher: RequestDispatcher,
    protocol: Arc<ProtocolSessionManager>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Build every component from the resolved configuration
    pub fn from_config(
        config: &GatewayConfig,
        pipeline: Arc<dyn TransformPipeline>,
        usage: Arc<dyn UsageRecorder>,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Self {
        let catalog: Arc<dyn ProviderCatalog> = Arc::new(config.catalog());
        let gate = Arc::new(KeyRotationGate::from_catalog(
            catalog.as_ref(),
            config.gate.clone(),
        ));
        let registry = Arc::new(StreamingSessionRegistry::new(config.streaming.clone()));
        let dispatcher = RequestDispatcher::new(
            catalog,
            Arc::clone(&gate),
            pipeline,
            usage,
            config.dispatch.clone(),
        )
        .with_registry(Arc::clone(&registry));
        let protocol = Arc::new(ProtocolSessionManager::new(
            connector,
            config.protocol.clone(),
        ));

        tracing::info!(
            providers = config.providers.len(),
            source = ?config.source(),
            "Gateway assembled"
        );

        Self {
            registry,
            gate,
            dispatcher,
            protocol,
            shutdown: CancellationToken::new(),
        }
    }

    /// Streaming session registry
    #[must_use]
    pub fn registry(&self) -> &Arc<StreamingSessionRegistry> {
        &self.registry
    }

    /// Credential gate
    #[must_use]
    pub fn gate(&self) -> &Arc<KeyRotationGate> {
        &self.gate
    }

    /// Request dispatcher
    #[must_use]
    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    /// Tool protocol session manager
    #[must_use]
    pub fn protocol(&self) -> &Arc<ProtocolSessionManager> {
        &self.protocol
    }

    /// Token cancelled by [`shutdown`](Self::shutdown)
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Create a streaming session with a fresh id
    #[must_use]
    pub fn open_stream(&self) -> String {
        let id = new_session_id();
        self.registry.create(&id);
        id
    }

    /// Dispatch one upstream call
    ///
    /// # Errors
    ///
    /// See [`RequestDispatcher::dispatch`].
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutcome> {
        self.dispatcher.dispatch(request).await
    }

    /// Spawn the sweeper and reaper; both stop on [`shutdown`](Self::shutdown)
    #[must_use]
    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        let registry = Arc::clone(&self.registry);
        let sweeper_token = self.shutdown.child_token();
        let sweeper = tokio::spawn(async move { registry.run_sweeper(sweeper_token).await });

        let protocol = Arc::clone(&self.protocol);
        let reaper_token = self.shutdown.child_token();
        let reaper = tokio::spawn(async move { protocol.run_reaper(reaper_token).await });

        tracing::debug!("Maintenance tasks started");
        vec![sweeper, reaper]
    }

    /// Stop maintenance and tear down every protocol session
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let closed = self.protocol.shutdown_all().await;
        tracing::info!(
            protocol_sessions = closed,
            stream_sessions = self.registry.len(),
            "Gateway shut down"
        );
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("registry", &self.registry)
            .field("gate", &self.gate)
            .field("protocol_sessions", &self.protocol.len())
            .finish_non_exhaustive()
    }
}
