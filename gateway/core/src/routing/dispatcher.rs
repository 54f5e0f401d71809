//! Request Dispatcher
//!
//! The single entry point for upstream LLM calls:
//!
//! 1. Parse the `provider,model` target
//! 2. One policy lookup: provider known, model served, provider enabled
//! 3. Lease a credential from the [`KeyRotationGate`]
//! 4. Send through the [`TransformPipeline`]
//! 5. Forward chunks into the bound streaming session, if any
//! 6. Release the lease and record usage on every exit path
//!
//! Steps 3 to 6 run under the caller's timeout and cancellation token. When
//! either fires, the in-flight future is dropped; the [`CallGuard`] it owns
//! releases the lease and records usage from its own `Drop`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::catalog::{Enablement, ProviderCatalog};
use super::gate::{CredentialLease, KeyRotationGate};
use crate::backend::{
    PipelineOutput, ProviderRequest, TokenUsage, TransformPipeline, UpstreamResponse,
    UsageRecorder,
};
use crate::error::{ErrorKind, GatewayError, Result};
use crate::streaming::{StreamEvent, StreamingSessionRegistry};

// ============================================================================
// Requests and outcomes
// ============================================================================

/// Dispatcher configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Timeout applied when the request does not carry one
    pub default_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// A parsed `provider,model` target
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelTarget {
    /// Provider name
    pub provider: String,
    /// Model name
    pub model: String,
}

impl ModelTarget {
    /// Parse `provider,model`
    ///
    /// # Errors
    ///
    /// `Validation` if the comma is missing or either side is empty.
    pub fn parse(raw: &str) -> Result<Self> {
        let (provider, model) = raw.split_once(',').ok_or_else(|| {
            GatewayError::Validation(format!("target '{raw}' is not of the form provider,model"))
        })?;
        let (provider, model) = (provider.trim(), model.trim());
        if provider.is_empty() || model.is_empty() {
            return Err(GatewayError::Validation(format!(
                "target '{raw}' has an empty provider or model"
            )));
        }
        Ok(Self {
            provider: provider.to_string(),
            model: model.to_string(),
        })
    }
}

impl std::fmt::Display for ModelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.provider, self.model)
    }
}

/// One upstream call
#[derive(Clone, Debug)]
pub struct DispatchRequest {
    /// Composite `provider,model` target
    pub target: String,
    /// Request body, passed through to the pipeline
    pub body: Value,
    /// Streaming session to forward chunks into
    pub stream_session: Option<String>,
    /// Caller deadline for acquire plus upstream work
    pub timeout: Option<Duration>,
    /// Caller cancellation
    pub cancel: Option<CancellationToken>,
}

impl DispatchRequest {
    /// Create a request
    pub fn new(target: impl Into<String>, body: Value) -> Self {
        Self {
            target: target.into(),
            body,
            stream_session: None,
            timeout: None,
            cancel: None,
        }
    }

    /// Builder: stream into a registry session
    #[must_use]
    pub fn with_stream_session(mut self, session_id: impl Into<String>) -> Self {
        self.stream_session = Some(session_id.into());
        self
    }

    /// Builder: set the caller deadline
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builder: attach a cancellation token
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Successful dispatch result
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchOutcome {
    /// Chunks were forwarded into the streaming session
    Streamed {
        /// Session the chunks went to
        session_id: String,
        /// Number of chunks forwarded
        chunks: u64,
        /// Usage reported by the provider
        usage: TokenUsage,
    },
    /// Streamed with no session bound; chunks in arrival order
    Collected {
        /// Chunk payloads
        chunks: Vec<String>,
        /// Usage reported by the provider
        usage: TokenUsage,
    },
    /// A complete response
    Complete(UpstreamResponse),
}

// ============================================================================
// Call guard
// ============================================================================

/// Owns the lease for one upstream call
///
/// Dropping the guard, for any reason, records usage and then releases.
struct CallGuard<'a> {
    gate: &'a KeyRotationGate,
    usage: &'a dyn UsageRecorder,
    lease: CredentialLease,
    target: &'a ModelTarget,
    reported: TokenUsage,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.usage
            .record(&self.target.provider, &self.target.model, self.reported);
        self.gate.release(&self.lease);
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Validates, gates, and forwards upstream calls
pub struct RequestDispatcher {
    catalog: Arc<dyn ProviderCatalog>,
    gate: Arc<KeyRotationGate>,
    pipeline: Arc<dyn TransformPipeline>,
    usage: Arc<dyn UsageRecorder>,
    registry: Option<Arc<StreamingSessionRegistry>>,
    config: DispatcherConfig,
}

impl RequestDispatcher {
    /// Create a dispatcher without streaming support
    pub fn new(
        catalog: Arc<dyn ProviderCatalog>,
        gate: Arc<KeyRotationGate>,
        pipeline: Arc<dyn TransformPipeline>,
        usage: Arc<dyn UsageRecorder>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            catalog,
            gate,
            pipeline,
            usage,
            registry: None,
            config,
        }
    }

    /// Builder: forward streamed chunks into `registry`
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<StreamingSessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// The gate this dispatcher leases from
    #[must_use]
    pub fn gate(&self) -> &Arc<KeyRotationGate> {
        &self.gate
    }

    /// Centralized provider policy: known, serves the model, enabled
    ///
    /// # Errors
    ///
    /// `ProviderNotFound`, `ModelNotFound`, or `Forbidden`.
    pub fn check_policy(&self, target: &ModelTarget) -> Result<()> {
        let provider = &target.provider;
        if !self.catalog.contains(provider) {
            return Err(GatewayError::ProviderNotFound(provider.clone()));
        }
        if !self.catalog.supports_model(provider, &target.model) {
            return Err(GatewayError::ModelNotFound {
                provider: provider.clone(),
                model: target.model.clone(),
            });
        }

        let enablement = self.catalog.enablement(provider);
        if !enablement.is_enabled() {
            return Err(GatewayError::Forbidden(provider.clone()));
        }
        if let Enablement::Other(raw) = &enablement {
            tracing::debug!(provider = %provider, value = %raw, "Non-boolean enabled flag, treating provider as enabled");
        }
        Ok(())
    }

    /// Run one upstream call end to end
    ///
    /// A bound streaming session is always closed when this returns: with
    /// `Done` on success, or an error event followed by `Done` on failure.
    ///
    /// # Errors
    ///
    /// Any [`GatewayError`]; see the module documentation for the mapping.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutcome> {
        let DispatchRequest {
            target,
            body,
            stream_session,
            timeout,
            cancel,
        } = request;

        let cancel = cancel.unwrap_or_default();
        let timeout = timeout.or(self.config.default_timeout);
        if let (Some(registry), Some(id)) = (&self.registry, &stream_session) {
            registry.bind_cancellation(id, cancel.clone());
        }

        let result = self
            .dispatch_inner(&target, body, stream_session.as_deref(), &cancel, timeout)
            .await;

        if let Err(ref err) = result {
            Self::log_failure(&target, err);
        }
        if let (Some(registry), Some(id)) = (&self.registry, &stream_session) {
            if let Err(ref err) = result {
                registry.push(id, StreamEvent::error(err));
            }
            registry.close(id);
        }
        result
    }

    fn log_failure(target: &str, err: &GatewayError) {
        match err.kind() {
            ErrorKind::NotFound | ErrorKind::Cancelled => {
                tracing::debug!(target_model = %target, kind = %err.kind(), error = %err, "Dispatch ended");
            }
            kind => {
                tracing::warn!(target_model = %target, kind = %kind, error = %err, "Dispatch failed");
            }
        }
    }

    async fn dispatch_inner(
        &self,
        raw_target: &str,
        body: Value,
        stream_session: Option<&str>,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<DispatchOutcome> {
        let target = ModelTarget::parse(raw_target)?;
        if stream_session.is_some() && self.registry.is_none() {
            return Err(GatewayError::Validation(
                "stream session given but streaming is not enabled".to_string(),
            ));
        }
        self.check_policy(&target)?;

        let work = self.acquire_and_call(&target, body, stream_session);
        let bounded = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::Timeout(limit)),
                },
                None => work.await,
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(GatewayError::Cancelled),
            result = bounded => result,
        }
    }

    async fn acquire_and_call(
        &self,
        target: &ModelTarget,
        body: Value,
        stream_session: Option<&str>,
    ) -> Result<DispatchOutcome> {
        let lease = self.gate.acquire(&target.provider).await?;
        tracing::debug!(
            provider = %target.provider,
            model = %target.model,
            slot = lease.slot_index(),
            "Credential leased"
        );

        let mut guard = CallGuard {
            gate: &self.gate,
            usage: self.usage.as_ref(),
            lease,
            target,
            reported: TokenUsage::default(),
        };

        let wants_stream = stream_session.is_some()
            || body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let request = ProviderRequest {
            provider: target.provider.clone(),
            model: target.model.clone(),
            base_url: self.catalog.base_url(&target.provider),
            body,
            stream: wants_stream,
        };

        let output = match self.pipeline.send(&request, guard.lease.secret()).await {
            Ok(output) => output,
            Err(e) => {
                self.gate.on_upstream_error(&guard.lease, &e);
                return Err(e.into());
            }
        };

        match output {
            PipelineOutput::Complete(response) => {
                guard.reported = response.usage;
                if let (Some(registry), Some(id)) = (&self.registry, stream_session) {
                    registry.push(id, StreamEvent::data(response.body.to_string()));
                }
                Ok(DispatchOutcome::Complete(response))
            }
            PipelineOutput::Stream(mut rx) => {
                let mut forwarded = 0u64;
                let mut collected = Vec::new();

                while let Some(item) = rx.recv().await {
                    let chunk = match item {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            self.gate.on_upstream_error(&guard.lease, &e);
                            return Err(e.into());
                        }
                    };
                    if let Some(usage) = chunk.usage {
                        guard.reported = usage;
                    }
                    match (&self.registry, stream_session) {
                        (Some(registry), Some(id)) => {
                            registry.push(id, StreamEvent::data(chunk.data));
                            forwarded += 1;
                        }
                        _ => collected.push(chunk.data),
                    }
                }

                let usage = guard.reported;
                Ok(match stream_session {
                    Some(id) => DispatchOutcome::Streamed {
                        session_id: id.to_string(),
                        chunks: forwarded,
                        usage,
                    },
                    None => DispatchOutcome::Collected {
                        chunks: collected,
                        usage,
                    },
                })
            }
        }
    }
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("gate", &self.gate)
            .field("streaming", &self.registry.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::UpstreamChunk;
    use crate::error::UpstreamError;
    use crate::routing::catalog::{ProviderConfig, Secret, StaticCatalog};
    use crate::routing::gate::{AcquirePolicy, GateConfig};
    use crate::streaming::{EventSink, RegistryConfig};
    use crate::usage::UsageCache;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    enum Script {
        Chunks(Vec<&'static str>, Option<TokenUsage>),
        Complete(Value),
        Fail(UpstreamError),
        FailMidStream(UpstreamError),
        Hang,
    }

    #[derive(Default)]
    struct ScriptedPipeline {
        script: Mutex<VecDeque<Script>>,
        held: Mutex<Vec<mpsc::Sender<std::result::Result<UpstreamChunk, UpstreamError>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedPipeline {
        fn with(script: Script) -> Arc<Self> {
            let pipeline = Self::default();
            pipeline.script.lock().push_back(script);
            Arc::new(pipeline)
        }
    }

    #[async_trait]
    impl TransformPipeline for ScriptedPipeline {
        async fn send(
            &self,
            request: &ProviderRequest,
            credential: &Secret,
        ) -> std::result::Result<PipelineOutput, UpstreamError> {
            self.calls
                .lock()
                .push(format!("{}:{}", request.model, credential.expose()));
            let next = self.script.lock().pop_front();
            match next.unwrap_or(Script::Complete(json!({}))) {
                Script::Complete(body) => Ok(PipelineOutput::Complete(UpstreamResponse {
                    usage: TokenUsage::new(3, 4),
                    body,
                })),
                Script::Fail(e) => Err(e),
                Script::Chunks(chunks, usage) => {
                    let (tx, rx) = mpsc::channel(16);
                    let last = chunks.len().saturating_sub(1);
                    for (i, data) in chunks.into_iter().enumerate() {
                        let mut chunk = UpstreamChunk::new(data);
                        if i == last {
                            chunk.usage = usage;
                        }
                        tx.try_send(Ok(chunk)).unwrap();
                    }
                    Ok(PipelineOutput::Stream(rx))
                }
                Script::FailMidStream(e) => {
                    let (tx, rx) = mpsc::channel(16);
                    tx.try_send(Ok(UpstreamChunk::new("partial"))).unwrap();
                    tx.try_send(Err(e)).unwrap();
                    Ok(PipelineOutput::Stream(rx))
                }
                Script::Hang => {
                    let (tx, rx) = mpsc::channel(16);
                    self.held.lock().push(tx);
                    Ok(PipelineOutput::Stream(rx))
                }
            }
        }
    }

    struct Fixture {
        dispatcher: RequestDispatcher,
        gate: Arc<KeyRotationGate>,
        registry: Arc<StreamingSessionRegistry>,
        usage: Arc<UsageCache>,
    }

    fn fixture(pipeline: Arc<ScriptedPipeline>, policy: AcquirePolicy) -> Fixture {
        let catalog = Arc::new(
            StaticCatalog::new()
                .with_provider(
                    "openai",
                    ProviderConfig::default()
                        .with_model("gpt-4o")
                        .with_credential("k0", 1)
                        .with_credential("k1", 1),
                )
                .with_provider("unset", ProviderConfig::default().with_credential("u0", 1))
                .with_provider(
                    "off",
                    ProviderConfig::default()
                        .with_enabled(false)
                        .with_credential("x0", 1),
                ),
        );
        let gate = Arc::new(KeyRotationGate::from_catalog(
            catalog.as_ref(),
            GateConfig {
                policy,
                retry_after: Duration::from_millis(100),
            },
        ));
        let registry = Arc::new(StreamingSessionRegistry::new(RegistryConfig::default()));
        let usage = Arc::new(UsageCache::new());
        let dispatcher = RequestDispatcher::new(
            catalog,
            Arc::clone(&gate),
            pipeline,
            Arc::clone(&usage) as Arc<dyn UsageRecorder>,
            DispatcherConfig::default(),
        )
        .with_registry(Arc::clone(&registry));

        Fixture {
            dispatcher,
            gate,
            registry,
            usage,
        }
    }

    fn in_flight(gate: &KeyRotationGate, provider: &str) -> u32 {
        gate.snapshot(provider)
            .unwrap()
            .iter()
            .map(|s| s.in_flight)
            .sum()
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!(
            ModelTarget::parse("openai, gpt-4o").unwrap(),
            ModelTarget {
                provider: "openai".to_string(),
                model: "gpt-4o".to_string()
            }
        );
        assert!(ModelTarget::parse("openai").is_err());
        assert!(ModelTarget::parse(",gpt-4o").is_err());
        assert!(ModelTarget::parse("openai, ").is_err());
    }

    #[tokio::test]
    async fn test_malformed_target_is_validation() {
        let f = fixture(ScriptedPipeline::with(Script::Complete(json!({}))), AcquirePolicy::Queue);
        let err = f
            .dispatcher
            .dispatch(DispatchRequest::new("gpt-4o", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(f.usage.request_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_provider_and_model_are_not_found() {
        let f = fixture(ScriptedPipeline::with(Script::Complete(json!({}))), AcquirePolicy::Queue);
        let err = f
            .dispatcher
            .dispatch(DispatchRequest::new("mistral,large", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ProviderNotFound(_)));

        let err = f
            .dispatcher
            .dispatch(DispatchRequest::new("openai,gpt-2", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ModelNotFound { .. }));
    }

    #[tokio::test]
    async fn test_disabled_provider_is_forbidden_without_side_effects() {
        let f = fixture(ScriptedPipeline::with(Script::Complete(json!({}))), AcquirePolicy::Queue);
        let err = f
            .dispatcher
            .dispatch(DispatchRequest::new("off,any", json!({})))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert_eq!(f.gate.stats("off").unwrap().acquires, 0);
        assert_eq!(f.usage.request_count(), 0);
    }

    #[tokio::test]
    async fn test_unset_enablement_is_enabled() {
        let f = fixture(ScriptedPipeline::with(Script::Complete(json!({"ok": 1}))), AcquirePolicy::Queue);
        let outcome = f
            .dispatcher
            .dispatch(DispatchRequest::new("unset,whatever", json!({})))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Complete(_)));
        assert_eq!(f.usage.get("unset", "whatever").unwrap().tokens, TokenUsage::new(3, 4));
        assert_eq!(in_flight(&f.gate, "unset"), 0);
    }

    #[tokio::test]
    async fn test_streams_into_session_and_closes_it() {
        let pipeline = ScriptedPipeline::with(Script::Chunks(
            vec!["a", "b", "c"],
            Some(TokenUsage::new(10, 3)),
        ));
        let f = fixture(pipeline, AcquirePolicy::Queue);
        f.registry.create("s1");
        let (sink, mut rx) = EventSink::channel();
        f.registry.attach("s1", sink);

        let outcome = f
            .dispatcher
            .dispatch(DispatchRequest::new("openai,gpt-4o", json!({})).with_stream_session("s1"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Streamed {
                session_id: "s1".to_string(),
                chunks: 3,
                usage: TokenUsage::new(10, 3),
            }
        );

        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e.event);
        }
        assert_eq!(
            events,
            vec![
                StreamEvent::data("a"),
                StreamEvent::data("b"),
                StreamEvent::data("c"),
                StreamEvent::Done
            ]
        );
        assert_eq!(in_flight(&f.gate, "openai"), 0);
        assert_eq!(f.usage.get("openai", "gpt-4o").unwrap().tokens.total(), 13);
    }

    #[tokio::test]
    async fn test_stream_without_session_is_collected() {
        let pipeline = ScriptedPipeline::with(Script::Chunks(vec!["x", "y"], None));
        let f = fixture(pipeline, AcquirePolicy::Queue);
        let outcome = f
            .dispatcher
            .dispatch(DispatchRequest::new("openai,gpt-4o", json!({"stream": true})))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Collected {
                chunks: vec!["x".to_string(), "y".to_string()],
                usage: TokenUsage::default(),
            }
        );
    }

    #[tokio::test]
    async fn test_credential_fatal_error_disables_and_releases() {
        let pipeline = ScriptedPipeline::with(Script::Fail(
            UpstreamError::credential("invalid key").with_status(401),
        ));
        let f = fixture(Arc::clone(&pipeline), AcquirePolicy::Queue);
        f.registry.create("s1");

        let err = f
            .dispatcher
            .dispatch(DispatchRequest::new("openai,gpt-4o", json!({})).with_stream_session("s1"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UpstreamCredential);
        let snapshot = f.gate.snapshot("openai").unwrap();
        assert!(snapshot[0].disabled);
        assert!(!snapshot[1].disabled);
        assert_eq!(in_flight(&f.gate, "openai"), 0);
        assert_eq!(f.usage.get("openai", "gpt-4o").unwrap().requests, 1);

        let (sink, mut rx) = EventSink::channel();
        f.registry.attach("s1", sink);
        let first = rx.recv().await.unwrap().event;
        assert!(matches!(first, StreamEvent::Error { kind: ErrorKind::UpstreamCredential, .. }));
        assert_eq!(rx.recv().await.unwrap().event, StreamEvent::Done);

        // Next call rotates onto the surviving credential
        f.dispatcher
            .dispatch(DispatchRequest::new("openai,gpt-4o", json!({})))
            .await
            .unwrap();
        assert_eq!(pipeline.calls.lock().last().unwrap(), "gpt-4o:k1");
    }

    #[tokio::test]
    async fn test_mid_stream_transient_error_keeps_credential() {
        let pipeline = ScriptedPipeline::with(Script::FailMidStream(UpstreamError::transient("reset")));
        let f = fixture(pipeline, AcquirePolicy::Queue);
        f.registry.create("s1");

        let err = f
            .dispatcher
            .dispatch(DispatchRequest::new("openai,gpt-4o", json!({})).with_stream_session("s1"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(f.gate.snapshot("openai").unwrap().iter().all(|s| !s.disabled));
        // partial chunk, error event, done
        assert_eq!(f.registry.info("s1").unwrap().events, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_and_closes() {
        let f = fixture(ScriptedPipeline::with(Script::Hang), AcquirePolicy::Queue);
        f.registry.create("s1");

        let err = f
            .dispatcher
            .dispatch(
                DispatchRequest::new("openai,gpt-4o", json!({}))
                    .with_stream_session("s1")
                    .with_timeout(Duration::from_secs(5)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Timeout(_)));
        assert_eq!(in_flight(&f.gate, "openai"), 0);
        assert!(f.registry.info("s1").unwrap().closed);
        assert_eq!(f.usage.request_count(), 1);
    }

    #[tokio::test]
    async fn test_registry_cancel_aborts_dispatch() {
        let f = fixture(ScriptedPipeline::with(Script::Hang), AcquirePolicy::Queue);
        f.registry.create("s1");
        let registry = Arc::clone(&f.registry);

        let canceller = tokio::spawn(async move {
            // Wait until the dispatcher has bound its token
            while !registry.cancel("s1") {
                tokio::task::yield_now().await;
            }
        });

        let err = f
            .dispatcher
            .dispatch(DispatchRequest::new("openai,gpt-4o", json!({})).with_stream_session("s1"))
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(!err.is_failure());
        assert_eq!(in_flight(&f.gate, "openai"), 0);
        assert!(f.registry.info("s1").unwrap().closed);
    }

    #[tokio::test]
    async fn test_fail_fast_exhaustion_records_nothing() {
        let f = fixture(ScriptedPipeline::with(Script::Hang), AcquirePolicy::FailFast);
        let _a = f.gate.acquire("unset").await.unwrap();

        let err = f
            .dispatcher
            .dispatch(DispatchRequest::new("unset,m", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(err.retry_after(), Some(Duration::from_millis(100)));
        assert_eq!(f.usage.request_count(), 0);
    }
}
