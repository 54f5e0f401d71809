//! Gateway Core - Sessions, Transport and Dispatch for the LLM Gateway
//!
//! This crate is the stateful middle of the gateway: everything between a
//! front door (HTTP, SSE, push sockets) and the upstream provider APIs. It
//! has no listener of its own; front doors drive it through the [`Gateway`]
//! facade or the individual components.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Front doors                             │
//! │     chat completions (HTTP/SSE)         tool protocol (push/req) │
//! └───────────────┬───────────────────────────────────┬──────────────┘
//!                 │                                   │
//! ┌───────────────┼───────────────────────────────────┼──────────────┐
//! │               v            GATEWAY CORE           v              │
//! │  ┌────────────────────┐                ┌─────────────────────┐   │
//! │  │ RequestDispatcher  │──chunks──┐     │ ProtocolSession     │   │
//! │  └─────────┬──────────┘          │     │ Manager             │   │
//! │            │                     v     └──────────┬──────────┘   │
//! │  ┌─────────┴──────────┐  ┌──────────────────────┐ │              │
//! │  │ KeyRotationGate    │  │ StreamingSession     │ │              │
//! │  │ (credential pools) │  │ Registry (replay)    │ │              │
//! │  └─────────┬──────────┘  └──────────────────────┘ │              │
//! └────────────┼──────────────────────────────────────┼──────────────┘
//!              v                                      v
//!      TransformPipeline                      UpstreamConnector
//!      (provider APIs)                        (tool servers)
//! ```
//!
//! # Module Overview
//!
//! - [`streaming`]: Push-based stream sessions with replay and timed eviction
//! - [`protocol`]: JSON-RPC tool sessions over push and request carriers
//! - [`routing`]: Provider catalog, credential gate, request dispatcher
//! - [`backend`]: Collaborator traits and the pass-through HTTP pipeline
//! - [`usage`]: In-memory token usage totals
//! - [`config`]: TOML/env/CLI configuration loading
//! - [`error`]: The single error type and its stable kind tags
//! - [`gateway`]: The composed core and its maintenance tasks

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod routing;
pub mod streaming;
pub mod usage;

// Re-exports for convenience
pub use backend::{
    HttpPipeline, PipelineOutput, ProviderRequest, TokenUsage, TransformPipeline, UpstreamChunk,
    UpstreamResponse, UsageRecorder,
};
pub use config::{
    load_config, load_config_from_path, ConfigError, ConfigOverrides, ConfigSource, GatewayConfig,
};
pub use error::{ErrorKind, GatewayError, Result, UpstreamError, UpstreamErrorClass};
pub use gateway::Gateway;
pub use protocol::{
    ByteSink, CarrierKind, JsonRpcError, JsonRpcMessage, NamespacedId, ProtocolConfig,
    ProtocolSessionManager, ToolServer, UpstreamConnector,
};
pub use routing::{
    AcquirePolicy, CredentialLease, DispatchOutcome, DispatchRequest, Enablement,
    KeyRotationGate, ProviderCatalog, RequestDispatcher, Secret, StaticCatalog,
};
pub use streaming::{
    EventSink, RegistryConfig, SequencedEvent, StreamEvent, StreamingSessionRegistry,
};
pub use usage::{UsageCache, UsageEntry};
