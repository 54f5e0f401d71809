//! Upstream Backends
//!
//! Collaborator traits for the provider transform pipeline and the usage
//! cache, plus a pass-through HTTP pipeline for OpenAI-compatible APIs.

pub mod http;
pub mod traits;

pub use http::{classify_status, HttpPipeline, SseItem, SseParser};
pub use traits::{
    ChunkReceiver, PipelineOutput, ProviderRequest, TokenUsage, TransformPipeline, UpstreamChunk,
    UpstreamResponse, UsageRecorder,
};
