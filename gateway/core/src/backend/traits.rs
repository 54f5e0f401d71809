//! Upstream Collaborator Traits
//!
//! The dispatcher never speaks a provider's wire format itself. It hands a
//! [`ProviderRequest`] and a leased secret to a [`TransformPipeline`], which
//! answers with either a stream of chunks or one complete response, and it
//! reports token counts to a [`UsageRecorder`].

use std::ops::AddAssign;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::UpstreamError;
use crate::routing::catalog::Secret;

/// Token counts for one upstream call
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u64,
    /// Tokens generated
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Create a usage record
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Prompt plus completion
    #[must_use]
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Read a `usage` object from a response or chunk
    ///
    /// Accepts both `prompt_tokens`/`completion_tokens` and
    /// `input_tokens`/`output_tokens` spellings.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        let usage = value.get("usage")?;
        let field = |a: &str, b: &str| {
            usage
                .get(a)
                .or_else(|| usage.get(b))
                .and_then(Value::as_u64)
                .unwrap_or(0)
        };
        Some(Self {
            prompt_tokens: field("prompt_tokens", "input_tokens"),
            completion_tokens: field("completion_tokens", "output_tokens"),
        })
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
    }
}

/// A request addressed to one provider and model
#[derive(Clone, Debug)]
pub struct ProviderRequest {
    /// Provider name
    pub provider: String,
    /// Model name
    pub model: String,
    /// Provider base URL, from the catalog
    pub base_url: Option<String>,
    /// Request body, passed through
    pub body: Value,
    /// Whether a streamed response is wanted
    pub stream: bool,
}

/// One streamed chunk
#[derive(Clone, Debug, PartialEq)]
pub struct UpstreamChunk {
    /// Chunk payload, passed through to subscribers
    pub data: String,
    /// Usage reported in this chunk, if any
    pub usage: Option<TokenUsage>,
}

impl UpstreamChunk {
    /// A chunk without usage
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            usage: None,
        }
    }
}

/// A complete (non-streamed) response
#[derive(Clone, Debug, PartialEq)]
pub struct UpstreamResponse {
    /// Response body
    pub body: Value,
    /// Usage reported by the provider
    pub usage: TokenUsage,
}

/// Receiving half of a streamed response
pub type ChunkReceiver = mpsc::Receiver<Result<UpstreamChunk, UpstreamError>>;

/// What the pipeline hands back
#[derive(Debug)]
pub enum PipelineOutput {
    /// Chunks in arrival order; the channel closes at end of stream
    Stream(ChunkReceiver),
    /// A complete response
    Complete(UpstreamResponse),
}

/// Provider request/response transform pipeline
#[async_trait]
pub trait TransformPipeline: Send + Sync {
    /// Send `request` upstream, authenticated with `credential`
    ///
    /// # Errors
    ///
    /// Failures before any response data arrives, classified as transient or
    /// credential-fatal.
    async fn send(
        &self,
        request: &ProviderRequest,
        credential: &Secret,
    ) -> Result<PipelineOutput, UpstreamError>;
}

/// Usage-cache collaborator
pub trait UsageRecorder: Send + Sync {
    /// Record one call's token counts
    fn record(&self, provider: &str, model: &str, usage: TokenUsage);
}
