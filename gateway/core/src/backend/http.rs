//! Pass-through HTTP pipeline
//!
//! POSTs the request body unchanged to `{base_url}/chat/completions` with a
//! bearer credential. Streamed responses are read as server-sent events:
//! every `data:` line becomes one chunk and `data: [DONE]` ends the stream.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use super::traits::{
    PipelineOutput, ProviderRequest, TokenUsage, TransformPipeline, UpstreamChunk,
    UpstreamResponse,
};
use crate::error::{GatewayError, UpstreamError};
use crate::routing::catalog::Secret;

/// Buffered chunks between the reader task and the dispatcher
const CHUNK_CHANNEL_CAPACITY: usize = 100;

/// Classify a non-success HTTP status
///
/// Auth failures (401, 403), payment required (402), and 429s that mention
/// quota or billing implicate the credential. Everything else is transient.
#[must_use]
pub fn classify_status(status: u16, body: &str) -> UpstreamError {
    let snippet: String = body.chars().take(200).collect();
    let message = format!("provider returned {status}: {snippet}");

    let lowered = body.to_lowercase();
    let quota = ["quota", "billing", "insufficient", "credit"]
        .iter()
        .any(|needle| lowered.contains(needle));

    let err = match status {
        401..=403 => UpstreamError::credential(message),
        429 if quota => UpstreamError::credential(message),
        _ => UpstreamError::transient(message),
    };
    err.with_status(status)
}

/// One decoded SSE item
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseItem {
    /// A `data:` payload
    Data(String),
    /// The `[DONE]` sentinel
    Done,
}

/// Incremental SSE `data:` line parser
///
/// Buffers raw bytes and decodes only complete lines, so a multi-byte
/// character split across network chunks is reassembled intact.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    /// Create an empty parser
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every complete item
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseItem> {
        self.buffer.extend_from_slice(bytes);

        let mut items = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                items.push(SseItem::Done);
            } else if !data.is_empty() {
                items.push(SseItem::Data(data.to_string()));
            }
        }
        items
    }
}

/// HTTP transform pipeline for OpenAI-compatible providers
#[derive(Clone, Debug)]
pub struct HttpPipeline {
    client: reqwest::Client,
}

impl HttpPipeline {
    /// Create a pipeline
    ///
    /// # Errors
    ///
    /// `Internal` if the HTTP client cannot be built.
    pub fn new(connect_timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn endpoint(base_url: &str) -> String {
        format!("{}/chat/completions", base_url.trim_end_matches('/'))
    }

    fn spawn_reader(response: reqwest::Response) -> super::traits::ChunkReceiver {
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let mut stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut parser = SseParser::new();
            while let Some(next) = stream.next().await {
                let bytes = match next {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(Err(UpstreamError::transient(format!("stream interrupted: {e}"))))
                            .await;
                        return;
                    }
                };

                for item in parser.push(&bytes) {
                    let chunk = match item {
                        SseItem::Done => return,
                        SseItem::Data(data) => {
                            let usage = serde_json::from_str::<Value>(&data)
                                .ok()
                                .and_then(|v| TokenUsage::from_json(&v));
                            UpstreamChunk { data, usage }
                        }
                    };
                    if tx.send(Ok(chunk)).await.is_err() {
                        // Dispatcher went away (cancelled or timed out)
                        return;
                    }
                }
            }
        });

        rx
    }
}

#[async_trait]
impl TransformPipeline for HttpPipeline {
    async fn send(
        &self,
        request: &ProviderRequest,
        credential: &Secret,
    ) -> Result<PipelineOutput, UpstreamError> {
        let base_url = request.base_url.as_deref().ok_or_else(|| {
            UpstreamError::transient(format!("provider '{}' has no base_url", request.provider))
        })?;

        let mut body = request.body.clone();
        if let Value::Object(ref mut map) = body {
            map.entry("model")
                .or_insert_with(|| Value::String(request.model.clone()));
            if request.stream {
                map.insert("stream".to_string(), Value::Bool(true));
            }
        }

        tracing::debug!(
            provider = %request.provider,
            model = %request.model,
            stream = request.stream,
            "Sending upstream request"
        );

        let response = self
            .client
            .post(Self::endpoint(base_url))
            .bearer_auth(credential.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| UpstreamError::transient(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &text));
        }

        if request.stream {
            return Ok(PipelineOutput::Stream(Self::spawn_reader(response)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| UpstreamError::transient(format!("malformed response body: {e}")))?;
        let usage = TokenUsage::from_json(&body).unwrap_or_default();
        Ok(PipelineOutput::Complete(UpstreamResponse { body, usage }))
    }
}
