//! Built-in Gateway Tools
//!
//! Every push session on the daemon socket is served by a [`GatewayTools`]
//! server, which exposes the gateway itself over the tool protocol:
//!
//! | Tool        | Arguments                               | Result                      |
//! |-------------|-----------------------------------------|-----------------------------|
//! | `chat`      | `target` (`provider,model`), `body`     | dispatch outcome            |
//! | `usage`     | none                                    | per-(provider, model) usage |
//! | `providers` | none                                    | credential slots per pool   |
//!
//! The connector is created before the gateway it serves (the gateway owns
//! the protocol manager that owns the connector), so it holds a weak handle
//! that is bound once the gateway exists.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use gateway_core::protocol::message::codes;
use gateway_core::{
    DispatchOutcome, DispatchRequest, Gateway, GatewayError, JsonRpcError, NamespacedId,
    ToolServer, UpstreamConnector, UsageCache,
};

/// Tool names and descriptions, as listed by `tools/list`
const TOOLS: &[(&str, &str)] = &[
    ("chat", "Dispatch a request body to a provider,model target"),
    ("usage", "Token usage totals per provider and model"),
    ("providers", "Credential slot state for every provider pool"),
];

/// Connects each new tool session to the gateway's own tools
pub struct GatewayConnector {
    gateway: OnceLock<Weak<Gateway>>,
    usage: Arc<UsageCache>,
}

impl GatewayConnector {
    /// Create an unbound connector
    pub fn new(usage: Arc<UsageCache>) -> Self {
        Self {
            gateway: OnceLock::new(),
            usage,
        }
    }

    /// Bind the gateway this connector serves; later calls are ignored
    pub fn bind(&self, gateway: &Arc<Gateway>) {
        if self.gateway.set(Arc::downgrade(gateway)).is_err() {
            debug!("Gateway connector already bound");
        }
    }
}

#[async_trait]
impl UpstreamConnector for GatewayConnector {
    async fn connect(&self, id: &NamespacedId) -> gateway_core::Result<Arc<dyn ToolServer>> {
        let gateway = self
            .gateway
            .get()
            .cloned()
            .ok_or_else(|| GatewayError::Internal("tool connector is not bound".to_string()))?;
        debug!(session = %id, "Tool session connected");
        Ok(Arc::new(GatewayTools {
            gateway,
            usage: Arc::clone(&self.usage),
        }))
    }

    async fn disconnect(&self, id: &NamespacedId) {
        debug!(session = %id, "Tool session disconnected");
    }
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct ChatArgs {
    target: String,
    #[serde(default)]
    body: Value,
    timeout_secs: Option<u64>,
}

/// Tool server for one session
pub struct GatewayTools {
    gateway: Weak<Gateway>,
    usage: Arc<UsageCache>,
}

impl GatewayTools {
    fn gateway(&self) -> Result<Arc<Gateway>, JsonRpcError> {
        self.gateway
            .upgrade()
            .ok_or_else(|| JsonRpcError::internal("gateway is shutting down"))
    }

    async fn chat(&self, arguments: Value) -> Result<Value, JsonRpcError> {
        let args: ChatArgs = serde_json::from_value(arguments).map_err(|e| {
            JsonRpcError::new(codes::INVALID_PARAMS, format!("invalid chat arguments: {e}"))
        })?;
        let body = if args.body.is_null() { json!({}) } else { args.body };

        let mut request = DispatchRequest::new(args.target, body);
        if let Some(secs) = args.timeout_secs {
            request = request.with_timeout(Duration::from_secs(secs));
        }

        let outcome = self
            .gateway()?
            .dispatch(request)
            .await
            .map_err(|e| JsonRpcError::from(&e))?;
        Ok(outcome_json(outcome))
    }

    fn usage(&self) -> Value {
        let entries: Vec<Value> = self
            .usage
            .snapshot()
            .into_iter()
            .map(|e| {
                json!({
                    "provider": e.provider,
                    "model": e.model,
                    "requests": e.requests,
                    "prompt_tokens": e.tokens.prompt_tokens,
                    "completion_tokens": e.tokens.completion_tokens,
                    "last_used": e.last_used.to_rfc3339(),
                })
            })
            .collect();
        json!({ "entries": entries })
    }

    fn providers(&self) -> Result<Value, JsonRpcError> {
        let gateway = self.gateway()?;
        let gate = gateway.gate();
        let pools: Vec<Value> = gate
            .providers()
            .into_iter()
            .map(|name| {
                let slots: Vec<Value> = gate
                    .snapshot(&name)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|s| {
                        json!({
                            "index": s.index,
                            "ceiling": s.ceiling,
                            "in_flight": s.in_flight,
                            "disabled": s.disabled,
                        })
                    })
                    .collect();
                json!({ "name": name, "slots": slots })
            })
            .collect();
        Ok(json!({ "providers": pools }))
    }
}

fn outcome_json(outcome: DispatchOutcome) -> Value {
    match outcome {
        DispatchOutcome::Complete(response) => json!({
            "body": response.body,
            "usage": response.usage,
        }),
        DispatchOutcome::Collected { chunks, usage } => json!({
            "chunks": chunks,
            "usage": usage,
        }),
        DispatchOutcome::Streamed {
            session_id,
            chunks,
            usage,
        } => json!({
            "session_id": session_id,
            "chunks": chunks,
            "usage": usage,
        }),
    }
}

#[async_trait]
impl ToolServer for GatewayTools {
    async fn initialize(&self, params: Value) -> Result<Value, JsonRpcError> {
        let version = params
            .get("protocolVersion")
            .cloned()
            .unwrap_or_else(|| json!("2024-11-05"));
        Ok(json!({
            "protocolVersion": version,
            "serverInfo": {
                "name": "llm-gateway",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": { "tools": {} },
        }))
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, JsonRpcError> {
        match method {
            "ping" => Ok(json!({})),
            "tools/list" => {
                let tools: Vec<Value> = TOOLS
                    .iter()
                    .map(|(name, description)| json!({ "name": name, "description": description }))
                    .collect();
                Ok(json!({ "tools": tools }))
            }
            "tools/call" => {
                let call: CallParams = serde_json::from_value(params).map_err(|e| {
                    JsonRpcError::new(codes::INVALID_PARAMS, format!("invalid tool call: {e}"))
                })?;
                match call.name.as_str() {
                    "chat" => self.chat(call.arguments).await,
                    "usage" => Ok(self.usage()),
                    "providers" => self.providers(),
                    other => Err(JsonRpcError::new(
                        codes::INVALID_PARAMS,
                        format!("unknown tool '{other}'"),
                    )),
                }
            }
            m if m.starts_with("notifications/") => Ok(Value::Null),
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::config::from_toml_str;
    use gateway_core::{
        PipelineOutput, ProviderRequest, Secret, TokenUsage, TransformPipeline, UpstreamError,
        UpstreamResponse, UsageRecorder,
    };

    struct EchoPipeline;

    #[async_trait]
    impl TransformPipeline for EchoPipeline {
        async fn send(
            &self,
            request: &ProviderRequest,
            _credential: &Secret,
        ) -> Result<PipelineOutput, UpstreamError> {
            Ok(PipelineOutput::Complete(UpstreamResponse {
                body: json!({ "echo": request.body, "model": request.model }),
                usage: TokenUsage::new(2, 5),
            }))
        }
    }

    fn setup() -> (Arc<Gateway>, Arc<GatewayConnector>) {
        let config = from_toml_str(
            r#"
            [[providers.openai.credentials]]
            secret = "sk-test"
            "#,
        )
        .unwrap();
        let usage = Arc::new(UsageCache::new());
        let connector = Arc::new(GatewayConnector::new(Arc::clone(&usage)));
        let gateway = Arc::new(Gateway::from_config(
            &config,
            Arc::new(EchoPipeline),
            usage as Arc<dyn UsageRecorder>,
            Arc::clone(&connector) as Arc<dyn UpstreamConnector>,
        ));
        connector.bind(&gateway);
        (gateway, connector)
    }

    async fn tools(connector: &GatewayConnector) -> Arc<dyn ToolServer> {
        let id = gateway_core::protocol::normalize_id("t", gateway_core::CarrierKind::Push);
        connector.connect(&id).await.unwrap()
    }

    #[tokio::test]
    async fn test_chat_then_usage() {
        let (_gateway, connector) = setup();
        let server = tools(&connector).await;

        let result = server
            .call(
                "tools/call",
                json!({ "name": "chat", "arguments": { "target": "openai,gpt-4o", "body": { "x": 1 } } }),
            )
            .await
            .unwrap();
        assert_eq!(result["body"]["model"], "gpt-4o");
        assert_eq!(result["usage"]["completion_tokens"], 5);

        let usage = server
            .call("tools/call", json!({ "name": "usage" }))
            .await
            .unwrap();
        assert_eq!(usage["entries"][0]["requests"], 1);
    }

    #[tokio::test]
    async fn test_chat_errors_carry_kind() {
        let (_gateway, connector) = setup();
        let server = tools(&connector).await;

        let err = server
            .call(
                "tools/call",
                json!({ "name": "chat", "arguments": { "target": "nope,model" } }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.data.unwrap()["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_providers_lists_slots() {
        let (_gateway, connector) = setup();
        let server = tools(&connector).await;
        let result = server
            .call("tools/call", json!({ "name": "providers" }))
            .await
            .unwrap();
        assert_eq!(result["providers"][0]["name"], "openai");
        assert_eq!(result["providers"][0]["slots"][0]["ceiling"], 1);
    }

    #[tokio::test]
    async fn test_unbound_connector_fails() {
        let connector = GatewayConnector::new(Arc::new(UsageCache::new()));
        let id = gateway_core::protocol::normalize_id("t", gateway_core::CarrierKind::Push);
        assert!(connector.connect(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (_gateway, connector) = setup();
        let server = tools(&connector).await;
        let err = server.call("resources/list", Value::Null).await.unwrap_err();
        assert_eq!(err.code, codes::METHOD_NOT_FOUND);
    }
}
