//! JSON-RPC 2.0 envelope
//!
//! The tool protocol speaks JSON-RPC over both carriers. This module only
//! validates and builds envelopes; method semantics belong to the
//! [`ToolServer`](super::ToolServer).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GatewayError, Result};

/// Method name of the protocol handshake
pub const INITIALIZE: &str = "initialize";

/// Protocol version string required in every envelope
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes
pub mod codes {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// JSON-RPC error object
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("JSON-RPC error {code}: {message}")]
pub struct JsonRpcError {
    /// Error code
    pub code: i64,
    /// Short description
    pub message: String,
    /// Additional information
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create an error object
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// `method not found` for `method`
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("method '{method}' not found"))
    }

    /// `internal error` with a description
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }
}

impl From<&GatewayError> for JsonRpcError {
    fn from(err: &GatewayError) -> Self {
        let code = match err {
            GatewayError::Validation(_) => codes::INVALID_REQUEST,
            _ => codes::INTERNAL_ERROR,
        };
        Self {
            code,
            message: err.to_string(),
            data: Some(serde_json::json!({ "kind": err.kind() })),
        }
    }
}

/// A JSON-RPC request, notification, or response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    /// Must be `"2.0"`
    pub jsonrpc: String,
    /// Correlation id; absent for notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Method name (requests and notifications)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Method parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Success payload (responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload (responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    fn empty() -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    /// A request expecting a response
    pub fn request(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Some(id.into()),
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    /// A notification (no response expected)
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    /// A success response
    #[must_use]
    pub fn response(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            ..Self::empty()
        }
    }

    /// A failure response
    #[must_use]
    pub fn error_response(id: Option<Value>, error: JsonRpcError) -> Self {
        Self {
            id,
            error: Some(error),
            ..Self::empty()
        }
    }

    /// Parse and validate raw bytes
    ///
    /// # Errors
    ///
    /// `Validation` if the bytes are not JSON or not a valid envelope.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let msg: Self = serde_json::from_slice(bytes)
            .map_err(|e| GatewayError::Validation(format!("malformed JSON-RPC message: {e}")))?;
        msg.validate()?;
        Ok(msg)
    }

    /// Check the envelope shape
    ///
    /// # Errors
    ///
    /// `Validation` for a wrong version tag, a message that is both a call and
    /// a response, or a response without an id.
    pub fn validate(&self) -> Result<()> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(GatewayError::Validation(format!(
                "unsupported jsonrpc version '{}'",
                self.jsonrpc
            )));
        }
        let is_response = self.result.is_some() || self.error.is_some();
        match (&self.method, is_response) {
            (Some(_), true) => Err(GatewayError::Validation(
                "message cannot carry both a method and a result".to_string(),
            )),
            (None, false) => Err(GatewayError::Validation(
                "message has neither a method nor a result".to_string(),
            )),
            (None, true) if self.id.is_none() => Err(GatewayError::Validation(
                "response is missing its id".to_string(),
            )),
            (Some(m), false) if m.is_empty() => {
                Err(GatewayError::Validation("method name is empty".to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Whether this is a call without an id
    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    /// Whether this is a response
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.method.is_none()
    }

    /// Whether this is the handshake call
    #[must_use]
    pub fn is_initialize(&self) -> bool {
        self.method.as_deref() == Some(INITIALIZE)
    }
}
