//! Gateway Error Taxonomy
//!
//! Every failure surfaced by the core carries a stable [`ErrorKind`] tag so
//! front doors can map it to their own status codes without string matching.
//!
//! | Kind                  | Retry? | Typical source                          |
//! |-----------------------|--------|-----------------------------------------|
//! | `validation`          | never  | malformed `provider,model`, bad JSON-RPC |
//! | `not_found`           | never  | unknown provider / model / session      |
//! | `forbidden`           | never  | provider explicitly disabled            |
//! | `resource_exhausted`  | after hint | no credential headroom (fail-fast)  |
//! | `upstream_transient`  | yes    | network blip, 5xx                       |
//! | `upstream_credential` | rotate | auth failure, quota exhausted           |
//! | `cancelled`           | n/a    | client disconnect or explicit abort     |
//! | `timeout`             | yes    | caller deadline expired                 |
//! | `internal`            | no     | collaborator or sink failure            |

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, serializable tag for a [`GatewayError`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input, rejected immediately
    Validation,
    /// Unknown provider, model, or session
    NotFound,
    /// Provider explicitly disabled
    Forbidden,
    /// No credential headroom under the fail-fast policy
    ResourceExhausted,
    /// Upstream failure that does not implicate the credential
    UpstreamTransient,
    /// Upstream rejected the credential itself (auth or quota)
    UpstreamCredential,
    /// Client disconnect or explicit abort
    Cancelled,
    /// Caller-supplied deadline expired
    Timeout,
    /// Collaborator or transport failure inside the gateway
    Internal,
}

impl ErrorKind {
    /// The wire tag for this kind
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::ResourceExhausted => "resource_exhausted",
            Self::UpstreamTransient => "upstream_transient",
            Self::UpstreamCredential => "upstream_credential",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an upstream transport failure affects the credential that carried it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamErrorClass {
    /// Network blip or server-side failure; the credential stays usable
    Transient,
    /// Auth failure or exhausted quota; the credential must be disabled
    CredentialFatal,
}

/// A failure reported by the upstream transform pipeline
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("upstream {class:?} error{}: {message}", status_suffix(.status))]
pub struct UpstreamError {
    /// Effect on the credential
    pub class: UpstreamErrorClass,
    /// HTTP status, when the failure came from a response
    pub status: Option<u16>,
    /// Human-readable description
    pub message: String,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl UpstreamError {
    /// A transient failure
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: UpstreamErrorClass::Transient,
            status: None,
            message: message.into(),
        }
    }

    /// A failure that invalidates the credential
    pub fn credential(message: impl Into<String>) -> Self {
        Self {
            class: UpstreamErrorClass::CredentialFatal,
            status: None,
            message: message.into(),
        }
    }

    /// Attach the HTTP status that produced this error
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether the credential that carried the request should be disabled
    #[must_use]
    pub fn is_credential_fatal(&self) -> bool {
        self.class == UpstreamErrorClass::CredentialFatal
    }
}

/// Errors surfaced by the gateway core
#[derive(Clone, Debug, Error)]
pub enum GatewayError {
    /// Malformed input
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown provider
    #[error("unknown provider '{0}'")]
    ProviderNotFound(String),

    /// Provider exists but does not serve the model
    #[error("provider '{provider}' does not serve model '{model}'")]
    ModelNotFound {
        /// Provider name
        provider: String,
        /// Requested model
        model: String,
    },

    /// Unknown session
    #[error("unknown session '{0}'")]
    SessionNotFound(String),

    /// Provider explicitly disabled
    #[error("provider '{0}' is disabled")]
    Forbidden(String),

    /// No credential headroom
    #[error("no credential headroom for provider '{provider}', retry after {retry_after:?}")]
    ResourceExhausted {
        /// Provider name
        provider: String,
        /// Suggested back-off before retrying
        retry_after: Duration,
    },

    /// Upstream transport failure
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Client disconnect or explicit abort
    #[error("request cancelled")]
    Cancelled,

    /// Caller deadline expired
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Collaborator or transport failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable kind tag for this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::ProviderNotFound(_) | Self::ModelNotFound { .. } | Self::SessionNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Upstream(e) => match e.class {
                UpstreamErrorClass::Transient => ErrorKind::UpstreamTransient,
                UpstreamErrorClass::CredentialFatal => ErrorKind::UpstreamCredential,
            },
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller may retry (possibly on another credential)
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ResourceExhausted
                | ErrorKind::UpstreamTransient
                | ErrorKind::UpstreamCredential
                | ErrorKind::Timeout
        )
    }

    /// Retry hint carried by `ResourceExhausted`
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ResourceExhausted { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whether this error represents a failure worth logging at warn or above
    ///
    /// Cancellation and not-found are expected outcomes, not failures.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Cancelled | ErrorKind::NotFound)
    }
}

/// Result alias used throughout the core
pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
