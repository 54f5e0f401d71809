//! TOML Configuration File Support
//!
//! Centralized configuration loading for the gateway, from a TOML file at
//! `~/.config/llm-gateway/gateway.toml`.
//!
//! # Configuration Priority
//!
//! Values are applied with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`GATEWAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [streaming]
//! close_ttl_secs = 30
//! sweep_interval_secs = 5
//!
//! [gate]
//! policy = "queue"          # or "fail_fast"
//! retry_after_ms = 1000
//!
//! [protocol]
//! idle_timeout_secs = 600
//! reap_interval_secs = 60
//!
//! [dispatch]
//! timeout_secs = 120
//!
//! [providers.openai]
//! base_url = "https://api.openai.com/v1"
//! models = ["gpt-4o", "gpt-4o-mini"]
//!
//! [[providers.openai.credentials]]
//! secret = "sk-..."
//! ceiling = 4
//!
//! [providers.local]
//! enabled = false
//! ```
//!
//! Only a boolean `enabled = false` disables a provider. Leaving the key out,
//! or giving it any non-boolean value, keeps the provider enabled.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ProtocolConfig;
use crate::routing::catalog::{CredentialSpec, Enablement, ProviderConfig, StaticCatalog};
use crate::routing::dispatcher::DispatcherConfig;
use crate::routing::gate::{AcquirePolicy, GateConfig};
use crate::streaming::RegistryConfig;

/// Ceiling applied to credentials that do not set one
pub const DEFAULT_CREDENTIAL_CEILING: u32 = 1;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[streaming]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingToml {
    /// Seconds a closed stream session stays available for replay
    pub close_ttl_secs: Option<u64>,

    /// Seconds between eviction sweeps
    pub sweep_interval_secs: Option<u64>,
}

/// `[gate]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateToml {
    /// Saturation policy: `queue` or `fail_fast`
    pub policy: Option<AcquirePolicy>,

    /// Retry hint attached to `ResourceExhausted`, in milliseconds
    pub retry_after_ms: Option<u64>,
}

/// `[protocol]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolToml {
    /// Seconds of inactivity before a request-carrier session is reaped
    pub idle_timeout_secs: Option<u64>,

    /// Seconds between idle reaps
    pub reap_interval_secs: Option<u64>,

    /// Largest push-carrier frame payload, in bytes
    pub max_frame_size: Option<usize>,
}

/// `[dispatch]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchToml {
    /// Default upstream timeout in seconds (0 = none)
    pub timeout_secs: Option<u64>,
}

/// One `[[providers.<name>.credentials]]` entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialToml {
    /// Secret presented upstream
    pub secret: String,

    /// Maximum concurrent requests on this credential
    pub ceiling: Option<u32>,
}

/// One `[providers.<name>]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderToml {
    /// Raw enablement flag; any TOML value is accepted
    pub enabled: Option<toml::Value>,

    /// Base URL of the provider API
    pub base_url: Option<String>,

    /// Models served; empty means any
    pub models: Vec<String>,

    /// Credential pool
    pub credentials: Vec<CredentialToml>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    /// Streaming registry section
    pub streaming: StreamingToml,

    /// Credential gate section
    pub gate: GateToml,

    /// Protocol manager section
    pub protocol: ProtocolToml,

    /// Dispatcher section
    pub dispatch: DispatchToml,

    /// Providers by name
    pub providers: BTreeMap<String, ProviderToml>,
}

fn enablement_from_toml(value: Option<&toml::Value>) -> Enablement {
    match value {
        None => Enablement::Unset,
        Some(toml::Value::Boolean(flag)) => Enablement::from(*flag),
        Some(toml::Value::String(s)) => Enablement::Other(s.clone()),
        Some(other) => Enablement::Other(other.to_string()),
    }
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved gateway configuration
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Streaming registry configuration
    pub streaming: RegistryConfig,

    /// Credential gate configuration
    pub gate: GateConfig,

    /// Protocol manager configuration
    pub protocol: ProtocolConfig,

    /// Dispatcher configuration
    pub dispatch: DispatcherConfig,

    /// Providers by name
    pub providers: BTreeMap<String, ProviderConfig>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            streaming: RegistryConfig::default(),
            gate: GateConfig::default(),
            protocol: ProtocolConfig::default(),
            dispatch: DispatcherConfig::default(),
            providers: BTreeMap::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl GatewayConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Build the provider catalog described by this configuration
    #[must_use]
    pub fn catalog(&self) -> StaticCatalog {
        StaticCatalog::from_providers(self.providers.clone())
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for zero ceilings, provider names that cannot
    /// round-trip through a `provider,model` target, or a zero TTL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.streaming.close_ttl.is_zero() {
            return Err(ConfigError::ValidationError(
                "streaming.close_ttl_secs must be greater than zero".to_string(),
            ));
        }
        for (name, provider) in &self.providers {
            if name.is_empty() || name.contains(',') {
                return Err(ConfigError::ValidationError(format!(
                    "provider name '{name}' must be non-empty and must not contain ','"
                )));
            }
            if let Some(pos) = provider.credentials.iter().position(|c| c.ceiling == 0) {
                return Err(ConfigError::ValidationError(format!(
                    "providers.{name}.credentials[{pos}].ceiling must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/llm-gateway/gateway.toml` or
/// `~/.config/llm-gateway/gateway.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("llm-gateway").join("gateway.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read, parsed, or
/// validated.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<GatewayConfig, ConfigError> {
    let mut config = GatewayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: GatewayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                providers = config.providers.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

/// Parse configuration from a TOML string (no environment overlay)
///
/// # Errors
///
/// Returns an error if the TOML cannot be parsed or fails validation.
pub fn from_toml_str(content: &str) -> Result<GatewayConfig, ConfigError> {
    let toml_config: GatewayToml = toml::from_str(content)?;
    let mut config = GatewayConfig::default();
    apply_toml_config(&mut config, &toml_config);
    config.source = ConfigSource::File;
    config.validate()?;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut GatewayConfig, toml: &GatewayToml) {
    // Streaming
    if let Some(secs) = toml.streaming.close_ttl_secs {
        config.streaming.close_ttl = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.streaming.sweep_interval_secs {
        config.streaming.sweep_interval = Duration::from_secs(secs.max(1));
    }

    // Gate
    if let Some(policy) = toml.gate.policy {
        config.gate.policy = policy;
    }
    if let Some(ms) = toml.gate.retry_after_ms {
        config.gate.retry_after = Duration::from_millis(ms);
    }

    // Protocol
    if let Some(secs) = toml.protocol.idle_timeout_secs {
        config.protocol.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.protocol.reap_interval_secs {
        config.protocol.reap_interval = Duration::from_secs(secs.max(1));
    }
    if let Some(size) = toml.protocol.max_frame_size {
        config.protocol.max_frame_size = size;
    }

    // Dispatch
    if let Some(secs) = toml.dispatch.timeout_secs {
        config.dispatch.default_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }

    // Providers
    for (name, provider) in &toml.providers {
        let credentials = provider
            .credentials
            .iter()
            .map(|c| {
                CredentialSpec::new(c.secret.clone(), c.ceiling.unwrap_or(DEFAULT_CREDENTIAL_CEILING))
            })
            .collect();

        config.providers.insert(
            name.clone(),
            ProviderConfig {
                enabled: enablement_from_toml(provider.enabled.as_ref()),
                base_url: provider.base_url.clone(),
                models: provider.models.clone(),
                credentials,
            },
        );
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key = %key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut GatewayConfig) {
    if let Some(secs) = env_parse::<u64>("GATEWAY_CLOSE_TTL_SECS") {
        config.streaming.close_ttl = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }

    if let Ok(policy) = std::env::var("GATEWAY_GATE_POLICY") {
        match policy.to_lowercase().as_str() {
            "queue" => {
                config.gate.policy = AcquirePolicy::Queue;
                config.source = ConfigSource::Env;
            }
            "fail_fast" | "fail-fast" => {
                config.gate.policy = AcquirePolicy::FailFast;
                config.source = ConfigSource::Env;
            }
            other => {
                tracing::warn!(value = %other, "Unknown GATEWAY_GATE_POLICY, keeping configured policy");
            }
        }
    }

    if let Some(ms) = env_parse::<u64>("GATEWAY_RETRY_AFTER_MS") {
        config.gate.retry_after = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }

    if let Some(secs) = env_parse::<u64>("GATEWAY_DISPATCH_TIMEOUT_SECS") {
        config.dispatch.default_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        config.source = ConfigSource::Env;
    }

    if let Some(secs) = env_parse::<u64>("GATEWAY_PROTOCOL_IDLE_SECS") {
        config.protocol.idle_timeout = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Close TTL override (seconds)
    pub close_ttl_secs: Option<u64>,

    /// Gate policy override
    pub gate_policy: Option<AcquirePolicy>,

    /// Dispatch timeout override (seconds, 0 = none)
    pub dispatch_timeout_secs: Option<u64>,

    /// Protocol idle timeout override (seconds)
    pub protocol_idle_secs: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set close TTL override
    #[must_use]
    pub fn with_close_ttl_secs(mut self, secs: u64) -> Self {
        self.close_ttl_secs = Some(secs);
        self
    }

    /// Set gate policy override
    #[must_use]
    pub fn with_gate_policy(mut self, policy: AcquirePolicy) -> Self {
        self.gate_policy = Some(policy);
        self
    }

    /// Set dispatch timeout override
    #[must_use]
    pub fn with_dispatch_timeout_secs(mut self, secs: u64) -> Self {
        self.dispatch_timeout_secs = Some(secs);
        self
    }

    /// Set protocol idle timeout override
    #[must_use]
    pub fn with_protocol_idle_secs(mut self, secs: u64) -> Self {
        self.protocol_idle_secs = Some(secs);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.close_ttl_secs.is_none()
            && self.gate_policy.is_none()
            && self.dispatch_timeout_secs.is_none()
            && self.protocol_idle_secs.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut GatewayConfig) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }

        if let Some(secs) = self.close_ttl_secs {
            config.streaming.close_ttl = Duration::from_secs(secs);
        }
        if let Some(policy) = self.gate_policy {
            config.gate.policy = policy;
        }
        if let Some(secs) = self.dispatch_timeout_secs {
            config.dispatch.default_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = self.protocol_idle_secs {
            config.protocol.idle_timeout = Duration::from_secs(secs);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::catalog::ProviderCatalog;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();

        assert_eq!(config.streaming.close_ttl, Duration::from_secs(30));
        assert_eq!(config.gate.policy, AcquirePolicy::Queue);
        assert!(config.providers.is_empty());
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.to_string_lossy().contains("llm-gateway"));
            assert!(p.to_string_lossy().ends_with("gateway.toml"));
        }
    }

    #[test]
    fn test_parse_full_toml() {
        let config = from_toml_str(
            r#"
[streaming]
close_ttl_secs = 45

[gate]
policy = "fail_fast"
retry_after_ms = 250

[protocol]
idle_timeout_secs = 90
max_frame_size = 4096

[dispatch]
timeout_secs = 0

[providers.openai]
base_url = "https://api.openai.com/v1"
models = ["gpt-4o"]

[[providers.openai.credentials]]
secret = "k1"
ceiling = 3

[[providers.openai.credentials]]
secret = "k2"

[providers.local]
enabled = false
"#,
        )
        .unwrap();

        assert_eq!(config.streaming.close_ttl, Duration::from_secs(45));
        assert_eq!(config.gate.policy, AcquirePolicy::FailFast);
        assert_eq!(config.gate.retry_after, Duration::from_millis(250));
        assert_eq!(config.protocol.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.protocol.max_frame_size, 4096);
        assert_eq!(config.dispatch.default_timeout, None);

        let catalog = config.catalog();
        let creds = catalog.list_credentials("openai");
        assert_eq!(creds.len(), 2);
        assert_eq!(creds[0].ceiling, 3);
        assert_eq!(creds[1].ceiling, DEFAULT_CREDENTIAL_CEILING);
        assert!(catalog.is_enabled("openai"));
        assert!(!catalog.is_enabled("local"));
    }

    #[test]
    fn test_non_boolean_enabled_counts_as_enabled() {
        let config = from_toml_str(
            r#"
[providers.a]
enabled = "false"

[providers.b]
enabled = 0

[providers.c]
enabled = true
"#,
        )
        .unwrap();

        assert_eq!(
            config.providers["a"].enabled,
            Enablement::Other("false".to_string())
        );
        assert!(config.providers["a"].enabled.is_enabled());
        assert!(config.providers["b"].enabled.is_enabled());
        assert_eq!(config.providers["c"].enabled, Enablement::Enabled);
    }

    #[test]
    fn test_zero_ceiling_rejected() {
        let err = from_toml_str(
            r#"
[[providers.openai.credentials]]
secret = "k1"
ceiling = 0
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_comma_in_provider_name_rejected() {
        let err = from_toml_str("[providers.\"a,b\"]\n").unwrap_err();
        assert!(err.to_string().contains("must not contain ','"));
    }

    #[test]
    fn test_invalid_toml() {
        let err = from_toml_str("[gate\npolicy = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[streaming]\nsweep_interval_secs = 2\n").unwrap();

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.streaming.sweep_interval, Duration::from_secs(2));
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_missing_file_graceful() {
        let path = PathBuf::from("/nonexistent/path/gateway.toml");
        let config = load_config_from_path(Some(path)).unwrap();

        // Env may leak in from parallel tests; the key assertion is no error
        assert!(config.config_file_path.is_none());
        assert!(
            config.source() == ConfigSource::Default || config.source() == ConfigSource::Env,
            "Expected Default or Env source, got: {:?}",
            config.source()
        );
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = GatewayConfig::default();
        let overrides = ConfigOverrides::new()
            .with_close_ttl_secs(5)
            .with_gate_policy(AcquirePolicy::FailFast)
            .with_dispatch_timeout_secs(10);

        overrides.apply(&mut config);

        assert_eq!(config.streaming.close_ttl, Duration::from_secs(5));
        assert_eq!(config.gate.policy, AcquirePolicy::FailFast);
        assert_eq!(config.dispatch.default_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_empty_overrides_keep_source() {
        let mut config = GatewayConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(format!("{}", ConfigSource::Cli), "CLI");
        assert_eq!(format!("{}", ConfigSource::Env), "environment");
        assert_eq!(format!("{}", ConfigSource::File), "config file");
        assert_eq!(format!("{}", ConfigSource::Default), "default");
    }
}
