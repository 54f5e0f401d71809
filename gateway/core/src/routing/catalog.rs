//! Provider Catalog
//!
//! The provider/model configuration collaborator. The dispatcher asks the
//! catalog three questions before touching a credential: does the provider
//! exist, does it serve the model, and is it enabled.
//!
//! # Enablement
//!
//! Only an explicit boolean `false` disables a provider. An unset flag, `true`,
//! or any other value (a string, a number) counts as enabled. This conflates
//! "never configured" with "explicitly enabled"; [`Enablement`] keeps the raw
//! distinction visible so callers can tell the cases apart even though the
//! policy treats them the same.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A credential secret; never printed in logs or debug output
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a raw secret
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw secret, for building upstream auth headers only
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// One credential in a provider's pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialSpec {
    /// The secret presented upstream
    pub secret: Secret,
    /// Maximum concurrent requests on this credential
    pub ceiling: u32,
}

impl CredentialSpec {
    /// Create a credential spec
    pub fn new(secret: impl Into<String>, ceiling: u32) -> Self {
        Self {
            secret: Secret::new(secret),
            ceiling,
        }
    }
}

/// Raw enablement flag as configured
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Enablement {
    /// No flag configured
    #[default]
    Unset,
    /// Boolean `true`
    Enabled,
    /// Boolean `false`
    Disabled,
    /// Any non-boolean value, kept verbatim
    Other(String),
}

impl Enablement {
    /// Policy: anything but an explicit `false` is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

impl From<bool> for Enablement {
    fn from(value: bool) -> Self {
        if value {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

/// Static description of one upstream provider
#[derive(Clone, Debug, Default)]
pub struct ProviderConfig {
    /// Enablement flag
    pub enabled: Enablement,
    /// Base URL of the provider API
    pub base_url: Option<String>,
    /// Models served; empty means "any model"
    pub models: Vec<String>,
    /// Credential pool
    pub credentials: Vec<CredentialSpec>,
}

impl ProviderConfig {
    /// Builder: set the base URL
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Builder: set the enablement flag
    #[must_use]
    pub fn with_enabled(mut self, enabled: impl Into<Enablement>) -> Self {
        self.enabled = enabled.into();
        self
    }

    /// Builder: add a served model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.models.push(model.into());
        self
    }

    /// Builder: add a credential
    #[must_use]
    pub fn with_credential(mut self, secret: impl Into<String>, ceiling: u32) -> Self {
        self.credentials.push(CredentialSpec::new(secret, ceiling));
        self
    }
}

/// Provider/model configuration collaborator
pub trait ProviderCatalog: Send + Sync {
    /// Whether the provider is known at all
    fn contains(&self, provider: &str) -> bool;

    /// Raw enablement flag for the provider
    fn enablement(&self, provider: &str) -> Enablement;

    /// Enablement policy decision
    fn is_enabled(&self, provider: &str) -> bool {
        self.enablement(provider).is_enabled()
    }

    /// Credential pool for the provider
    fn list_credentials(&self, provider: &str) -> Vec<CredentialSpec>;

    /// Whether the provider serves the model
    fn supports_model(&self, provider: &str, model: &str) -> bool {
        let _ = (provider, model);
        true
    }

    /// Base URL of the provider API, if configured
    fn base_url(&self, provider: &str) -> Option<String> {
        let _ = provider;
        None
    }

    /// Names of all known providers
    fn providers(&self) -> Vec<String>;
}

/// Catalog backed by the loaded configuration
#[derive(Clone, Debug, Default)]
pub struct StaticCatalog {
    providers: BTreeMap<String, ProviderConfig>,
}

impl StaticCatalog {
    /// Create an empty catalog
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from a provider map
    #[must_use]
    pub fn from_providers(providers: BTreeMap<String, ProviderConfig>) -> Self {
        Self { providers }
    }

    /// Builder: add or replace a provider
    #[must_use]
    pub fn with_provider(mut self, name: impl Into<String>, provider: ProviderConfig) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    /// Look up a provider's full configuration
    #[must_use]
    pub fn get(&self, provider: &str) -> Option<&ProviderConfig> {
        self.providers.get(provider)
    }
}

impl ProviderCatalog for StaticCatalog {
    fn contains(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }

    fn enablement(&self, provider: &str) -> Enablement {
        self.providers
            .get(provider)
            .map(|p| p.enabled.clone())
            .unwrap_or_default()
    }

    fn list_credentials(&self, provider: &str) -> Vec<CredentialSpec> {
        self.providers
            .get(provider)
            .map(|p| p.credentials.clone())
            .unwrap_or_default()
    }

    fn supports_model(&self, provider: &str, model: &str) -> bool {
        self.providers
            .get(provider)
            .is_some_and(|p| p.models.is_empty() || p.models.iter().any(|m| m == model))
    }

    fn base_url(&self, provider: &str) -> Option<String> {
        self.providers.get(provider).and_then(|p| p.base_url.clone())
    }

    fn providers(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}
