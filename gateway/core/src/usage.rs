//! Usage Cache
//!
//! In-memory per-(provider, model) token totals. Implements the
//! [`UsageRecorder`] collaborator the dispatcher reports to.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::backend::{TokenUsage, UsageRecorder};

/// Accumulated usage for one provider/model pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsageEntry {
    /// Provider name
    pub provider: String,
    /// Model name
    pub model: String,
    /// Calls recorded
    pub requests: u64,
    /// Summed token counts
    pub tokens: TokenUsage,
    /// Wall-clock time of the latest record
    pub last_used: DateTime<Utc>,
}

/// Concurrent usage totals
#[derive(Debug, Default)]
pub struct UsageCache {
    entries: DashMap<(String, String), UsageEntry>,
}

impl UsageCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Totals for one provider/model pair
    #[must_use]
    pub fn get(&self, provider: &str, model: &str) -> Option<UsageEntry> {
        self.entries
            .get(&(provider.to_string(), model.to_string()))
            .map(|e| e.value().clone())
    }

    /// Totals across every model of a provider
    #[must_use]
    pub fn provider_total(&self, provider: &str) -> TokenUsage {
        let mut total = TokenUsage::default();
        for entry in self.entries.iter().filter(|e| e.key().0 == provider) {
            total += entry.value().tokens;
        }
        total
    }

    /// Every entry, sorted by provider then model
    #[must_use]
    pub fn snapshot(&self) -> Vec<UsageEntry> {
        let mut all: Vec<UsageEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        all
    }

    /// Total calls recorded
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.entries.iter().map(|e| e.value().requests).sum()
    }
}

impl UsageRecorder for UsageCache {
    fn record(&self, provider: &str, model: &str, usage: TokenUsage) {
        let now = Utc::now();
        self.entries
            .entry((provider.to_string(), model.to_string()))
            .and_modify(|e| {
                e.requests += 1;
                e.tokens += usage;
                e.last_used = now;
            })
            .or_insert_with(|| UsageEntry {
                provider: provider.to_string(),
                model: model.to_string(),
                requests: 1,
                tokens: usage,
                last_used: now,
            });

        tracing::trace!(
            provider = %provider,
            model = %model,
            tokens = usage.total(),
            "Usage recorded"
        );
    }
}
