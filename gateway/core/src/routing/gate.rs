//! Key Rotation Gate
//!
//! Per-provider credential pools with a concurrency ceiling on every
//! credential. Acquiring returns a [`CredentialLease`] bound to one specific
//! credential, chosen round-robin among enabled credentials with headroom.
//!
//! # Design
//!
//! Each provider gets a [`ProviderPool`] guarded by a single short-lived
//! `parking_lot` mutex. In-flight counts only change while that mutex is held,
//! which makes "never above ceiling, never below zero" a local property of
//! two small functions (`try_take` / `give_back`).
//!
//! When every credential is saturated the gate either fails fast or parks the
//! caller in a FIFO queue. Releases hand the freed headroom directly to the
//! oldest live waiter, so a burst of new callers cannot starve the queue.
//!
//! ```text
//!   acquire() ──► try_take ──► lease ─────────────┐
//!       │            │ (saturated)                │
//!       │            ▼                            ▼
//!       │      FailFast: ResourceExhausted     release()/drop
//!       │      Queue:    waiters.push_back        │
//!       │                      ▲                  │
//!       └──── oneshot ◄────────┴── hand-off ◄─────┘
//! ```
//!
//! Leases release on drop, so every exit path (success, error, timeout,
//! cancellation) gives the slot back exactly once.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::catalog::{CredentialSpec, ProviderCatalog, Secret};
use crate::error::{GatewayError, Result, UpstreamError};

// ============================================================================
// Configuration
// ============================================================================

/// What to do when every credential of a provider is at its ceiling
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquirePolicy {
    /// Return `ResourceExhausted` immediately
    FailFast,
    /// Wait in FIFO order until headroom frees
    #[default]
    Queue,
}

/// Gate configuration
#[derive(Clone, Debug)]
pub struct GateConfig {
    /// Saturation policy
    pub policy: AcquirePolicy,
    /// Retry hint attached to `ResourceExhausted`
    pub retry_after: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            policy: AcquirePolicy::Queue,
            retry_after: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// Slots and pools
// ============================================================================

/// One credential with its live counters
struct SlotState {
    index: usize,
    secret: Secret,
    ceiling: u32,
    /// Mutated only while the owning pool's state lock is held
    in_flight: AtomicU32,
    disabled: AtomicBool,
}

impl SlotState {
    fn is_usable(&self) -> bool {
        self.ceiling > 0 && !self.disabled.load(Ordering::Acquire)
    }
}

/// Point-in-time view of one credential
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotSnapshot {
    /// Position in the provider's pool
    pub index: usize,
    /// Concurrency ceiling
    pub ceiling: u32,
    /// Requests currently holding a lease on this credential
    pub in_flight: u32,
    /// Whether the credential has been disabled
    pub disabled: bool,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<CredentialLease>>,
}

#[derive(Default)]
struct PoolState {
    /// Next slot to try (round-robin)
    cursor: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

/// Lifetime counters for a provider pool
#[derive(Default)]
struct PoolCounters {
    acquires: AtomicU64,
    releases: AtomicU64,
    queued: AtomicU64,
    disabled: AtomicU64,
}

/// Aggregate statistics for one provider
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Successful acquisitions (direct or via hand-off)
    pub acquires: u64,
    /// Releases (explicit or on drop)
    pub releases: u64,
    /// Callers that had to wait in the queue
    pub queued: u64,
    /// Credentials disabled by upstream errors
    pub disabled: u64,
    /// Callers currently waiting
    pub waiting: usize,
}

/// Credential pool for a single provider
pub struct ProviderPool {
    provider: Arc<str>,
    slots: Vec<Arc<SlotState>>,
    state: Mutex<PoolState>,
    counters: PoolCounters,
}

impl ProviderPool {
    fn new(provider: &str, specs: Vec<CredentialSpec>) -> Self {
        let slots = specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                Arc::new(SlotState {
                    index,
                    secret: spec.secret,
                    ceiling: spec.ceiling,
                    in_flight: AtomicU32::new(0),
                    disabled: AtomicBool::new(false),
                })
            })
            .collect();

        Self {
            provider: Arc::from(provider),
            slots,
            state: Mutex::new(PoolState::default()),
            counters: PoolCounters::default(),
        }
    }

    fn has_usable(&self) -> bool {
        self.slots.iter().any(|s| s.is_usable())
    }

    /// Claim headroom on the next usable slot, round-robin
    fn try_take(&self, state: &mut PoolState) -> Option<Arc<SlotState>> {
        let n = self.slots.len();
        for offset in 0..n {
            let idx = (state.cursor + offset) % n;
            let slot = &self.slots[idx];
            if !slot.is_usable() {
                continue;
            }
            let current = slot.in_flight.load(Ordering::Acquire);
            if current < slot.ceiling {
                slot.in_flight.store(current + 1, Ordering::Release);
                state.cursor = (idx + 1) % n;
                return Some(Arc::clone(slot));
            }
        }
        None
    }

    /// Return headroom to a slot
    fn give_back(&self, slot: &SlotState) {
        let current = slot.in_flight.load(Ordering::Acquire);
        debug_assert!(
            current > 0,
            "credential {} of provider '{}' released below zero",
            slot.index,
            self.provider
        );
        if current == 0 {
            tracing::error!(
                provider = %self.provider,
                slot = slot.index,
                "Credential in-flight count would go negative; ignoring release"
            );
            return;
        }
        slot.in_flight.store(current - 1, Ordering::Release);
    }

    fn exhausted(&self, retry_after: Duration) -> GatewayError {
        GatewayError::ResourceExhausted {
            provider: self.provider.to_string(),
            retry_after,
        }
    }

    /// Hand freed headroom to the oldest live waiters
    fn wake_waiters(self: &Arc<Self>, state: &mut PoolState, retry_after: Duration) {
        if !self.has_usable() {
            for waiter in state.waiters.drain(..) {
                let _ = waiter.tx.send(Err(self.exhausted(retry_after)));
            }
            return;
        }

        while !state.waiters.is_empty() {
            let Some(slot) = self.try_take(state) else {
                return;
            };
            let Some(waiter) = state.waiters.pop_front() else {
                self.give_back(&slot);
                return;
            };

            let lease = CredentialLease::new(Arc::clone(self), Arc::clone(&slot));
            match waiter.tx.send(Ok(lease)) {
                Ok(()) => {
                    self.counters.acquires.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(
                        provider = %self.provider,
                        slot = slot.index,
                        waiter = waiter.id,
                        "Handed credential to queued waiter"
                    );
                }
                Err(returned) => {
                    // Waiter was cancelled; take the headroom back without
                    // re-entering this lock through the lease's drop.
                    if let Ok(lease) = returned {
                        lease.disarm();
                    }
                    self.give_back(&slot);
                }
            }
        }
    }

    fn release(self: &Arc<Self>, lease: &CredentialLease, retry_after: Duration) -> bool {
        if lease.released.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                provider = %self.provider,
                slot = lease.slot.index,
                "Credential lease released more than once"
            );
            return false;
        }

        let mut state = self.state.lock();
        self.give_back(&lease.slot);
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        self.wake_waiters(&mut state, retry_after);
        true
    }

    fn remove_waiter(&self, id: u64) {
        let mut state = self.state.lock();
        state.waiters.retain(|w| w.id != id);
    }

    fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.slots
            .iter()
            .map(|s| SlotSnapshot {
                index: s.index,
                ceiling: s.ceiling,
                in_flight: s.in_flight.load(Ordering::Acquire),
                disabled: s.disabled.load(Ordering::Acquire),
            })
            .collect()
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            acquires: self.counters.acquires.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
            disabled: self.counters.disabled.load(Ordering::Relaxed),
            waiting: self.state.lock().waiters.len(),
        }
    }
}

impl fmt::Debug for ProviderPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderPool")
            .field("provider", &self.provider)
            .field("slots", &self.snapshot())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Lease
// ============================================================================

/// Scoped claim on one credential
///
/// Dropping the lease releases it. Releasing explicitly through
/// [`KeyRotationGate::release`] is equivalent and idempotent.
pub struct CredentialLease {
    pool: Arc<ProviderPool>,
    slot: Arc<SlotState>,
    released: AtomicBool,
    retry_after: Duration,
}

impl CredentialLease {
    fn new(pool: Arc<ProviderPool>, slot: Arc<SlotState>) -> Self {
        Self {
            pool,
            slot,
            released: AtomicBool::new(false),
            retry_after: Duration::from_secs(1),
        }
    }

    fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Mark as released without touching the pool
    fn disarm(&self) {
        self.released.store(true, Ordering::Release);
    }

    /// Provider this lease belongs to
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.pool.provider
    }

    /// Index of the leased credential in the provider's pool
    #[must_use]
    pub fn slot_index(&self) -> usize {
        self.slot.index
    }

    /// The leased secret
    #[must_use]
    pub fn secret(&self) -> &Secret {
        &self.slot.secret
    }

    /// Whether the lease has already been released
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialLease")
            .field("provider", &self.pool.provider)
            .field("slot", &self.slot.index)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        if !self.is_released() {
            let pool = Arc::clone(&self.pool);
            pool.release(self, self.retry_after);
        }
    }
}

/// Removes a queued waiter if its acquire future is dropped
struct WaiterGuard<'a> {
    pool: &'a ProviderPool,
    id: u64,
    armed: bool,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.remove_waiter(self.id);
        }
    }
}

// ============================================================================
// Gate
// ============================================================================

/// Per-provider credential pools with concurrency ceilings
pub struct KeyRotationGate {
    pools: RwLock<HashMap<String, Arc<ProviderPool>>>,
    config: GateConfig,
}

impl KeyRotationGate {
    /// Create an empty gate
    #[must_use]
    pub fn new(config: GateConfig) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Create a gate with one pool per catalog provider
    #[must_use]
    pub fn from_catalog(catalog: &dyn ProviderCatalog, config: GateConfig) -> Self {
        let gate = Self::new(config);
        for provider in catalog.providers() {
            gate.register(&provider, catalog.list_credentials(&provider));
        }
        gate
    }

    /// Gate configuration
    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Register (or replace) the credential pool for a provider
    pub fn register(&self, provider: &str, credentials: Vec<CredentialSpec>) {
        let count = credentials.len();
        let pool = Arc::new(ProviderPool::new(provider, credentials));
        self.pools.write().insert(provider.to_string(), pool);
        tracing::info!(provider = %provider, credentials = count, "Credential pool registered");
    }

    fn pool(&self, provider: &str) -> Result<Arc<ProviderPool>> {
        self.pools
            .read()
            .get(provider)
            .cloned()
            .ok_or_else(|| GatewayError::ProviderNotFound(provider.to_string()))
    }

    /// Acquire a lease on one of the provider's credentials
    ///
    /// Suspends the calling task (never the thread) under the queue policy.
    /// Dropping the returned future while queued abandons the wait cleanly.
    ///
    /// # Errors
    ///
    /// - `ProviderNotFound` if the provider has no pool
    /// - `ResourceExhausted` if no credential is usable, or all are saturated
    ///   under the fail-fast policy
    pub async fn acquire(&self, provider: &str) -> Result<CredentialLease> {
        let pool = self.pool(provider)?;
        let retry_after = self.config.retry_after;

        let (waiter_id, rx) = {
            let mut state = pool.state.lock();
            if !pool.has_usable() {
                return Err(pool.exhausted(retry_after));
            }

            if state.waiters.is_empty() {
                if let Some(slot) = pool.try_take(&mut state) {
                    pool.counters.acquires.fetch_add(1, Ordering::Relaxed);
                    return Ok(CredentialLease::new(Arc::clone(&pool), slot)
                        .with_retry_after(retry_after));
                }
            }

            if self.config.policy == AcquirePolicy::FailFast {
                tracing::debug!(provider = %provider, "All credentials saturated, failing fast");
                return Err(pool.exhausted(retry_after));
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter { id, tx });
            pool.counters.queued.fetch_add(1, Ordering::Relaxed);
            (id, rx)
        };

        tracing::debug!(provider = %provider, waiter = waiter_id, "Queued for credential headroom");
        let mut guard = WaiterGuard {
            pool: &pool,
            id: waiter_id,
            armed: true,
        };

        let outcome = rx.await;
        guard.armed = false;
        match outcome {
            Ok(result) => result.map(|lease| lease.with_retry_after(retry_after)),
            Err(_) => Err(GatewayError::Internal(format!(
                "credential pool for '{provider}' dropped a queued waiter"
            ))),
        }
    }

    /// Acquire with an upper bound on the wait
    ///
    /// # Errors
    ///
    /// As [`acquire`](Self::acquire), plus `Timeout` when the wait expires.
    pub async fn acquire_timeout(&self, provider: &str, timeout: Duration) -> Result<CredentialLease> {
        tokio::time::timeout(timeout, self.acquire(provider))
            .await
            .map_err(|_| GatewayError::Timeout(timeout))?
    }

    /// Release a lease
    ///
    /// Returns `false` (and changes nothing) if the lease was already released.
    pub fn release(&self, lease: &CredentialLease) -> bool {
        let pool = Arc::clone(&lease.pool);
        pool.release(lease, self.config.retry_after)
    }

    /// React to an upstream failure observed while holding `lease`
    ///
    /// Credential-fatal errors disable the leased credential only; sibling
    /// credentials of the same provider are unaffected. Returns whether the
    /// credential was disabled.
    pub fn on_upstream_error(&self, lease: &CredentialLease, error: &UpstreamError) -> bool {
        if !error.is_credential_fatal() {
            return false;
        }
        tracing::warn!(
            provider = %lease.provider(),
            slot = lease.slot_index(),
            status = ?error.status,
            "Disabling credential after upstream rejected it"
        );
        self.set_disabled(&lease.pool, lease.slot.index, true)
    }

    /// Disable a credential by index
    pub fn disable(&self, provider: &str, index: usize) -> bool {
        match self.pool(provider) {
            Ok(pool) => self.set_disabled(&pool, index, true),
            Err(_) => false,
        }
    }

    /// Re-enable a previously disabled credential
    pub fn enable(&self, provider: &str, index: usize) -> bool {
        match self.pool(provider) {
            Ok(pool) => self.set_disabled(&pool, index, false),
            Err(_) => false,
        }
    }

    fn set_disabled(&self, pool: &Arc<ProviderPool>, index: usize, disabled: bool) -> bool {
        let Some(slot) = pool.slots.get(index) else {
            return false;
        };
        let mut state = pool.state.lock();
        let previous = slot.disabled.swap(disabled, Ordering::AcqRel);
        if previous == disabled {
            return false;
        }
        if disabled {
            pool.counters.disabled.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::info!(provider = %pool.provider, slot = index, "Credential re-enabled");
        }
        pool.wake_waiters(&mut state, self.config.retry_after);
        true
    }

    /// Per-credential view of a provider's pool
    #[must_use]
    pub fn snapshot(&self, provider: &str) -> Option<Vec<SlotSnapshot>> {
        self.pool(provider).ok().map(|p| p.snapshot())
    }

    /// Aggregate statistics for a provider
    #[must_use]
    pub fn stats(&self, provider: &str) -> Option<PoolStats> {
        self.pool(provider).ok().map(|p| p.stats())
    }

    /// Names of providers with a registered pool
    #[must_use]
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for KeyRotationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRotationGate")
            .field("providers", &self.providers())
            .field("config", &self.config)
            .finish()
    }
}
