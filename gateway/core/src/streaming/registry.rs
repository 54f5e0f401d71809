//! Streaming Session Registry
//!
//! Owns every push-delivery session: its replay log, its attached sinks, and
//! its post-close grace window.
//!
//! # Ordering
//!
//! `push` and `attach` both run under the session's own mutex. Appending to
//! the log and fanning out to sinks is one critical section; replaying the
//! log and registering a new sink is another. A sink attached concurrently
//! with a push therefore sees that event exactly once: either in the replay
//! or as a live delivery, never both and never neither.
//!
//! # Lifecycle
//!
//! ```text
//!   create ──► open ──push/attach/detach──► close ──(ttl)──► purged
//!                                             │
//!                                             └─ Done pushed, sinks dropped,
//!                                                eviction scheduled
//! ```
//!
//! Every operation on an unknown id is a silent no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::eviction::EvictionQueue;
use super::event::{EventSink, SequencedEvent, SinkId, StreamEvent};
use super::RegistryConfig;

/// Generate a fresh, registry-unique session id
#[must_use]
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// Session
// ============================================================================

struct StreamSession {
    log: Vec<SequencedEvent>,
    sinks: Vec<EventSink>,
    closed: bool,
    evict_at: Option<Instant>,
    cancel: Option<CancellationToken>,
    conversation: Option<String>,
}

impl StreamSession {
    fn new() -> Self {
        Self {
            log: Vec::new(),
            sinks: Vec::new(),
            closed: false,
            evict_at: None,
            cancel: None,
            conversation: None,
        }
    }

    /// Append and fan out; drops sinks whose subscriber has gone
    fn append(&mut self, event: StreamEvent) -> SequencedEvent {
        let sequenced = SequencedEvent {
            seq: self.log.len() as u64 + 1,
            event,
        };
        self.sinks.retain(|sink| sink.deliver(&sequenced));
        self.log.push(sequenced.clone());
        sequenced
    }

    fn replay_into(&self, sink: &EventSink, after: u64) -> bool {
        self.log
            .iter()
            .filter(|e| e.seq > after)
            .all(|e| sink.deliver(e))
    }
}

/// Point-in-time view of one session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    /// Events in the replay log
    pub events: usize,
    /// Currently attached sinks
    pub sinks: usize,
    /// Whether the session has been closed
    pub closed: bool,
    /// Bound conversation, if any
    pub conversation: Option<String>,
}

/// Registry-wide counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Sessions currently in the table (open or in their grace window)
    pub sessions: usize,
    /// Sessions created over the registry's lifetime
    pub created: u64,
    /// Events appended over the registry's lifetime
    pub events_pushed: u64,
    /// Sessions purged after their grace window
    pub evicted: u64,
}

// ============================================================================
// Registry
// ============================================================================

/// Table of streaming sessions with deadline-queue eviction
pub struct StreamingSessionRegistry {
    sessions: DashMap<String, Arc<Mutex<StreamSession>>>,
    evictions: Mutex<EvictionQueue>,
    config: RegistryConfig,
    created: AtomicU64,
    events_pushed: AtomicU64,
    evicted: AtomicU64,
}

impl StreamingSessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            evictions: Mutex::new(EvictionQueue::new()),
            config,
            created: AtomicU64::new(0),
            events_pushed: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Registry configuration
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn session(&self, id: &str) -> Option<Arc<Mutex<StreamSession>>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Allocate a session
    ///
    /// Returns `false` and leaves the existing session untouched if `id` is
    /// already present (open or within its grace window).
    pub fn create(&self, id: &str) -> bool {
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(_) => {
                tracing::warn!(session_id = %id, "Stream session already exists, not overwriting");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(StreamSession::new())));
                self.created.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(session_id = %id, "Stream session created");
                true
            }
        }
    }

    /// Append an event and broadcast it to attached sinks
    ///
    /// Returns the assigned sequence number, or `None` if the session is
    /// unknown or already closed.
    pub fn push(&self, id: &str, event: StreamEvent) -> Option<u64> {
        let session = self.session(id)?;
        let mut session = session.lock();
        if session.closed {
            tracing::trace!(session_id = %id, "Push after close ignored");
            return None;
        }
        let seq = session.append(event).seq;
        self.events_pushed.fetch_add(1, Ordering::Relaxed);
        Some(seq)
    }

    /// Replay the full log into `sink`, then register it for live pushes
    ///
    /// On a closed session the sink receives the whole log (ending with the
    /// terminal event) and is then dropped. Returns `false` if the session is
    /// unknown.
    pub fn attach(&self, id: &str, sink: EventSink) -> bool {
        self.attach_after(id, sink, 0)
    }

    /// Reconnect variant of [`attach`](Self::attach)
    ///
    /// Replays only events with `seq > last_seq`.
    pub fn attach_after(&self, id: &str, sink: EventSink, last_seq: u64) -> bool {
        let Some(session) = self.session(id) else {
            tracing::trace!(session_id = %id, "Attach to unknown stream session ignored");
            return false;
        };
        let mut session = session.lock();

        let alive = session.replay_into(&sink, last_seq);
        if session.closed {
            // Sink drops here, closing the subscriber's stream after the replay
            return true;
        }
        if alive {
            tracing::debug!(session_id = %id, sink = %sink.id(), replayed_from = last_seq, "Sink attached");
            session.sinks.push(sink);
        }
        true
    }

    /// Remove a sink; no-op if absent
    pub fn detach(&self, id: &str, sink: SinkId) {
        if let Some(session) = self.session(id) {
            session.lock().sinks.retain(|s| s.id() != sink);
        }
    }

    /// Close the session
    ///
    /// Pushes the terminal event, drops every sink, and schedules the entry
    /// for eviction once the grace window elapses. Closing twice is a no-op.
    pub fn close(&self, id: &str) {
        let Some(session) = self.session(id) else {
            return;
        };
        let deadline = {
            let mut session = session.lock();
            if session.closed {
                return;
            }
            session.append(StreamEvent::Done);
            session.closed = true;
            session.sinks.clear();
            let deadline = Instant::now() + self.config.close_ttl;
            session.evict_at = Some(deadline);
            deadline
        };
        self.events_pushed.fetch_add(1, Ordering::Relaxed);
        self.evictions.lock().schedule(id.to_string(), deadline);
        tracing::debug!(session_id = %id, ttl = ?self.config.close_ttl, "Stream session closed");
    }

    /// Signal the session's upstream work to stop
    ///
    /// Distinct from [`close`](Self::close): this touches only the bound
    /// cancellation token. Returns whether a token was fired.
    pub fn cancel(&self, id: &str) -> bool {
        let Some(session) = self.session(id) else {
            return false;
        };
        let token = session.lock().cancel.clone();
        match token {
            Some(token) => {
                tracing::debug!(session_id = %id, "Cancelling stream session upstream work");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Bind the token fired by [`cancel`](Self::cancel)
    pub fn bind_cancellation(&self, id: &str, token: CancellationToken) {
        if let Some(session) = self.session(id) {
            session.lock().cancel = Some(token);
        }
    }

    /// Associate a conversation with the session
    pub fn bind_conversation(&self, id: &str, conversation: impl Into<String>) {
        if let Some(session) = self.session(id) {
            session.lock().conversation = Some(conversation.into());
        }
    }

    /// Whether the id is present (open or in its grace window)
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Snapshot of one session
    #[must_use]
    pub fn info(&self, id: &str) -> Option<SessionInfo> {
        let session = self.session(id)?;
        let session = session.lock();
        Some(SessionInfo {
            events: session.log.len(),
            sinks: session.sinks.len(),
            closed: session.closed,
            conversation: session.conversation.clone(),
        })
    }

    /// Purge closed sessions whose grace window ended at or before `now`
    ///
    /// Returns the number of sessions removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let due = self.evictions.lock().drain_due(now);

        let mut removed = 0;
        for id in due {
            let gone = self
                .sessions
                .remove_if(&id, |_, session| {
                    let session = session.lock();
                    session.closed && session.evict_at.is_some_and(|t| t <= now)
                })
                .is_some();
            if gone {
                removed += 1;
                tracing::trace!(session_id = %id, "Stream session evicted");
            }
        }

        if removed > 0 {
            self.evicted.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, remaining = self.sessions.len(), "Evicted expired stream sessions");
        }
        removed
    }

    /// Sweep expired sessions until `shutdown` fires
    pub async fn run_sweeper(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::debug!("Stream session sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.purge_expired(Instant::now());
                }
            }
        }
    }

    /// Number of sessions in the table
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Registry-wide counters
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            sessions: self.sessions.len(),
            created: self.created.load(Ordering::Relaxed),
            events_pushed: self.events_pushed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

impl Default for StreamingSessionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl std::fmt::Debug for StreamingSessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::event::EventReceiver;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn drain(rx: &mut EventReceiver) -> Vec<SequencedEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn payloads(events: &[SequencedEvent]) -> Vec<StreamEvent> {
        events.iter().map(|e| e.event.clone()).collect()
    }

    #[test]
    fn test_create_never_overwrites() {
        let registry = StreamingSessionRegistry::default();
        assert!(registry.create("s1"));
        registry.push("s1", StreamEvent::data("a"));
        assert!(!registry.create("s1"));
        assert_eq!(registry.info("s1").unwrap().events, 1);
    }

    #[test]
    fn test_unknown_ids_are_noops() {
        let registry = StreamingSessionRegistry::default();
        let (sink, _rx) = EventSink::channel();
        let sink_id = sink.id();

        assert_eq!(registry.push("nope", StreamEvent::data("x")), None);
        assert!(!registry.attach("nope", sink));
        registry.detach("nope", sink_id);
        registry.close("nope");
        assert!(!registry.cancel("nope"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_attach_replays_then_goes_live() {
        let registry = StreamingSessionRegistry::default();
        registry.create("s1");
        registry.push("s1", StreamEvent::data("a"));
        registry.push("s1", StreamEvent::data("b"));

        let (sink, mut rx) = EventSink::channel();
        assert!(registry.attach("s1", sink));
        registry.push("s1", StreamEvent::data("c"));

        let events = drain(&mut rx);
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(
            payloads(&events),
            vec![
                StreamEvent::data("a"),
                StreamEvent::data("b"),
                StreamEvent::data("c")
            ]
        );
    }

    #[test]
    fn test_attach_after_skips_seen_events() {
        let registry = StreamingSessionRegistry::default();
        registry.create("s1");
        for chunk in ["a", "b", "c"] {
            registry.push("s1", StreamEvent::data(chunk));
        }

        let (sink, mut rx) = EventSink::channel();
        registry.attach_after("s1", sink, 2);
        assert_eq!(payloads(&drain(&mut rx)), vec![StreamEvent::data("c")]);
    }

    #[test]
    fn test_close_then_attach_sees_only_terminal_event() {
        let registry = StreamingSessionRegistry::default();
        registry.create("sess-1");
        registry.close("sess-1");

        let (sink, mut rx) = EventSink::channel();
        assert!(registry.attach("sess-1", sink));
        assert_eq!(payloads(&drain(&mut rx)), vec![StreamEvent::Done]);
        // Sink was closed after the replay
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_close_ends_live_sinks_and_ignores_later_pushes() {
        let registry = StreamingSessionRegistry::default();
        registry.create("s1");
        let (sink, mut rx) = EventSink::channel();
        registry.attach("s1", sink);

        registry.push("s1", StreamEvent::data("a"));
        registry.close("s1");
        assert_eq!(registry.push("s1", StreamEvent::data("late")), None);

        assert_eq!(
            payloads(&drain(&mut rx)),
            vec![StreamEvent::data("a"), StreamEvent::Done]
        );
        assert!(registry.info("s1").unwrap().closed);
    }

    #[test]
    fn test_detach_stops_delivery() {
        let registry = StreamingSessionRegistry::default();
        registry.create("s1");
        let (sink, mut rx) = EventSink::channel();
        let id = sink.id();
        registry.attach("s1", sink);
        registry.detach("s1", id);
        registry.detach("s1", id);

        registry.push("s1", StreamEvent::data("a"));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(registry.info("s1").unwrap().sinks, 0);
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let registry = StreamingSessionRegistry::default();
        registry.create("s1");
        let (sink, rx) = EventSink::channel();
        registry.attach("s1", sink);
        drop(rx);

        registry.push("s1", StreamEvent::data("a"));
        assert_eq!(registry.info("s1").unwrap().sinks, 0);
    }

    #[test]
    fn test_cancel_fires_bound_token() {
        let registry = StreamingSessionRegistry::default();
        registry.create("s1");
        assert!(!registry.cancel("s1"));

        let token = CancellationToken::new();
        registry.bind_cancellation("s1", token.clone());
        registry.bind_conversation("s1", "conv-9");

        assert!(registry.cancel("s1"));
        assert!(token.is_cancelled());
        // Cancel does not close delivery
        assert!(!registry.info("s1").unwrap().closed);
        assert_eq!(registry.info("s1").unwrap().conversation.as_deref(), Some("conv-9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_respects_ttl() {
        let registry = StreamingSessionRegistry::new(RegistryConfig {
            close_ttl: Duration::from_secs(30),
            ..RegistryConfig::default()
        });
        registry.create("s1");
        registry.create("s2");
        registry.close("s1");

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(registry.purge_expired(Instant::now()), 0);
        assert!(registry.contains("s1"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(registry.purge_expired(Instant::now()), 1);
        assert!(!registry.contains("s1"));
        assert!(registry.contains("s2"));
        assert_eq!(registry.stats().evicted, 1);

        // Id may be reused once purged
        assert!(registry.create("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_and_stops() {
        let registry = Arc::new(StreamingSessionRegistry::new(RegistryConfig {
            close_ttl: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(1),
        }));
        registry.create("s1");
        registry.close("s1");

        let shutdown = CancellationToken::new();
        let handle = {
            let registry = Arc::clone(&registry);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { registry.run_sweeper(shutdown).await })
        };

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!registry.contains("s1"));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_push_and_attach_lose_nothing() {
        let registry = Arc::new(StreamingSessionRegistry::default());
        registry.create("s1");

        let pusher = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for i in 0..500 {
                    registry.push("s1", StreamEvent::data(i.to_string()));
                    if i % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let mut receivers = Vec::new();
        for _ in 0..8 {
            let (sink, rx) = EventSink::channel();
            registry.attach("s1", sink);
            receivers.push(rx);
            tokio::task::yield_now().await;
        }

        pusher.await.unwrap();
        registry.close("s1");

        for mut rx in receivers {
            let mut seqs = Vec::new();
            while let Some(event) = rx.recv().await {
                seqs.push(event.seq);
            }
            assert_eq!(seqs, (1..=501).collect::<Vec<_>>());
        }
    }
}
