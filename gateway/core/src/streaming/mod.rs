//! Streaming Sessions
//!
//! Push-based response delivery with reconnect-tolerant replay.
//!
//! A request that streams its answer gets a session in the
//! [`StreamingSessionRegistry`]. The dispatcher pushes upstream chunks into
//! it; front doors attach [`EventSink`]s to it. Late or reconnecting
//! subscribers catch up from the session's replay log, and a closed session
//! stays readable for a grace window before it is evicted.

use std::time::Duration;

pub mod event;
pub mod eviction;
pub mod registry;

pub use event::{EventReceiver, EventSink, SequencedEvent, SinkId, StreamEvent};
pub use eviction::EvictionQueue;
pub use registry::{new_session_id, RegistryStats, SessionInfo, StreamingSessionRegistry};

/// Registry configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    /// How long a closed session stays available for replay
    pub close_ttl: Duration,
    /// How often the background sweeper purges expired sessions
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            close_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}
