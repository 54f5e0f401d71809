//! Stream events and subscriber sinks

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{ErrorKind, GatewayError};

// ============================================================================
// Events
// ============================================================================

/// One event in a streaming session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// An upstream chunk, passed through untouched
    Data {
        /// Chunk payload
        payload: String,
    },
    /// The upstream call failed
    Error {
        /// Stable error tag
        kind: ErrorKind,
        /// Human-readable description
        message: String,
    },
    /// Terminal event; nothing follows it
    Done,
}

impl StreamEvent {
    /// A data event
    pub fn data(payload: impl Into<String>) -> Self {
        Self::Data {
            payload: payload.into(),
        }
    }

    /// An error event carrying the error's kind tag
    #[must_use]
    pub fn error(err: &GatewayError) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Whether this is the terminal event
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// SSE `event:` name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Data { .. } => "data",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }
}

/// An event with its position in the session's replay log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedEvent {
    /// Position in the replay log, starting at 1
    pub seq: u64,
    /// The event
    pub event: StreamEvent,
}

impl SequencedEvent {
    /// Render as a server-sent-events frame
    ///
    /// The `id:` line carries the sequence number, so a reconnecting client's
    /// `Last-Event-ID` header maps directly onto
    /// [`attach_after`](super::StreamingSessionRegistry::attach_after).
    #[must_use]
    pub fn to_sse(&self) -> String {
        let data = match &self.event {
            StreamEvent::Data { payload } => payload.clone(),
            StreamEvent::Done => "[DONE]".to_string(),
            error @ StreamEvent::Error { .. } => {
                serde_json::to_string(error).unwrap_or_else(|_| "{}".to_string())
            }
        };

        let mut frame = format!("id: {}\nevent: {}\n", self.seq, self.event.name());
        for line in data.lines() {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
        if data.is_empty() {
            frame.push_str("data: \n");
        }
        frame.push('\n');
        frame
    }
}

// ============================================================================
// Sinks
// ============================================================================

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies an attached sink for `detach`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(u64);

impl SinkId {
    fn next() -> Self {
        Self(NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink-{}", self.0)
    }
}

/// Receiving half handed to the front door
pub type EventReceiver = mpsc::UnboundedReceiver<SequencedEvent>;

/// Sending half registered with the registry
///
/// The channel is unbounded so a slow subscriber never stalls a push that
/// holds the session lock. Dropping the sink closes the subscriber's stream.
#[derive(Debug)]
pub struct EventSink {
    id: SinkId,
    tx: mpsc::UnboundedSender<SequencedEvent>,
}

impl EventSink {
    /// Create a sink and its receiving half
    #[must_use]
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: SinkId::next(),
                tx,
            },
            rx,
        )
    }

    /// This sink's id
    #[must_use]
    pub fn id(&self) -> SinkId {
        self.id
    }

    /// Deliver an event; `false` means the subscriber has gone away
    pub(crate) fn deliver(&self, event: &SequencedEvent) -> bool {
        self.tx.send(event.clone()).is_ok()
    }
}
