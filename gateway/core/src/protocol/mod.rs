//! Tool Protocol Sessions
//!
//! A JSON-RPC tool protocol reachable over two carriers:
//!
//! - **push**: one long-lived connection per client. Replies and
//!   server-initiated messages are written as CRC-checked frames to a sink
//!   registered with [`ProtocolSessionManager::open_push`].
//! - **request**: independent exchanges correlated only by a client-echoed
//!   session id. Each exchange gets its own reply sink.
//!
//! Both carriers share the [`ProtocolSessionManager`], which keys every
//! session by `(carrier, bare id)`.

use std::time::Duration;

pub mod binding;
pub mod carrier;
pub mod frame;
pub mod manager;
pub mod message;
pub mod sink;

pub use binding::{ProtocolBinding, ToolServer, UpstreamConnector};
pub use carrier::{bare_id, normalize_id, CarrierKind, NamespacedId};
pub use frame::{FrameCodec, FrameDecoder, FrameError, MAX_FRAME_SIZE};
pub use manager::{ExchangeOutcome, ManagerStats, ProtocolSessionManager};
pub use message::{JsonRpcError, JsonRpcMessage};
pub use sink::{
    BufferHandle, BufferSink, ByteSink, ChannelSink, RawByteSink, SinkError, SinkTransform,
    WriterSink,
};

/// Protocol manager configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Idle time after which a request-carrier session is reaped
    pub idle_timeout: Duration,
    /// How often the reaper runs
    pub reap_interval: Duration,
    /// Largest push frame payload
    pub max_frame_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            reap_interval: Duration::from_secs(60),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}
