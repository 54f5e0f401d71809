//! Outbound byte sinks
//!
//! Transports hand the protocol manager something it can write bytes into.
//! Some of those targets apply a transform on the way out; the common one is
//! text mode, which re-encodes whatever it receives as UTF-8 and replaces
//! invalid sequences. That is harmless for JSON and fatal for binary frame
//! headers.
//!
//! [`ByteSink`] makes the transform part of the interface, and
//! [`RawByteSink`] is the only thing protocol bindings write through: it
//! switches the sink to [`SinkTransform::Identity`] when constructed and
//! refuses sinks that cannot honour that.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// How a sink alters bytes before they leave
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkTransform {
    /// Bytes pass through untouched
    Identity,
    /// Bytes are decoded as UTF-8 (lossily) and re-encoded
    Utf8Text,
}

impl SinkTransform {
    /// Apply the transform
    #[must_use]
    pub fn apply(self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Self::Identity => bytes.to_vec(),
            Self::Utf8Text => String::from_utf8_lossy(bytes).into_owned().into_bytes(),
        }
    }
}

/// Sink failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The receiving side has gone away
    #[error("sink closed")]
    Closed,

    /// The sink cannot switch to the requested transform
    #[error("sink does not support {0:?} transform")]
    TransformRejected(SinkTransform),

    /// Underlying I/O failure
    #[error("sink I/O error: {0}")]
    Io(String),
}

/// A transport-provided destination for outbound bytes
#[async_trait]
pub trait ByteSink: Send + Sync {
    /// The transform currently in effect
    fn transform(&self) -> SinkTransform;

    /// Change the transform
    ///
    /// # Errors
    ///
    /// `TransformRejected` if the sink cannot operate in that mode.
    fn set_transform(&mut self, transform: SinkTransform) -> Result<(), SinkError>;

    /// Write bytes, after applying the current transform
    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), SinkError>;

    /// Flush and close; further writes fail with `Closed`
    async fn close(&mut self) -> Result<(), SinkError>;
}

// ============================================================================
// RawByteSink
// ============================================================================

/// A sink guaranteed to be in identity mode
pub struct RawByteSink {
    inner: Box<dyn ByteSink>,
}

impl RawByteSink {
    /// Switch `inner` to identity mode and wrap it
    ///
    /// # Errors
    ///
    /// `TransformRejected` if the sink refuses identity mode, or reports a
    /// different transform after accepting it.
    pub fn new(mut inner: Box<dyn ByteSink>) -> Result<Self, SinkError> {
        inner.set_transform(SinkTransform::Identity)?;
        if inner.transform() != SinkTransform::Identity {
            return Err(SinkError::TransformRejected(SinkTransform::Identity));
        }
        Ok(Self { inner })
    }

    /// Write bytes verbatim
    ///
    /// # Errors
    ///
    /// Whatever the underlying sink reports.
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        self.inner.write_bytes(bytes).await
    }

    /// Close the underlying sink
    ///
    /// # Errors
    ///
    /// Whatever the underlying sink reports.
    pub async fn close(&mut self) -> Result<(), SinkError> {
        self.inner.close().await
    }
}

impl std::fmt::Debug for RawByteSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawByteSink").finish_non_exhaustive()
    }
}

// ============================================================================
// Implementations
// ============================================================================

/// Forwards writes over an mpsc channel to a connection writer task
///
/// Starts in text mode, like most line-oriented transports.
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    transform: SinkTransform,
}

impl ChannelSink {
    /// Create a channel sink and its receiving half
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Some(tx),
                transform: SinkTransform::Utf8Text,
            },
            rx,
        )
    }
}

#[async_trait]
impl ByteSink for ChannelSink {
    fn transform(&self) -> SinkTransform {
        self.transform
    }

    fn set_transform(&mut self, transform: SinkTransform) -> Result<(), SinkError> {
        self.transform = transform;
        Ok(())
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        let tx = self.tx.as_ref().ok_or(SinkError::Closed)?;
        tx.send(self.transform.apply(bytes))
            .await
            .map_err(|_| SinkError::Closed)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.tx = None;
        Ok(())
    }
}

/// Collects writes in memory; the request carrier's reply body
pub struct BufferSink {
    buf: Arc<Mutex<Vec<u8>>>,
    closed: Arc<Mutex<bool>>,
    transform: SinkTransform,
}

/// Read side of a [`BufferSink`]
#[derive(Clone, Debug)]
pub struct BufferHandle {
    buf: Arc<Mutex<Vec<u8>>>,
    closed: Arc<Mutex<bool>>,
}

impl BufferHandle {
    /// Bytes written so far
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }

    /// Whether the sink has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl BufferSink {
    /// Create a buffer sink (identity mode) and its read handle
    #[must_use]
    pub fn new() -> (Self, BufferHandle) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        (
            Self {
                buf: Arc::clone(&buf),
                closed: Arc::clone(&closed),
                transform: SinkTransform::Identity,
            },
            BufferHandle { buf, closed },
        )
    }
}

#[async_trait]
impl ByteSink for BufferSink {
    fn transform(&self) -> SinkTransform {
        self.transform
    }

    fn set_transform(&mut self, transform: SinkTransform) -> Result<(), SinkError> {
        self.transform = transform;
        Ok(())
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        if *self.closed.lock() {
            return Err(SinkError::Closed);
        }
        self.buf.lock().extend(self.transform.apply(bytes));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        *self.closed.lock() = true;
        Ok(())
    }
}

/// Adapts any tokio writer (a socket half, a pipe) into a sink
pub struct WriterSink<W> {
    writer: Option<W>,
}

impl<W> WriterSink<W> {
    /// Wrap a writer; writers carry raw bytes, so this is identity-only
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }
}

#[async_trait]
impl<W> ByteSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send + Sync,
{
    fn transform(&self) -> SinkTransform {
        SinkTransform::Identity
    }

    fn set_transform(&mut self, transform: SinkTransform) -> Result<(), SinkError> {
        match transform {
            SinkTransform::Identity => Ok(()),
            other => Err(SinkError::TransformRejected(other)),
        }
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::Closed)?;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| SinkError::Io(e.to_string()))?;
        writer.flush().await.map_err(|e| SinkError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .shutdown()
                .await
                .map_err(|e| SinkError::Io(e.to_string()))?;
        }
        Ok(())
    }
}
