//! Push-carrier framing
//!
//! Messages pushed over a long-lived carrier are length-prefixed and
//! checksummed so the client can resynchronize on a corrupted stream.
//!
//! ```text
//! +----------------+----------------+------------------------------+
//! | Length (4)     | CRC32 (4)      | JSON-RPC payload             |
//! | big-endian u32 | big-endian u32 | UTF-8 JSON                   |
//! +----------------+----------------+------------------------------+
//! ```
//!
//! The header bytes are arbitrary binary. A sink that re-encodes what it is
//! given as text will mangle them, which is why frames are only ever written
//! through a [`RawByteSink`](super::sink::RawByteSink).

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Default payload limit (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

const HEADER_LEN: usize = 8;
const COMPACT_THRESHOLD: usize = 4096;

/// Framing failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Payload larger than the configured limit
    #[error("frame payload of {size} bytes exceeds limit of {limit}")]
    TooLarge {
        /// Declared or actual payload size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Payload does not match its checksum
    #[error("frame checksum mismatch: header {expected:#010x}, payload {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the header
        expected: u32,
        /// Checksum of the received payload
        actual: u32,
    },

    /// Payload is not valid JSON for the target type
    #[error("frame payload is not valid JSON: {0}")]
    Json(String),
}

/// Encoder/decoder factory bound to a payload limit
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Create a codec with the given payload limit
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Payload limit
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Serialize `msg` into one frame
    ///
    /// # Errors
    ///
    /// `Json` if serialization fails, `TooLarge` if the payload exceeds the
    /// limit.
    pub fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, FrameError> {
        let payload = serde_json::to_vec(msg).map_err(|e| FrameError::Json(e.to_string()))?;
        let Ok(len) = u32::try_from(payload.len()) else {
            return Err(FrameError::TooLarge {
                size: payload.len(),
                limit: self.max_frame_size,
            });
        };
        if payload.len() > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size: payload.len(),
                limit: self.max_frame_size,
            });
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// A streaming decoder with this codec's limit
    #[must_use]
    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder {
            buffer: Vec::new(),
            read_pos: 0,
            max_frame_size: self.max_frame_size,
        }
    }
}

/// Incremental frame decoder
///
/// Feed arbitrary byte chunks with [`push`](Self::push); pull complete
/// messages with [`decode`](Self::decode).
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    read_pos: usize,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Append received bytes
    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos > COMPACT_THRESHOLD && self.read_pos > self.buffer.len() / 2 {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    fn header_word(&self, offset: usize) -> u32 {
        let start = self.read_pos + offset;
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.buffer[start..start + 4]);
        u32::from_be_bytes(word)
    }

    /// Decode the next complete frame, if one is buffered
    ///
    /// # Errors
    ///
    /// `TooLarge`, `ChecksumMismatch`, or `Json`. A failed frame is not
    /// consumed; callers should drop the connection.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        if self.available() < HEADER_LEN {
            return Ok(None);
        }

        let len = self.header_word(0) as usize;
        if len > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size: len,
                limit: self.max_frame_size,
            });
        }
        if self.available() < HEADER_LEN + len {
            return Ok(None);
        }

        let expected = self.header_word(4);
        let start = self.read_pos + HEADER_LEN;
        let payload = &self.buffer[start..start + len];
        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }

        let msg = serde_json::from_slice(payload).map_err(|e| FrameError::Json(e.to_string()))?;
        self.read_pos = start + len;
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::JsonRpcMessage;
    use serde_json::json;

    fn sample() -> JsonRpcMessage {
        JsonRpcMessage::response(Some(json!(7)), json!({"tools": ["search", "fetch"]}))
    }

    #[test]
    fn test_decode_across_chunk_boundaries() {
        let codec = FrameCodec::default();
        let mut bytes = codec.encode(&sample()).unwrap();
        bytes.extend(codec.encode(&JsonRpcMessage::notification("ping", None)).unwrap());

        let mut decoder = codec.decoder();
        let mut decoded: Vec<JsonRpcMessage> = Vec::new();
        for chunk in bytes.chunks(5) {
            decoder.push(chunk);
            while let Some(msg) = decoder.decode().unwrap() {
                decoded.push(msg);
            }
        }

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0], sample());
        assert!(decoded[1].is_notification());
        assert_eq!(decoder.available(), 0);
    }

    #[test]
    fn test_partial_header_needs_more() {
        let mut decoder = FrameCodec::default().decoder();
        decoder.push(&[0, 0, 0]);
        assert_eq!(decoder.decode::<JsonRpcMessage>(), Ok(None));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let codec = FrameCodec::default();
        let mut bytes = codec.encode(&sample()).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0x20;

        let mut decoder = codec.decoder();
        decoder.push(&bytes);
        assert!(matches!(
            decoder.decode::<JsonRpcMessage>(),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_size_limit_enforced_both_ways() {
        let small = FrameCodec::new(16);
        assert!(matches!(small.encode(&sample()), Err(FrameError::TooLarge { .. })));

        let mut decoder = small.decoder();
        decoder.push(&1024u32.to_be_bytes());
        decoder.push(&0u32.to_be_bytes());
        assert!(matches!(
            decoder.decode::<JsonRpcMessage>(),
            Err(FrameError::TooLarge { size: 1024, limit: 16 })
        ));
    }
}
