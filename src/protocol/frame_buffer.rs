//! Frame buffer for accumulating partial reads.
//!
//! Bytes are only ever appended at the tail and consumed from the head;
//! frames come out in exact wire order. Each push loops
//! [`decode_frame`](super::frame::decode_frame) over the buffer, dropping
//! exactly the consumed bytes per extracted frame and stopping as soon as
//! only a partial frame remains.
//!
//! The header is validated (magic, version, length cap) as soon as it is
//! readable, before any payload is buffered past the cap. A framing error
//! discards the entire buffer: the protocol has no resynchronization marker,
//! so nothing after the corruption can be trusted.
//!
//! # Example
//!
//! ```
//! use streamwire::protocol::{encode_frame, FrameBuffer, FrameKind};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = encode_frame(FrameKind::Ping, b"{}");
//!
//! // Data arrives in chunks from the socket.
//! let frames = buffer.push(&bytes[..5]).unwrap();
//! assert!(frames.is_empty());
//!
//! let frames = buffer.push(&bytes[5..]).unwrap();
//! assert_eq!(frames.len(), 1);
//! ```

use bytes::BytesMut;

use super::frame::{decode_frame, Frame};
use super::wire_format::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::error::Result;

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Owned exclusively by one connection: created on accept, fed on every
/// socket read, destroyed on close. Bytes of a partial frame stay buffered
/// untouched until the whole frame (checksum included) has arrived.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Maximum allowed payload size.
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with a custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns the frames completed by this chunk, in wire order; an empty
    /// vector means the buffered bytes still form only a partial frame. A
    /// single push can complete zero, one, or many frames.
    ///
    /// # Errors
    ///
    /// Returns a framing error (bad magic, bad version, oversized length,
    /// checksum mismatch) and discards the whole buffer — the stream cannot
    /// be resynchronized and the connection should be dropped.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            match decode_frame(&self.buffer, self.max_payload_size) {
                Ok(Some((frame, consumed))) => {
                    let _ = self.buffer.split_to(consumed);
                    frames.push(frame);
                }
                Ok(None) => break,
                Err(e) => {
                    self.clear();
                    return Err(e);
                }
            }
        }

        Ok(frames)
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
