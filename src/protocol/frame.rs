//! Frame struct and frame encoding.
//!
//! A [`Frame`] is one complete protocol message. Uses `bytes::Bytes` for
//! zero-copy payload sharing; the raw kind byte is preserved so that frames
//! with unknown kinds can still be answered by the dispatcher.

use bytes::Bytes;

use super::wire_format::{checksum, FrameKind, Header, CHECKSUM_SIZE, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw kind byte from the wire.
    pub kind_byte: u8,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from a typed kind and payload.
    pub fn new(kind: FrameKind, payload: Bytes) -> Self {
        Self {
            kind_byte: kind.as_byte(),
            payload,
        }
    }

    /// Create a frame from a raw kind byte (possibly unknown) and payload.
    pub fn from_raw(kind_byte: u8, payload: Bytes) -> Self {
        Self { kind_byte, payload }
    }

    /// Typed view of the kind byte, if it is a known value.
    #[inline]
    pub fn kind(&self) -> Option<FrameKind> {
        FrameKind::from_byte(self.kind_byte)
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Total encoded size of this frame on the wire.
    #[inline]
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len() + CHECKSUM_SIZE
    }

    /// Encode this frame to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        encode_frame_raw(self.kind_byte, &self.payload)
    }
}

/// Encode a frame as a single byte vector: header, payload, trailing CRC32.
///
/// Pure function with no error conditions.
pub fn encode_frame(kind: FrameKind, payload: &[u8]) -> Vec<u8> {
    encode_frame_raw(kind.as_byte(), payload)
}

/// Encode a frame with a raw kind byte.
pub fn encode_frame_raw(kind_byte: u8, payload: &[u8]) -> Vec<u8> {
    let header = Header::new(kind_byte, payload.len() as u32);
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CHECKSUM_SIZE);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&checksum(payload).to_be_bytes());
    buf
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns the frame together with the exact number of bytes it occupied,
/// so the caller can advance its buffer precisely. `Ok(None)` means the
/// buffer holds only a partial frame — feed more bytes and retry.
///
/// Validation order: magic and version are checked before anything else is
/// interpreted, the announced length is capped before the payload is
/// awaited, and the trailing checksum is verified once the payload is
/// present. Payload JSON is never parsed here; that is the caller's
/// concern.
pub fn decode_frame(
    buf: &[u8],
    max_payload_size: u32,
) -> crate::error::Result<Option<(Frame, usize)>> {
    let header = match Header::decode(buf)? {
        Some(header) => header,
        None => return Ok(None),
    };
    header.validate(max_payload_size)?;

    let payload_len = header.length as usize;
    let total = HEADER_SIZE + payload_len + CHECKSUM_SIZE;
    if buf.len() < total {
        return Ok(None);
    }

    let payload = Bytes::copy_from_slice(&buf[HEADER_SIZE..HEADER_SIZE + payload_len]);
    let stored = u32::from_be_bytes(
        buf[HEADER_SIZE + payload_len..total]
            .try_into()
            .expect("checksum slice is 4 bytes"),
    );

    let computed = checksum(&payload);
    if stored != computed {
        return Err(crate::error::WireError::ChecksumMismatch { stored, computed });
    }

    Ok(Some((Frame::from_raw(header.kind, payload), total)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire_format::kind;

    #[test]
    fn frame_creation() {
        let frame = Frame::new(FrameKind::Request, Bytes::from_static(b"hello"));

        assert_eq!(frame.kind(), Some(FrameKind::Request));
        assert_eq!(frame.kind_byte, kind::REQUEST);
        assert_eq!(frame.payload(), b"hello");
        assert_eq!(frame.payload_len(), 5);
    }

    #[test]
    fn frame_unknown_kind_preserved() {
        let frame = Frame::from_raw(0x42, Bytes::new());

        assert_eq!(frame.kind(), None);
        assert_eq!(frame.kind_byte, 0x42);
    }

    #[test]
    fn encode_layout() {
        let bytes = encode_frame(FrameKind::Ping, b"{}");

        assert_eq!(bytes.len(), HEADER_SIZE + 2 + CHECKSUM_SIZE);
        assert_eq!(bytes[3], kind::PING);
        assert_eq!(&bytes[HEADER_SIZE..HEADER_SIZE + 2], b"{}");

        let stored = u32::from_be_bytes(bytes[HEADER_SIZE + 2..].try_into().unwrap());
        assert_eq!(stored, checksum(b"{}"));
    }

    #[test]
    fn encode_empty_payload() {
        let bytes = encode_frame(FrameKind::Pong, b"");
        assert_eq!(bytes.len(), HEADER_SIZE + CHECKSUM_SIZE);
    }

    #[test]
    fn wire_len_matches_encoding() {
        let frame = Frame::new(FrameKind::Response, Bytes::from_static(b"abcdef"));
        assert_eq!(frame.wire_len(), frame.encode().len());
    }

    #[test]
    fn decode_roundtrip_consumes_exact_length() {
        use crate::protocol::wire_format::DEFAULT_MAX_PAYLOAD_SIZE;

        for payload in [b"" as &[u8], b"{}", b"{\"text\":\"abc\"}"] {
            let wire = encode_frame(FrameKind::Request, payload);
            let (frame, consumed) = decode_frame(&wire, DEFAULT_MAX_PAYLOAD_SIZE)
                .unwrap()
                .expect("complete frame");

            assert_eq!(frame.kind(), Some(FrameKind::Request));
            assert_eq!(frame.payload(), payload);
            assert_eq!(consumed, wire.len());
        }
    }

    #[test]
    fn decode_incomplete_returns_none() {
        use crate::protocol::wire_format::DEFAULT_MAX_PAYLOAD_SIZE;

        let wire = encode_frame(FrameKind::Ping, b"{\"seq\":1}");
        for cut in 0..wire.len() {
            let result = decode_frame(&wire[..cut], DEFAULT_MAX_PAYLOAD_SIZE).unwrap();
            assert!(result.is_none(), "cut at {cut} produced a frame");
        }
    }

    #[test]
    fn decode_trailing_bytes_left_alone() {
        use crate::protocol::wire_format::DEFAULT_MAX_PAYLOAD_SIZE;

        let mut wire = encode_frame(FrameKind::Ping, b"one");
        let first_len = wire.len();
        wire.extend(encode_frame(FrameKind::Pong, b"two"));

        let (frame, consumed) = decode_frame(&wire, DEFAULT_MAX_PAYLOAD_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(frame.payload(), b"one");
        assert_eq!(consumed, first_len);
    }
}
