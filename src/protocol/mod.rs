//! Protocol module - wire format, framing, and frame reassembly.
//!
//! This module implements the binary frame layer:
//! - fixed header encoding/decoding with magic and version validation
//! - frame encoding with a trailing CRC32 payload checksum
//! - frame buffer for reassembling frames from arbitrarily-chunked reads

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{decode_frame, encode_frame, encode_frame_raw, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    checksum, kind, FrameKind, Header, CHECKSUM_SIZE, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE,
    MAGIC, MIN_FRAME_SIZE, VERSION,
};
