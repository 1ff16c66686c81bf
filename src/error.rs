//! Error types for streamwire.

use thiserror::Error;

/// Main error type for all streamwire operations.
#[derive(Debug, Error)]
pub enum WireError {
    /// I/O error during socket or file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame began with the wrong magic bytes.
    #[error("bad magic: 0x{0:04X}")]
    BadMagic(u16),

    /// Frame carried an unsupported protocol version.
    #[error("unsupported version: {0}")]
    BadVersion(u8),

    /// Frame checksum did not match the payload.
    #[error("checksum mismatch: stored 0x{stored:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    /// Announced payload length exceeds the configured maximum.
    #[error("payload size {length} exceeds maximum {max}")]
    PayloadTooLarge { length: u32, max: u32 },

    /// Protocol violation outside the framing layer (bad control line, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peer reported an application error in-band.
    #[error("peer error: {0}")]
    Peer(String),

    /// Transferred data did not match the announced digest.
    #[error("integrity mismatch for {filename}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    /// Connection closed while a reply or transfer was still outstanding.
    #[error("connection closed")]
    ConnectionClosed,
}

impl WireError {
    /// Whether this error poisons the byte stream.
    ///
    /// Framing errors leave the stream unrecoverable (there is no
    /// resynchronization marker); the connection must be dropped.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            WireError::BadMagic(_)
                | WireError::BadVersion(_)
                | WireError::ChecksumMismatch { .. }
                | WireError::PayloadTooLarge { .. }
        )
    }
}

/// Result type alias using WireError.
pub type Result<T> = std::result::Result<T, WireError>;
