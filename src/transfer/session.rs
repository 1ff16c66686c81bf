//! Control/data demultiplexing and per-transfer state.
//!
//! The transfer protocol interleaves two planes on one connection:
//! newline-terminated JSON control lines, and raw unframed byte runs whose
//! length the preceding control message announced. [`TransferDemux`] slices
//! the inbound byte stream into exactly those pieces.
//!
//! Events are pulled one at a time rather than returned in batches: the
//! driver must be able to switch the demux into raw mode *between* events,
//! because a control line and the first payload bytes can arrive in the same
//! chunk. Whatever is still buffered after `begin_data_run` is then
//! reinterpreted as payload.

use bytes::{Bytes, BytesMut};

use super::messages::ControlMessage;
use crate::error::{Result, WireError};

/// Maximum accepted control line length.
///
/// A peer that streams megabytes without a newline is not speaking the
/// control protocol; cap the damage.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// One demultiplexed piece of the inbound stream.
#[derive(Debug)]
pub enum SessionEvent {
    /// A parsed control line.
    Control(ControlMessage),
    /// A chunk of the active raw data run (never empty).
    Data(Bytes),
    /// The announced byte count has been satisfied; back in control mode.
    DataEnd,
}

/// Demux read mode.
#[derive(Debug)]
enum Mode {
    /// Accumulating a control line up to the next newline.
    Control,
    /// Passing through raw bytes of a known remaining length.
    Data { remaining: u64 },
    /// Raw run satisfied; emit [`SessionEvent::DataEnd`] next.
    DataDone,
}

/// Splits one connection's inbound bytes into control lines and data runs.
pub struct TransferDemux {
    buffer: BytesMut,
    mode: Mode,
}

impl TransferDemux {
    /// Create a demux in control mode.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            mode: Mode::Control,
        }
    }

    /// Append bytes read from the socket.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Switch to raw mode for exactly `expected` bytes.
    ///
    /// Bytes already buffered count toward the run. A zero-length run
    /// completes immediately.
    pub fn begin_data_run(&mut self, expected: u64) {
        self.mode = if expected == 0 {
            Mode::DataDone
        } else {
            Mode::Data {
                remaining: expected,
            }
        };
    }

    /// Whether a data run is currently active.
    pub fn in_data_run(&self) -> bool {
        matches!(self.mode, Mode::Data { .. } | Mode::DataDone)
    }

    /// Number of buffered, not-yet-consumed bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pull the next event, or `None` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// A control line that is not valid JSON for the command vocabulary, or
    /// that exceeds the line length cap, yields a protocol error. The
    /// offending line is consumed; the stream itself stays aligned on the
    /// next newline, so the caller may keep the connection open and report
    /// the error in-band.
    pub fn next_event(&mut self) -> Result<Option<SessionEvent>> {
        match self.mode {
            Mode::Control => self.next_control_line(),
            Mode::Data { remaining } => {
                if self.buffer.is_empty() {
                    return Ok(None);
                }

                let take = remaining.min(self.buffer.len() as u64) as usize;
                let chunk = self.buffer.split_to(take).freeze();

                let left = remaining - take as u64;
                self.mode = if left == 0 {
                    Mode::DataDone
                } else {
                    Mode::Data { remaining: left }
                };

                Ok(Some(SessionEvent::Data(chunk)))
            }
            Mode::DataDone => {
                self.mode = Mode::Control;
                Ok(Some(SessionEvent::DataEnd))
            }
        }
    }

    fn next_control_line(&mut self) -> Result<Option<SessionEvent>> {
        let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') else {
            if self.buffer.len() > MAX_LINE_LENGTH {
                self.buffer.clear();
                return Err(WireError::Protocol(format!(
                    "control line exceeds {MAX_LINE_LENGTH} bytes"
                )));
            }
            return Ok(None);
        };

        let line = self.buffer.split_to(newline + 1);
        let text = &line[..newline];
        // Tolerate CRLF peers.
        let text = text.strip_suffix(b"\r").unwrap_or(text);

        let message: ControlMessage = serde_json::from_slice(text).map_err(|e| {
            WireError::Protocol(format!("bad control line: {e}"))
        })?;

        Ok(Some(SessionEvent::Control(message)))
    }
}

impl Default for TransferDemux {
    fn default() -> Self {
        Self::new()
    }
}

/// State of one active transfer, created when a transfer-start control
/// message is seen and destroyed once the announced byte count is satisfied.
#[derive(Debug)]
pub struct TransferState {
    /// File being transferred.
    pub filename: String,
    /// Announced byte count.
    pub expected_size: u64,
    /// Announced whole-file checksum (lowercase hex CRC32).
    pub expected_checksum: String,
    /// Bytes seen so far.
    pub bytes_transferred: u64,
    /// Running digest over the bytes seen so far.
    hasher: crc32fast::Hasher,
    /// Last progress decile reported (0-10).
    last_progress_decile: u8,
}

impl TransferState {
    /// Start tracking a transfer.
    pub fn new(filename: impl Into<String>, expected_size: u64, expected_checksum: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            expected_size,
            expected_checksum: expected_checksum.into(),
            bytes_transferred: 0,
            hasher: crc32fast::Hasher::new(),
            last_progress_decile: 0,
        }
    }

    /// Account a chunk of transferred bytes.
    ///
    /// Returns `Some(percent)` each time progress crosses a 10% boundary,
    /// so observers are not flooded per-chunk.
    pub fn update(&mut self, chunk: &[u8]) -> Option<u8> {
        self.bytes_transferred += chunk.len() as u64;
        self.hasher.update(chunk);

        let decile = if self.expected_size == 0 {
            10
        } else {
            ((self.bytes_transferred * 10) / self.expected_size).min(10) as u8
        };

        if decile > self.last_progress_decile {
            self.last_progress_decile = decile;
            Some(decile * 10)
        } else {
            None
        }
    }

    /// Whether the announced byte count has been reached.
    pub fn is_complete(&self) -> bool {
        self.bytes_transferred == self.expected_size
    }

    /// Finish the running digest as lowercase hex.
    pub fn finalize(self) -> String {
        format!("{:08x}", self.hasher.finalize())
    }

    /// Finish the digest and compare it to the announced checksum.
    pub fn verify(self) -> std::result::Result<String, (String, String)> {
        let expected = self.expected_checksum.clone();
        let actual = self.finalize();
        if actual == expected {
            Ok(actual)
        } else {
            Err((expected, actual))
        }
    }
}

/// Lowercase hex CRC32 of a byte slice, as used for announced checksums.
pub fn file_checksum(bytes: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control_line(msg: &ControlMessage) -> Vec<u8> {
        let mut line = serde_json::to_vec(msg).unwrap();
        line.push(b'\n');
        line
    }

    #[test]
    fn parses_one_control_line() {
        let mut demux = TransferDemux::new();
        demux.feed(&control_line(&ControlMessage::List));

        let event = demux.next_event().unwrap().unwrap();
        assert!(matches!(
            event,
            SessionEvent::Control(ControlMessage::List)
        ));
        assert!(demux.next_event().unwrap().is_none());
    }

    #[test]
    fn incomplete_line_waits() {
        let mut demux = TransferDemux::new();
        demux.feed(br#"{"command":"LI"#);

        assert!(demux.next_event().unwrap().is_none());

        demux.feed(b"ST\"}\n");
        assert!(matches!(
            demux.next_event().unwrap().unwrap(),
            SessionEvent::Control(ControlMessage::List)
        ));
    }

    #[test]
    fn crlf_line_accepted() {
        let mut demux = TransferDemux::new();
        demux.feed(b"{\"command\":\"STATS\"}\r\n");

        assert!(matches!(
            demux.next_event().unwrap().unwrap(),
            SessionEvent::Control(ControlMessage::Stats)
        ));
    }

    #[test]
    fn bad_control_line_is_protocol_error_but_stream_continues() {
        let mut demux = TransferDemux::new();
        demux.feed(b"not json\n");
        demux.feed(&control_line(&ControlMessage::Stats));

        assert!(matches!(
            demux.next_event(),
            Err(WireError::Protocol(_))
        ));
        // The next line is still parseable.
        assert!(matches!(
            demux.next_event().unwrap().unwrap(),
            SessionEvent::Control(ControlMessage::Stats)
        ));
    }

    #[test]
    fn control_line_and_data_in_same_chunk() {
        // The demux must slice off exactly the control portion before
        // treating the remainder as payload.
        let mut demux = TransferDemux::new();

        let mut wire = control_line(&ControlMessage::UploadReady {
            filename: "f".into(),
        });
        wire.extend_from_slice(b"PAYLOAD");
        demux.feed(&wire);

        let SessionEvent::Control(_) = demux.next_event().unwrap().unwrap() else {
            panic!("expected control event");
        };

        demux.begin_data_run(7);
        let SessionEvent::Data(chunk) = demux.next_event().unwrap().unwrap() else {
            panic!("expected data event");
        };
        assert_eq!(&chunk[..], b"PAYLOAD");

        assert!(matches!(
            demux.next_event().unwrap().unwrap(),
            SessionEvent::DataEnd
        ));
        assert!(!demux.in_data_run());
    }

    #[test]
    fn data_run_spanning_chunks() {
        let mut demux = TransferDemux::new();
        demux.begin_data_run(10);

        demux.feed(b"0123");
        let SessionEvent::Data(a) = demux.next_event().unwrap().unwrap() else {
            panic!()
        };
        assert_eq!(&a[..], b"0123");
        assert!(demux.next_event().unwrap().is_none());

        demux.feed(b"456789");
        let SessionEvent::Data(b) = demux.next_event().unwrap().unwrap() else {
            panic!()
        };
        assert_eq!(&b[..], b"456789");
        assert!(matches!(
            demux.next_event().unwrap().unwrap(),
            SessionEvent::DataEnd
        ));
    }

    #[test]
    fn data_run_followed_by_control_in_same_chunk() {
        let mut demux = TransferDemux::new();
        demux.begin_data_run(4);

        let mut wire = b"DATA".to_vec();
        wire.extend(control_line(&ControlMessage::Stats));
        demux.feed(&wire);

        assert!(matches!(
            demux.next_event().unwrap().unwrap(),
            SessionEvent::Data(_)
        ));
        assert!(matches!(
            demux.next_event().unwrap().unwrap(),
            SessionEvent::DataEnd
        ));
        assert!(matches!(
            demux.next_event().unwrap().unwrap(),
            SessionEvent::Control(ControlMessage::Stats)
        ));
    }

    #[test]
    fn zero_length_run_completes_immediately() {
        let mut demux = TransferDemux::new();
        demux.begin_data_run(0);

        assert!(matches!(
            demux.next_event().unwrap().unwrap(),
            SessionEvent::DataEnd
        ));
        assert!(!demux.in_data_run());
    }

    #[test]
    fn oversized_control_line_rejected() {
        let mut demux = TransferDemux::new();
        demux.feed(&vec![b'x'; MAX_LINE_LENGTH + 1]);

        assert!(matches!(
            demux.next_event(),
            Err(WireError::Protocol(_))
        ));
    }

    #[test]
    fn transfer_state_progress_deciles() {
        let mut state = TransferState::new("f", 100, "00000000");

        assert_eq!(state.update(&[0u8; 5]), None);
        assert_eq!(state.update(&[0u8; 5]), Some(10));
        assert_eq!(state.update(&[0u8; 5]), None);
        assert_eq!(state.update(&[0u8; 75]), Some(90));
        assert_eq!(state.update(&[0u8; 10]), Some(100));
        assert!(state.is_complete());
    }

    #[test]
    fn transfer_state_digest_matches_file_checksum() {
        let data = b"the quick brown fox";
        let mut state = TransferState::new("f", data.len() as u64, file_checksum(data));

        state.update(&data[..7]);
        state.update(&data[7..]);

        assert!(state.is_complete());
        assert!(state.verify().is_ok());
    }

    #[test]
    fn transfer_state_detects_corruption() {
        let data = b"the quick brown fox";
        let mut corrupted = data.to_vec();
        corrupted[3] ^= 0x01;

        let mut state = TransferState::new("f", data.len() as u64, file_checksum(data));
        state.update(&corrupted);

        let (expected, actual) = state.verify().unwrap_err();
        assert_ne!(expected, actual);
    }
}
