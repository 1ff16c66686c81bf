//! File transfer client.
//!
//! Drives the command/response choreography over one connection: each
//! operation sends a control line and consumes the server's reply lines and,
//! for downloads, the raw data run they announce. Downloads verify the
//! announced checksum before the destination file is put into place.

use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{tcp::OwnedReadHalf, tcp::OwnedWriteHalf, TcpStream, ToSocketAddrs};
use tracing::{debug, warn};

use super::messages::{ControlMessage, FileInfo, TransferTotals};
use super::session::{SessionEvent, TransferDemux, TransferState};
use crate::codec::JsonCodec;
use crate::error::{Result, WireError};

/// Chunk size for streaming file bytes.
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Client for the file transfer protocol.
pub struct TransferClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    demux: TransferDemux,
    buf: Vec<u8>,
}

impl TransferClient {
    /// Connect to a file server.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            reader,
            writer,
            demux: TransferDemux::new(),
            buf: vec![0u8; FILE_CHUNK_SIZE],
        })
    }

    /// Fetch the server's file listing.
    pub async fn list(&mut self) -> Result<Vec<FileInfo>> {
        self.send(&ControlMessage::List).await?;
        match self.expect_control().await? {
            ControlMessage::ListResponse { files } => Ok(files),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch the server's aggregate counters.
    pub async fn stats(&mut self) -> Result<TransferTotals> {
        self.send(&ControlMessage::Stats).await?;
        match self.expect_control().await? {
            ControlMessage::StatsResponse { totals } => Ok(totals),
            other => Err(unexpected(other)),
        }
    }

    /// Delete a file on the server.
    pub async fn delete(&mut self, filename: &str) -> Result<()> {
        self.send(&ControlMessage::Delete {
            filename: filename.to_string(),
        })
        .await?;
        match self.expect_control().await? {
            ControlMessage::DeleteComplete { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Upload a local file under its own file name.
    pub async fn upload(&mut self, path: &Path) -> Result<()> {
        let filename = path
            .file_name()
            .ok_or_else(|| WireError::Protocol(format!("not a file path: {}", path.display())))?
            .to_string_lossy()
            .into_owned();

        let mut file = File::open(path).await?;
        let (size, checksum) = digest_local(&mut file).await?;

        self.send(&ControlMessage::Upload {
            filename: filename.clone(),
            size,
            checksum,
        })
        .await?;

        match self.expect_control().await? {
            ControlMessage::UploadReady { .. } => {}
            other => return Err(unexpected(other)),
        }

        // Data plane: the file's bytes, verbatim.
        loop {
            let n = file.read(&mut self.buf).await?;
            if n == 0 {
                break;
            }
            self.writer.write_all(&self.buf[..n]).await?;
        }

        match self.expect_control().await? {
            ControlMessage::UploadComplete { .. } => {
                debug!(%filename, size, "upload acknowledged");
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }

    /// Download `filename` into `dest_dir`, returning the written path.
    ///
    /// The received bytes are staged and digested as they arrive; if the
    /// digest disagrees with the announced checksum the staging file is
    /// deleted and an integrity error returned.
    pub async fn download(&mut self, filename: &str, dest_dir: &Path) -> Result<PathBuf> {
        self.send(&ControlMessage::Download {
            filename: filename.to_string(),
        })
        .await?;

        let (size, checksum) = match self.expect_control().await? {
            ControlMessage::DownloadStart { size, checksum, .. } => (size, checksum),
            other => return Err(unexpected(other)),
        };

        let final_path = dest_dir.join(filename);
        let staging = dest_dir.join(format!("{filename}.part"));
        let mut file = File::create(&staging).await?;
        let mut state = TransferState::new(filename, size, checksum);

        self.demux.begin_data_run(size);
        loop {
            match self.next_event().await? {
                SessionEvent::Data(chunk) => {
                    if let Some(percent) = state.update(&chunk) {
                        debug!(%filename, percent, "download progress");
                    }
                    file.write_all(&chunk).await?;
                }
                SessionEvent::DataEnd => break,
                SessionEvent::Control(other) => return Err(unexpected(other)),
            }
        }

        file.flush().await?;
        drop(file);

        match self.expect_control().await? {
            ControlMessage::DownloadComplete { .. } => {}
            other => {
                let _ = fs::remove_file(&staging).await;
                return Err(unexpected(other));
            }
        }

        let expected = state.expected_checksum.clone();
        match state.verify() {
            Ok(_) => {
                fs::rename(&staging, &final_path).await?;
                Ok(final_path)
            }
            Err((_, actual)) => {
                warn!(%filename, expected, actual, "download checksum mismatch");
                let _ = fs::remove_file(&staging).await;
                Err(WireError::IntegrityMismatch {
                    filename: filename.to_string(),
                    expected,
                    actual,
                })
            }
        }
    }

    /// Send one control line.
    async fn send(&mut self, message: &ControlMessage) -> Result<()> {
        let mut line = JsonCodec::encode(message)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        Ok(())
    }

    /// Pull the next control message, surfacing `ERROR` lines as errors.
    async fn expect_control(&mut self) -> Result<ControlMessage> {
        match self.next_event().await? {
            SessionEvent::Control(ControlMessage::Error { message }) => {
                Err(WireError::Peer(message))
            }
            SessionEvent::Control(message) => Ok(message),
            SessionEvent::Data(_) | SessionEvent::DataEnd => Err(WireError::Protocol(
                "data bytes where a control line was expected".to_string(),
            )),
        }
    }

    /// Pull the next demux event, reading from the socket as needed.
    async fn next_event(&mut self) -> Result<SessionEvent> {
        loop {
            if let Some(event) = self.demux.next_event()? {
                return Ok(event);
            }

            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                return Err(WireError::ConnectionClosed);
            }
            self.demux.feed(&self.buf[..n]);
        }
    }
}

fn unexpected(message: ControlMessage) -> WireError {
    WireError::Protocol(format!("unexpected control message: {message:?}"))
}

/// Size and CRC32 of a local file, leaving it rewound.
async fn digest_local(file: &mut File) -> Result<(u64, String)> {
    use tokio::io::AsyncSeekExt;

    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    file.rewind().await?;
    Ok((size, format!("{:08x}", hasher.finalize())))
}
