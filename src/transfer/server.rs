//! File transfer server.
//!
//! Serves one directory over the hybrid control/data protocol. Each
//! connection runs a command loop over a [`TransferDemux`]; uploads are
//! staged under a `.part` suffix and only renamed into place once the
//! announced byte count arrived and the running digest matches the
//! announced checksum. A connection lost mid-upload leaves no artifact
//! behind that could pass for a completed file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{tcp::OwnedWriteHalf, TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::messages::{ControlMessage, FileInfo, TransferTotals};
use super::session::{SessionEvent, TransferDemux, TransferState};
use crate::codec::JsonCodec;
use crate::error::Result;

/// Chunk size for streaming file bytes.
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Staging suffix for uploads in flight.
const STAGING_SUFFIX: &str = ".part";

/// Aggregate counters across all transfer connections.
#[derive(Debug, Default)]
pub struct TransferStats {
    pub connections: AtomicU64,
    pub downloads: AtomicU64,
    pub uploads: AtomicU64,
    pub deletes: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl TransferStats {
    /// Snapshot as the wire representation.
    pub fn totals(&self) -> TransferTotals {
        TransferTotals {
            connections: self.connections.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// File server configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// Directory whose files are served; nothing outside it is reachable.
    pub root: PathBuf,
}

/// File transfer server over one served directory.
pub struct FileServer {
    listener: TcpListener,
    root: PathBuf,
    stats: Arc<TransferStats>,
}

impl FileServer {
    /// Bind the server. The served root must already exist.
    pub async fn bind(config: TransferConfig) -> Result<Self> {
        let root = fs::canonicalize(&config.root).await?;
        let listener = TcpListener::bind(config.bind_addr).await?;

        Ok(Self {
            listener,
            root,
            stats: Arc::new(TransferStats::default()),
        })
    }

    /// The address the server is actually listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared transfer counters.
    pub fn stats(&self) -> Arc<TransferStats> {
        self.stats.clone()
    }

    /// Accept connections forever.
    pub async fn run(&self) -> Result<()> {
        info!(addr = %self.local_addr()?, root = %self.root.display(), "file server listening");

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "broken connection on accept");
                    continue;
                }
            };

            self.stats.connections.fetch_add(1, Ordering::Relaxed);
            info!(%addr, "transfer connection accepted");

            let root = self.root.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, root, stats).await {
                    warn!(%addr, error = %e, "transfer connection ended with error");
                }
                info!(%addr, "transfer connection closed");
            });
        }
    }
}

/// Upload in flight on one connection.
struct ActiveUpload {
    state: TransferState,
    file: File,
    staging: PathBuf,
    final_path: PathBuf,
}

/// Per-connection command loop.
async fn handle_connection(
    stream: TcpStream,
    root: PathBuf,
    stats: Arc<TransferStats>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut demux = TransferDemux::new();
    let mut upload: Option<ActiveUpload> = None;
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];

    let outcome = loop {
        loop {
            let event = match demux.next_event() {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    // The offending line is consumed; report in-band and
                    // keep the connection.
                    warn!(error = %e, "bad control line");
                    write_line(
                        &mut writer,
                        &ControlMessage::Error {
                            message: e.to_string(),
                        },
                    )
                    .await?;
                    continue;
                }
            };

            match event {
                SessionEvent::Control(message) => {
                    handle_command(message, &root, &stats, &mut writer, &mut demux, &mut upload)
                        .await?;
                }
                SessionEvent::Data(chunk) => {
                    let active = upload.as_mut().expect("data run without active upload");
                    stats
                        .bytes_received
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    if let Some(percent) = active.state.update(&chunk) {
                        debug!(
                            filename = %active.state.filename,
                            percent,
                            "upload progress"
                        );
                    }
                    active.file.write_all(&chunk).await?;
                }
                SessionEvent::DataEnd => {
                    let active = upload.take().expect("data end without active upload");
                    finish_upload(active, &stats, &mut writer).await?;
                }
            }
        }

        match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => demux.feed(&buf[..n]),
            Err(e) => break Err(e.into()),
        }
    };

    // Disconnect mid-upload: remove the staging file so a truncated upload
    // can never pass for a complete one.
    if let Some(active) = upload.take() {
        warn!(
            filename = %active.state.filename,
            received = active.state.bytes_transferred,
            expected = active.state.expected_size,
            "connection lost mid-upload, removing staging file"
        );
        drop(active.file);
        let _ = fs::remove_file(&active.staging).await;
    }

    outcome
}

/// Route one control command.
async fn handle_command(
    message: ControlMessage,
    root: &Path,
    stats: &Arc<TransferStats>,
    writer: &mut OwnedWriteHalf,
    demux: &mut TransferDemux,
    upload: &mut Option<ActiveUpload>,
) -> Result<()> {
    match message {
        ControlMessage::List => {
            let files = list_files(root).await?;
            write_line(writer, &ControlMessage::ListResponse { files }).await
        }

        ControlMessage::Download { filename } => {
            let path = match resolve(root, &filename) {
                Ok(path) => path,
                Err(message) => return write_line(writer, &ControlMessage::Error { message }).await,
            };

            let mut file = match File::open(&path).await {
                Ok(file) => file,
                Err(_) => {
                    return write_line(
                        writer,
                        &ControlMessage::Error {
                            message: format!("file not found: {filename}"),
                        },
                    )
                    .await
                }
            };

            let (size, checksum) = digest_file(&mut file).await?;
            write_line(
                writer,
                &ControlMessage::DownloadStart {
                    filename: filename.clone(),
                    size,
                    checksum: checksum.clone(),
                },
            )
            .await?;

            stream_file(&mut file, size, &filename, &checksum, stats, writer).await?;
            stats.downloads.fetch_add(1, Ordering::Relaxed);
            write_line(writer, &ControlMessage::DownloadComplete { filename }).await
        }

        ControlMessage::Upload {
            filename,
            size,
            checksum,
        } => {
            let final_path = match resolve(root, &filename) {
                Ok(path) => path,
                Err(message) => return write_line(writer, &ControlMessage::Error { message }).await,
            };

            let staging = staging_path(&final_path);
            let file = File::create(&staging).await?;

            write_line(
                writer,
                &ControlMessage::UploadReady {
                    filename: filename.clone(),
                },
            )
            .await?;

            // Everything already buffered past the UPLOAD line is payload.
            *upload = Some(ActiveUpload {
                state: TransferState::new(filename, size, checksum),
                file,
                staging,
                final_path,
            });
            demux.begin_data_run(size);
            Ok(())
        }

        ControlMessage::Delete { filename } => {
            let path = match resolve(root, &filename) {
                Ok(path) => path,
                Err(message) => return write_line(writer, &ControlMessage::Error { message }).await,
            };

            match fs::remove_file(&path).await {
                Ok(()) => {
                    stats.deletes.fetch_add(1, Ordering::Relaxed);
                    write_line(writer, &ControlMessage::DeleteComplete { filename }).await
                }
                Err(_) => {
                    write_line(
                        writer,
                        &ControlMessage::Error {
                            message: format!("file not found: {filename}"),
                        },
                    )
                    .await
                }
            }
        }

        ControlMessage::Stats => {
            write_line(
                writer,
                &ControlMessage::StatsResponse {
                    totals: stats.totals(),
                },
            )
            .await
        }

        // Response-shaped commands have no business arriving at the server.
        other => {
            write_line(
                writer,
                &ControlMessage::Error {
                    message: format!("unsupported command: {other:?}"),
                },
            )
            .await
        }
    }
}

/// Close out a fully received upload: verify the digest, then rename or
/// delete the staging file.
async fn finish_upload(
    mut active: ActiveUpload,
    stats: &Arc<TransferStats>,
    writer: &mut OwnedWriteHalf,
) -> Result<()> {
    active.file.flush().await?;
    drop(active.file);

    let filename = active.state.filename.clone();
    let size = active.state.expected_size;

    match active.state.verify() {
        Ok(checksum) => {
            fs::rename(&active.staging, &active.final_path).await?;
            stats.uploads.fetch_add(1, Ordering::Relaxed);
            info!(%filename, size, "upload complete");
            write_line(
                writer,
                &ControlMessage::UploadComplete {
                    filename,
                    size,
                    checksum,
                },
            )
            .await
        }
        Err((expected, actual)) => {
            let _ = fs::remove_file(&active.staging).await;
            warn!(%filename, expected, actual, "upload checksum mismatch");
            write_line(
                writer,
                &ControlMessage::Error {
                    message: format!(
                        "checksum mismatch for {filename}: expected {expected}, got {actual}"
                    ),
                },
            )
            .await
        }
    }
}

/// Resolve a client-supplied filename against the served root.
///
/// Only bare names are accepted; separators, parent components and absolute
/// paths are path-traversal attempts and rejected outright.
fn resolve(root: &Path, filename: &str) -> std::result::Result<PathBuf, String> {
    if filename.is_empty() {
        return Err("empty filename".to_string());
    }
    if filename.contains('/') || filename.contains('\\') {
        return Err(format!("invalid filename: {filename}"));
    }
    if filename == "." || filename == ".." {
        return Err(format!("invalid filename: {filename}"));
    }

    let path = root.join(filename);
    // Belt and braces: the join of a bare name must stay directly under root.
    if path.parent() != Some(root) {
        return Err(format!("invalid filename: {filename}"));
    }
    Ok(path)
}

fn staging_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .expect("resolved path has a file name")
        .to_os_string();
    name.push(STAGING_SUFFIX);
    final_path.with_file_name(name)
}

/// List regular files in the served root.
async fn list_files(root: &Path) -> Result<Vec<FileInfo>> {
    let mut entries = fs::read_dir(root).await?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }

        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        files.push(FileInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            size: metadata.len(),
            modified,
        });
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// Size and whole-file CRC32, leaving the file rewound to the start.
async fn digest_file(file: &mut File) -> Result<(u64, String)> {
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

/// Stream a file's bytes verbatim onto the data plane.
async fn stream_file(
    file: &mut File,
    size: u64,
    filename: &str,
    checksum: &str,
    stats: &Arc<TransferStats>,
    writer: &mut OwnedWriteHalf,
) -> Result<()> {
    let mut progress = TransferState::new(filename, size, checksum);
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        stats.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        if let Some(percent) = progress.update(&buf[..n]) {
            debug!(%filename, percent, "download progress");
        }
    }

    Ok(())
}

/// Write one newline-terminated control message.
async fn write_line(writer: &mut OwnedWriteHalf, message: &ControlMessage) -> Result<()> {
    let mut line = JsonCodec::encode(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_accepts_bare_names() {
        let root = Path::new("/srv/files");
        assert_eq!(
            resolve(root, "data.bin").unwrap(),
            PathBuf::from("/srv/files/data.bin")
        );
    }

    #[test]
    fn resolve_rejects_traversal() {
        let root = Path::new("/srv/files");

        for name in ["../etc/passwd", "..", "a/b", "a\\b", "/etc/passwd", ""] {
            assert!(resolve(root, name).is_err(), "accepted {name:?}");
        }
    }

    #[test]
    fn staging_path_appends_suffix() {
        assert_eq!(
            staging_path(Path::new("/srv/files/data.bin")),
            PathBuf::from("/srv/files/data.bin.part")
        );
    }
}
