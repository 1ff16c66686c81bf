//! Binary-protocol TCP server.
//!
//! Accepts connections and runs one read loop per connection:
//! socket → [`FrameBuffer`] → [`Dispatcher`] → writer task → socket.
//!
//! Connections are tracked in an explicit registry keyed by a monotonically
//! assigned integer id, inserted on accept and removed on close — never by
//! socket identity. The engine keeps no other per-connection state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::dispatch::{ActionRegistry, Dispatcher};
use crate::error::Result;
use crate::protocol::{FrameBuffer, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig};

/// Read buffer size for the per-connection loop.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Process-wide aggregate counters.
///
/// Mutated with relaxed atomics from connection tasks; read by the `stats`
/// action and by tests.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Connections accepted over the server's lifetime.
    pub connections_total: AtomicU64,
    /// Currently open connections.
    pub connections_active: AtomicU64,
    /// Complete frames reassembled from the wire.
    pub frames_received: AtomicU64,
    /// Frames queued for sending.
    pub frames_sent: AtomicU64,
    /// Raw bytes read from sockets.
    pub bytes_received: AtomicU64,
    /// Raw bytes handed to writer tasks.
    pub bytes_sent: AtomicU64,
    /// Requests routed to an action successfully.
    pub requests_handled: AtomicU64,
}

impl EngineStats {
    /// Snapshot the counters as a JSON object.
    pub fn snapshot(&self) -> Value {
        json!({
            "connections_total": self.connections_total.load(Ordering::Relaxed),
            "connections_active": self.connections_active.load(Ordering::Relaxed),
            "frames_received": self.frames_received.load(Ordering::Relaxed),
            "frames_sent": self.frames_sent.load(Ordering::Relaxed),
            "bytes_received": self.bytes_received.load(Ordering::Relaxed),
            "bytes_sent": self.bytes_sent.load(Ordering::Relaxed),
            "requests_handled": self.requests_handled.load(Ordering::Relaxed),
        })
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// Maximum accepted frame payload size.
    pub max_payload_size: u32,
    /// Writer task configuration.
    pub writer: WriterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7600".parse().expect("valid default address"),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            writer: WriterConfig::default(),
        }
    }
}

/// Registry entry for one live connection.
#[derive(Debug, Clone)]
struct ConnectionEntry {
    addr: SocketAddr,
}

/// Binary-protocol TCP server.
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<EngineStats>,
    connections: Arc<Mutex<HashMap<u64, ConnectionEntry>>>,
    next_conn_id: AtomicU64,
}

impl Server {
    /// Bind a server with the reference action set.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        Self::bind_with_registry(config, ActionRegistry::with_builtins()).await
    }

    /// Bind a server with a caller-built action registry.
    pub async fn bind_with_registry(
        config: ServerConfig,
        registry: ActionRegistry,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let stats = Arc::new(EngineStats::default());
        let dispatcher = Arc::new(Dispatcher::with_registry(registry, stats.clone()));

        Ok(Self {
            listener,
            config,
            dispatcher,
            stats,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// The address the server is actually listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared engine counters.
    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    /// Number of currently registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("registry lock").len()
    }

    /// Snapshot of the connection registry: (connection id, peer address).
    pub fn connections(&self) -> Vec<(u64, SocketAddr)> {
        self.connections
            .lock()
            .expect("registry lock")
            .iter()
            .map(|(&id, entry)| (id, entry.addr))
            .collect()
    }

    /// Accept connections forever.
    pub async fn run(&self) -> Result<()> {
        info!(addr = %self.local_addr()?, "engine server listening");

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "broken connection on accept");
                    continue;
                }
            };

            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
            self.connections
                .lock()
                .expect("registry lock")
                .insert(conn_id, ConnectionEntry { addr });
            info!(conn_id, %addr, "connection accepted");

            let dispatcher = self.dispatcher.clone();
            let stats = self.stats.clone();
            let connections = self.connections.clone();
            let max_payload = self.config.max_payload_size;
            let writer_config = self.config.writer.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, conn_id, dispatcher, &stats, max_payload, writer_config)
                        .await
                {
                    warn!(conn_id, error = %e, "connection ended with error");
                }

                connections.lock().expect("registry lock").remove(&conn_id);
                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                info!(conn_id, "connection closed");
            });
        }
    }
}

/// Per-connection read loop: reassemble, dispatch, reply.
async fn handle_connection(
    stream: TcpStream,
    conn_id: u64,
    dispatcher: Arc<Dispatcher>,
    stats: &EngineStats,
    max_payload_size: u32,
    writer_config: WriterConfig,
) -> Result<()> {
    use tokio::io::AsyncReadExt;

    let (mut reader, write_half) = stream.into_split();
    let (writer, _writer_task) = spawn_writer_task(write_half, writer_config);

    let mut frame_buffer = FrameBuffer::with_max_payload(max_payload_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => return Err(e.into()),
        };
        stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);

        // A framing error poisons the stream: the buffer is already
        // discarded, so drop the connection.
        let frames = match frame_buffer.push(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(conn_id, error = %e, "framing error, dropping connection");
                return Err(e);
            }
        };

        for frame in frames {
            stats.frames_received.fetch_add(1, Ordering::Relaxed);
            debug!(conn_id, kind = frame.kind_byte, len = frame.payload_len(), "frame in");

            match dispatcher.dispatch(&frame) {
                Ok(Some(reply)) => {
                    let outbound = OutboundFrame::encode(&reply);
                    stats
                        .bytes_sent
                        .fetch_add(outbound.size() as u64, Ordering::Relaxed);
                    stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                    writer.send(outbound).await?;
                }
                Ok(None) => {}
                Err(e) => warn!(conn_id, error = %e, "dispatch error"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn bind_assigns_ephemeral_port() {
        let server = Server::bind(test_config()).await.unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn registry_tracks_accept_and_close() {
        use tokio::io::AsyncWriteExt;
        use tokio::net::TcpStream;

        let server = Arc::new(Server::bind(test_config()).await.unwrap());
        let addr = server.local_addr().unwrap();
        let stats = server.stats();

        let runner = server.clone();
        tokio::spawn(async move {
            let _ = runner.run().await;
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(server.connection_count(), 1);
        assert_eq!(stats.connections_total.load(Ordering::Relaxed), 1);
        assert_eq!(stats.connections_active.load(Ordering::Relaxed), 1);

        stream.shutdown().await.unwrap();
        drop(stream);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(server.connection_count(), 0);
        assert_eq!(stats.connections_active.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn stats_snapshot_shape() {
        let stats = EngineStats::default();
        stats.frames_received.store(3, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap["frames_received"], 3);
        assert_eq!(snap["connections_total"], 0);
    }
}
