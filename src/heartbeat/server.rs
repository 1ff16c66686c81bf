//! Heartbeat server role.
//!
//! Each connection runs one task that owns all of its liveness state. A
//! reader task feeds parsed lines over a channel so the main task can
//! `select!` across socket input and the two timers — probe and timeout
//! check — without ever blocking on a partial read. Dropping out of the
//! loop tears both timers down with the task, so nothing can fire against a
//! closed connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{tcp::OwnedWriteHalf, TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use super::LivenessMessage;
use crate::codec::JsonCodec;
use crate::dispatch::unix_millis;
use crate::error::Result;

/// Heartbeat timing configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// Cadence of outgoing probes.
    pub probe_interval: Duration,
    /// Silence threshold past which a connection is declared dead.
    pub timeout: Duration,
    /// Cadence of timeout checks.
    pub check_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7602".parse().expect("valid default address"),
            probe_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(15),
            check_interval: Duration::from_secs(5),
        }
    }
}

/// Aggregate liveness counters across all connections.
#[derive(Debug, Default)]
pub struct HeartbeatServerStats {
    pub connections: AtomicU64,
    pub probes_sent: AtomicU64,
    pub acks_received: AtomicU64,
    pub timeouts: AtomicU64,
}

/// Heartbeat server.
pub struct HeartbeatServer {
    listener: TcpListener,
    config: HeartbeatConfig,
    stats: Arc<HeartbeatServerStats>,
    shutdown_tx: watch::Sender<bool>,
}

impl HeartbeatServer {
    /// Bind the server.
    pub async fn bind(config: HeartbeatConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            listener,
            config,
            stats: Arc::new(HeartbeatServerStats::default()),
            shutdown_tx,
        })
    }

    /// The address the server is actually listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared liveness counters.
    pub fn stats(&self) -> Arc<HeartbeatServerStats> {
        self.stats.clone()
    }

    /// Announce shutdown to every connection and stop accepting.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Accept connections until [`HeartbeatServer::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        info!(addr = %self.local_addr()?, "heartbeat server listening");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown_rx.changed() => {
                    info!("heartbeat server shutting down");
                    return Ok(());
                }
            };

            let (stream, addr) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "broken connection on accept");
                    continue;
                }
            };

            self.stats.connections.fetch_add(1, Ordering::Relaxed);
            info!(%addr, "heartbeat connection accepted");

            let config = self.config.clone();
            let stats = self.stats.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = probe_connection(stream, config, stats, shutdown_rx).await {
                    debug!(%addr, error = %e, "heartbeat connection ended with error");
                }
                info!(%addr, "heartbeat connection closed");
            });
        }
    }
}

/// Per-connection probe/timeout loop.
async fn probe_connection(
    stream: TcpStream,
    config: HeartbeatConfig,
    stats: Arc<HeartbeatServerStats>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let (read_half, mut writer) = stream.into_split();

    write_line(
        &mut writer,
        &LivenessMessage::Welcome {
            probe_interval_ms: config.probe_interval.as_millis() as u64,
            timeout_ms: config.timeout.as_millis() as u64,
        },
    )
    .await?;

    // Reader task: lines in, channel out. Decouples parsing from the timer
    // loop and keeps the select arms cancel-safe.
    let (line_tx, mut line_rx) = mpsc::channel::<LivenessMessage>(64);
    let reader_task = tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match serde_json::from_str::<LivenessMessage>(&line) {
                Ok(message) => {
                    if line_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!(error = %e, "ignoring unparseable liveness line"),
            }
        }
    });

    let mut probe = interval(config.probe_interval);
    let mut check = interval(config.check_interval);
    let mut last_ack = Instant::now();
    let mut seq = 0u64;

    let outcome = loop {
        tokio::select! {
            _ = probe.tick() => {
                seq += 1;
                stats.probes_sent.fetch_add(1, Ordering::Relaxed);
                let message = LivenessMessage::Heartbeat { seq, timestamp: unix_millis() };
                if write_line(&mut writer, &message).await.is_err() {
                    break Ok(());
                }
            }
            _ = check.tick() => {
                if last_ack.elapsed() > config.timeout {
                    stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(silent_ms = last_ack.elapsed().as_millis() as u64, "peer timed out");
                    break Ok(());
                }
            }
            received = line_rx.recv() => {
                match received {
                    // Reader gone: the peer disconnected.
                    None => break Ok(()),
                    Some(LivenessMessage::HeartbeatAck { seq, .. }) => {
                        last_ack = Instant::now();
                        stats.acks_received.fetch_add(1, Ordering::Relaxed);
                        debug!(seq, "ack received");
                    }
                    Some(LivenessMessage::Message { body }) => {
                        if write_line(&mut writer, &LivenessMessage::MessageAck { body }).await.is_err() {
                            break Ok(());
                        }
                    }
                    Some(other) => debug!(?other, "ignoring liveness message"),
                }
            }
            _ = shutdown_rx.changed() => {
                let _ = write_line(&mut writer, &LivenessMessage::ServerShutdown).await;
                break Ok(());
            }
        }
    };

    // Closing the socket ends the reader task; aborting just hurries it.
    reader_task.abort();
    outcome
}

/// Write one newline-terminated liveness message.
async fn write_line(writer: &mut OwnedWriteHalf, message: &LivenessMessage) -> Result<()> {
    let mut line = JsonCodec::encode(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}
