//! Heartbeat client role.
//!
//! Dials the server, answers every probe with an immediate acknowledgment,
//! and treats any connection loss — read error, clean EOF, refused dial —
//! the same way: sleep the fixed reconnect delay, bump the attempt counter,
//! dial again. The cycle runs until [`HeartbeatClient::stop`] is called or
//! reconnection is disabled.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::LivenessMessage;
use crate::codec::JsonCodec;
use crate::dispatch::unix_millis;
use crate::error::Result;

/// Client-side heartbeat configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatClientConfig {
    /// Server address to dial.
    pub server_addr: SocketAddr,
    /// Fixed delay between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Whether to redial after a lost connection.
    pub auto_reconnect: bool,
}

impl HeartbeatClientConfig {
    /// Config with the default cadence for one server address.
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            reconnect_delay: Duration::from_secs(3),
            auto_reconnect: true,
        }
    }
}

/// Client-side liveness counters.
///
/// Reconnect attempts accumulate across the whole lifetime of the client,
/// not per connection.
#[derive(Debug, Default)]
pub struct HeartbeatClientStats {
    pub connects: AtomicU64,
    pub heartbeats_received: AtomicU64,
    pub acks_sent: AtomicU64,
    pub reconnect_attempts: AtomicU64,
}

/// Heartbeat client.
pub struct HeartbeatClient {
    config: HeartbeatClientConfig,
    stats: Arc<HeartbeatClientStats>,
    stopped: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
}

impl HeartbeatClient {
    /// Create a client; call [`HeartbeatClient::run`] to start the cycle.
    pub fn new(config: HeartbeatClientConfig) -> Self {
        Self {
            config,
            stats: Arc::new(HeartbeatClientStats::default()),
            stopped: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(Notify::new()),
        }
    }

    /// Shared liveness counters.
    pub fn stats(&self) -> Arc<HeartbeatClientStats> {
        self.stats.clone()
    }

    /// Stop the connect/reconnect cycle from any task.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.stop_signal.notify_waiters();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Run the connect / probe-answer / reconnect cycle.
    ///
    /// Returns once [`HeartbeatClient::stop`] is called, or after the first
    /// disconnect when `auto_reconnect` is off.
    pub async fn run(&self) -> Result<()> {
        loop {
            if self.is_stopped() {
                return Ok(());
            }

            match TcpStream::connect(self.config.server_addr).await {
                Ok(stream) => {
                    self.stats.connects.fetch_add(1, Ordering::Relaxed);
                    info!(addr = %self.config.server_addr, "heartbeat connected");
                    if let Err(e) = self.session(stream).await {
                        debug!(error = %e, "heartbeat session ended");
                    }
                }
                // A refused dial counts the same as a lost connection.
                Err(e) => warn!(addr = %self.config.server_addr, error = %e, "connect failed"),
            }

            if self.is_stopped() || !self.config.auto_reconnect {
                return Ok(());
            }

            self.stats.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            debug!(
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "scheduling reconnect"
            );

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = self.stop_signal.notified() => return Ok(()),
            }
        }
    }

    /// One connected session: answer probes until the connection drops.
    async fn session(&self, stream: TcpStream) -> Result<()> {
        let (read_half, mut writer) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = self.stop_signal.notified() => return Ok(()),
            };

            let Some(line) = line else {
                // Clean EOF.
                return Ok(());
            };

            let message = match serde_json::from_str::<LivenessMessage>(&line) {
                Ok(message) => message,
                Err(e) => {
                    debug!(error = %e, "ignoring unparseable liveness line");
                    continue;
                }
            };

            match message {
                LivenessMessage::Heartbeat { seq, .. } => {
                    self.stats.heartbeats_received.fetch_add(1, Ordering::Relaxed);
                    let ack = LivenessMessage::HeartbeatAck {
                        seq,
                        timestamp: unix_millis(),
                    };
                    let mut line = JsonCodec::encode(&ack)?;
                    line.push(b'\n');
                    writer.write_all(&line).await?;
                    self.stats.acks_sent.fetch_add(1, Ordering::Relaxed);
                }
                LivenessMessage::Welcome {
                    probe_interval_ms, ..
                } => {
                    debug!(probe_interval_ms, "welcome received");
                }
                LivenessMessage::ServerShutdown => {
                    info!("server announced shutdown");
                    return Ok(());
                }
                other => debug!(?other, "ignoring liveness message"),
            }
        }
    }
}
