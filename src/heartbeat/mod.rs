//! Heartbeat liveness overlay.
//!
//! Newline-JSON messages tagged by a `type` field, driven by timers rather
//! than requests: the server probes on a fixed interval and tears down
//! connections whose acknowledgments stop for longer than the timeout; the
//! client answers every probe and, when the connection drops, redials after
//! a fixed delay until told to stop. Missed individual acks are never fatal,
//! only sustained silence is.

mod client;
mod server;

pub use client::{HeartbeatClient, HeartbeatClientConfig, HeartbeatClientStats};
pub use server::{HeartbeatConfig, HeartbeatServer, HeartbeatServerStats};

use serde::{Deserialize, Serialize};

/// One liveness message, newline-terminated on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LivenessMessage {
    /// Server greeting announcing the probe cadence.
    Welcome {
        probe_interval_ms: u64,
        timeout_ms: u64,
    },
    /// Liveness probe.
    Heartbeat { seq: u64, timestamp: u64 },
    /// Probe acknowledgment, echoing the probe's sequence number.
    HeartbeatAck { seq: u64, timestamp: u64 },
    /// Application chatter riding the same connection.
    Message { body: String },
    /// Acknowledgment of [`LivenessMessage::Message`].
    MessageAck { body: String },
    /// Server is going away; clients may reconnect.
    ServerShutdown,
}
