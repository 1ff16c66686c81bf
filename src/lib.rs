//! # streamwire
//!
//! A stream protocol engine for plain TCP: a self-describing binary frame
//! format, incremental reassembly of frames from arbitrarily-chunked reads,
//! request dispatch, and two overlays built on the same connection handling —
//! file transfer with integrity verification and a heartbeat liveness
//! protocol.
//!
//! ## Architecture
//!
//! Inbound data flows one way per connection:
//!
//! ```text
//! socket ─► FrameBuffer ─► Frame ─► Dispatcher ─► handler ─► writer ─► socket
//! ```
//!
//! The engine itself keeps no per-connection state beyond the reassembly
//! buffer; the transfer and heartbeat overlays each own their session state.
//!
//! ## Example
//!
//! ```ignore
//! use streamwire::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> streamwire::Result<()> {
//!     let server = Server::bind(ServerConfig::default()).await?;
//!     server.run().await
//! }
//! ```

pub mod codec;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod protocol;
pub mod transfer;
pub mod writer;

mod client;
mod server;

pub use client::Client;
pub use error::{Result, WireError};
pub use server::{EngineStats, Server, ServerConfig};
