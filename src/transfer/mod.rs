//! File transfer overlay.
//!
//! A hybrid protocol on one TCP connection: the control plane is
//! newline-terminated JSON commands, the data plane is raw byte runs of
//! exactly the length the preceding control message announced. Integrity is
//! verified end to end with a running CRC32 over each transferred file.
//!
//! # Example
//!
//! ```ignore
//! use streamwire::transfer::{FileServer, TransferClient, TransferConfig};
//!
//! let server = FileServer::bind(TransferConfig {
//!     bind_addr: "127.0.0.1:7601".parse().unwrap(),
//!     root: "/srv/files".into(),
//! })
//! .await?;
//!
//! let mut client = TransferClient::connect(server.local_addr()?).await?;
//! client.upload(std::path::Path::new("report.txt")).await?;
//! ```

mod client;
mod messages;
mod server;
mod session;

pub use client::TransferClient;
pub use messages::{ControlMessage, FileInfo, TransferTotals};
pub use server::{FileServer, TransferConfig, TransferStats};
pub use session::{file_checksum, SessionEvent, TransferDemux, TransferState};
