//! Control-plane messages for the file transfer protocol.
//!
//! One JSON object per line, tagged by a `command` field. Requests and
//! responses share the enum: responses mirror their request with a
//! `_RESPONSE`/`_START`/`_READY`/`_COMPLETE` suffix, and `ERROR` reports an
//! application error without closing the connection.

use serde::{Deserialize, Serialize};

/// Directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Bare file name.
    pub name: String,
    /// File size in bytes.
    pub size: u64,
    /// Last modification time, unix seconds.
    pub modified: u64,
}

/// Aggregate transfer counters reported by `STATS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTotals {
    pub connections: u64,
    pub downloads: u64,
    pub uploads: u64,
    pub deletes: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One control-plane message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Request the server's file listing.
    List,
    /// Listing reply.
    ListResponse { files: Vec<FileInfo> },

    /// Request a file's bytes.
    Download { filename: String },
    /// Announces the raw data run that follows immediately.
    DownloadStart {
        filename: String,
        size: u64,
        checksum: String,
    },
    /// Trails the data run.
    DownloadComplete { filename: String },

    /// Announce an upload; `size` raw bytes follow once the server is ready.
    Upload {
        filename: String,
        size: u64,
        checksum: String,
    },
    /// Server is ready to receive the announced bytes.
    UploadReady { filename: String },
    /// Upload fully received and verified.
    UploadComplete {
        filename: String,
        size: u64,
        checksum: String,
    },

    /// Remove a file.
    Delete { filename: String },
    /// File removed.
    DeleteComplete { filename: String },

    /// Request aggregate counters.
    Stats,
    /// Counters reply.
    StatsResponse {
        #[serde(flatten)]
        totals: TransferTotals,
    },

    /// Application error; the connection stays open.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_tags_are_screaming_snake() {
        let line = serde_json::to_value(&ControlMessage::Download {
            filename: "data.bin".into(),
        })
        .unwrap();
        assert_eq!(line["command"], json!("DOWNLOAD"));

        let line = serde_json::to_value(&ControlMessage::UploadReady {
            filename: "data.bin".into(),
        })
        .unwrap();
        assert_eq!(line["command"], json!("UPLOAD_READY"));

        let line = serde_json::to_value(&ControlMessage::ListResponse { files: vec![] }).unwrap();
        assert_eq!(line["command"], json!("LIST_RESPONSE"));
    }

    #[test]
    fn roundtrip_download_start() {
        let msg = ControlMessage::DownloadStart {
            filename: "report.txt".into(),
            size: 4096,
            checksum: "0099aabb".into(),
        };

        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: ControlMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn stats_response_flattens_totals() {
        let msg = ControlMessage::StatsResponse {
            totals: TransferTotals {
                connections: 2,
                downloads: 1,
                ..TransferTotals::default()
            },
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["command"], json!("STATS_RESPONSE"));
        assert_eq!(value["connections"], json!(2));
        assert_eq!(value["downloads"], json!(1));
    }

    #[test]
    fn unknown_command_fails_to_parse() {
        let result: Result<ControlMessage, _> =
            serde_json::from_str(r#"{"command":"TELEPORT","filename":"x"}"#);
        assert!(result.is_err());
    }
}
