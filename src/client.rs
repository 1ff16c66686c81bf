//! Binary-protocol TCP client.
//!
//! Connects to an engine server, sends PING/REQUEST frames and resolves the
//! matching PONG/RESPONSE replies. The wire format carries no request id, so
//! replies are correlated strictly first-in-first-out: each outgoing frame
//! that expects a reply queues a continuation, and the read loop resolves
//! the front of the queue on every reply frame.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::JsonCodec;
use crate::error::{Result, WireError};
use crate::protocol::{Frame, FrameBuffer, FrameKind};
use crate::writer::{spawn_writer_task_default, WriterHandle};

type PendingQueue = Arc<Mutex<VecDeque<oneshot::Sender<Frame>>>>;

/// Client for the binary frame protocol.
pub struct Client {
    writer: WriterHandle,
    pending: PendingQueue,
    /// Serializes continuation-queue pushes with their frame sends so that
    /// concurrent callers cannot interleave and mis-correlate replies.
    send_order: tokio::sync::Mutex<()>,
    _read_task: JoinHandle<()>,
}

impl Client {
    /// Connect to an engine server.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();

        let (writer, _writer_task) = spawn_writer_task_default(write_half);
        let pending: PendingQueue = Arc::new(Mutex::new(VecDeque::new()));

        let read_task = tokio::spawn(read_loop(read_half, pending.clone()));

        Ok(Self {
            writer,
            pending,
            send_order: tokio::sync::Mutex::new(()),
            _read_task: read_task,
        })
    }

    /// Send a REQUEST and await the RESPONSE.
    ///
    /// An in-band `{"error"}` response (unknown action, bad params, handler
    /// failure) surfaces as [`WireError::Peer`]; otherwise the `result`
    /// value is returned.
    pub async fn request(&self, action: &str, params: Value) -> Result<Value> {
        let payload = JsonCodec::encode(&json!({"action": action, "params": params}))?;
        let reply = self
            .roundtrip(Frame::new(FrameKind::Request, payload.into()))
            .await?;

        let body: Value = JsonCodec::decode(reply.payload())?;
        if let Some(message) = body.get("error").and_then(Value::as_str) {
            return Err(WireError::Peer(message.to_string()));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Send a PING and return the PONG body (echoed fields plus timestamp).
    pub async fn ping(&self) -> Result<Value> {
        let payload = JsonCodec::encode(&json!({}))?;
        let reply = self
            .roundtrip(Frame::new(FrameKind::Ping, payload.into()))
            .await?;
        Ok(JsonCodec::decode(reply.payload())?)
    }

    /// Send a frame and await the next reply frame, FIFO.
    async fn roundtrip(&self, frame: Frame) -> Result<Frame> {
        let (tx, rx) = oneshot::channel();

        // Queue the continuation before the bytes can hit the wire so the
        // reply cannot race past it, and keep push+send atomic across
        // concurrent callers.
        {
            let _order = self.send_order.lock().await;
            self.pending.lock().expect("pending lock").push_back(tx);
            if let Err(e) = self.writer.send_frame(&frame).await {
                self.pending.lock().expect("pending lock").pop_back();
                return Err(e);
            }
        }

        let reply = rx.await.map_err(|_| WireError::ConnectionClosed)?;
        if reply.kind() == Some(FrameKind::Error) {
            let body: Value = JsonCodec::decode(reply.payload()).unwrap_or(Value::Null);
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unspecified protocol error");
            return Err(WireError::Peer(message.to_string()));
        }
        Ok(reply)
    }
}

/// Read loop: reassemble frames and resolve pending continuations.
async fn read_loop(mut reader: tokio::net::tcp::OwnedReadHalf, pending: PendingQueue) {
    use tokio::io::AsyncReadExt;

    let mut frame_buffer = FrameBuffer::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "client read error");
                break;
            }
        };

        let frames = match frame_buffer.push(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "framing error from server, dropping connection");
                break;
            }
        };

        for frame in frames {
            match frame.kind() {
                Some(FrameKind::Pong) | Some(FrameKind::Response) | Some(FrameKind::Error) => {
                    let continuation = pending.lock().expect("pending lock").pop_front();
                    match continuation {
                        Some(tx) => {
                            let _ = tx.send(frame);
                        }
                        None => debug!(kind = frame.kind_byte, "unsolicited reply frame"),
                    }
                }
                _ => debug!(kind = frame.kind_byte, "ignoring non-reply frame"),
            }
        }
    }

    // Dropping the queued senders fails every outstanding roundtrip with
    // ConnectionClosed.
    pending.lock().expect("pending lock").clear();
}
