//! Dedicated writer task for frame sending.
//!
//! Handlers and timers hand pre-encoded frames to an mpsc channel; a single
//! task owns the socket write half and drains the channel, batching queued
//! frames into one vectored write.
//!
//! ```text
//! dispatch ─┐
//! probes   ─┼─► mpsc::Sender<OutboundFrame> ─► writer task ─► socket
//! replies  ─┘
//! ```
//!
//! The bounded channel is the only write-side buffering; the design assumes
//! no flow control beyond what the transport provides.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, WireError};
use crate::protocol::Frame;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the socket.
///
/// Holds the fully encoded wire bytes (header, payload, trailing checksum)
/// as one contiguous buffer.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Encoded frame bytes.
    pub bytes: Bytes,
}

impl OutboundFrame {
    /// Encode a frame for sending.
    pub fn encode(frame: &Frame) -> Self {
        Self {
            bytes: frame.encode().into(),
        }
    }

    /// Wrap already-encoded wire bytes.
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self { bytes }
    }

    /// Size of this frame on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable; shared by everything that writes to one connection.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
}

impl WriterHandle {
    /// Queue an encoded frame for writing.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| WireError::ConnectionClosed)
    }

    /// Encode and queue a frame for writing.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.send(OutboundFrame::encode(frame)).await
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task exits cleanly when every handle is dropped.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

/// Spawn the writer task with default configuration.
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

/// Main writer loop - receives frames and writes them to the socket.
async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundFrame>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            // Channel closed, clean shutdown.
            None => return Ok(()),
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;
    }
}

/// Write a batch of frames with a vectored write, continuing on partial
/// writes until every byte is out.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total: usize = batch.iter().map(|f| f.size()).sum();
    let mut written = 0usize;

    while written < total {
        let slices = remaining_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        written += n;
    }

    writer.flush().await?;
    Ok(())
}

/// Build the IoSlice array for whatever the previous writes did not cover.
fn remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0usize;

    for frame in batch {
        let end = offset + frame.size();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame.bytes[start..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameBuffer, FrameKind};
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    fn frame(payload: &'static [u8]) -> Frame {
        Frame::new(FrameKind::Request, Bytes::from_static(payload))
    }

    #[test]
    fn outbound_frame_size_matches_wire_len() {
        let f = frame(b"hello");
        let outbound = OutboundFrame::encode(&f);
        assert_eq!(outbound.size(), f.wire_len());
    }

    #[test]
    fn remaining_slices_no_skip() {
        let batch = vec![OutboundFrame::encode(&frame(b"hello"))];
        let slices = remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), batch[0].size());
    }

    #[test]
    fn remaining_slices_partial_first_frame() {
        let batch = vec![
            OutboundFrame::encode(&frame(b"hello")),
            OutboundFrame::encode(&frame(b"world")),
        ];

        let slices = remaining_slices(&batch, 5);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), batch[0].size() - 5);
        assert_eq!(slices[1].len(), batch[1].size());
    }

    #[test]
    fn remaining_slices_skips_whole_frame() {
        let batch = vec![
            OutboundFrame::encode(&frame(b"hello")),
            OutboundFrame::encode(&frame(b"world")),
        ];

        let slices = remaining_slices(&batch, batch[0].size());
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), batch[1].size());
    }

    #[tokio::test]
    async fn write_batch_roundtrips_through_frame_buffer() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = [b"one" as &[u8], b"two", b"three"]
            .iter()
            .map(|p| OutboundFrame::from_bytes(Frame::new(FrameKind::Ping, Bytes::copy_from_slice(p)).encode().into()))
            .collect();

        write_batch(&mut buf, &batch).await.unwrap();

        let mut frame_buffer = FrameBuffer::new();
        let frames = frame_buffer.push(&buf.into_inner()).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].payload(), b"three");
    }

    #[tokio::test]
    async fn writer_task_sends_frames() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);

        let f = frame(b"hello");
        handle.send_frame(&f).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut buf = vec![0u8; 128];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(n, f.wire_len());

        let frames = FrameBuffer::new().push(&buf[..n]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"hello");
    }

    #[tokio::test]
    async fn writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task_default(client);

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn send_after_writer_gone_is_connection_closed() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig { channel_capacity: 1 });

        task.abort();
        let _ = task.await;
        // The channel may take a moment to register the dropped receiver.
        tokio::time::sleep(Duration::from_millis(5)).await;

        let result = handle.send_frame(&frame(b"late")).await;
        assert!(matches!(result, Err(WireError::ConnectionClosed)));
    }
}
