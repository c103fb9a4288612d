//! Length-prefixed frame transport
//!
//! Wire format:
//! ```text
//! +----------------+------------------+
//! | Length (4B BE) |  Payload (0..n)  |
//! +----------------+------------------+
//! ```
//!
//! A zero-length frame is a keep-alive ping. Any inbound frame, ping
//! included, resets the idle timer; a peer that stays silent for the idle
//! timeout is declared dead and the connection torn down.

use super::{TunnelError, IDLE_SLACK, PING_INTERVAL};
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

/// Framed connection tuning knobs
#[derive(Debug, Clone)]
pub struct FramedConfig {
    /// Largest inbound frame we accept
    pub max_frame_size: usize,
    /// Keep-alive interval; `None` disables outbound pings
    pub ping_interval: Option<Duration>,
    /// How long the peer may stay silent before we give up
    pub idle_timeout: Duration,
    /// Peer identity for log lines
    pub peer: String,
}

impl Default for FramedConfig {
    fn default() -> Self {
        Self {
            max_frame_size: crate::MAX_FRAME_SIZE,
            ping_interval: Some(PING_INTERVAL),
            idle_timeout: 2 * PING_INTERVAL + IDLE_SLACK,
            peer: String::from("peer"),
        }
    }
}

impl FramedConfig {
    pub fn with_peer(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            ..Self::default()
        }
    }
}

/// How to shut the connection down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Drain the send queue, shut the write side, wait for peer EOF
    Graceful,
    /// Drop everything immediately
    Abortive,
}

enum WriterCmd {
    Frame(Bytes),
    Shutdown,
}

/// Cloneable handle for enqueueing outbound frames
///
/// Enqueue never blocks; the writer task drains the queue in strict FIFO
/// order, so frames from many tasks never interleave on the wire.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<WriterCmd>,
}

impl FrameSender {
    /// Queue one frame for transmission
    pub fn send(&self, payload: Bytes) -> Result<(), TunnelError> {
        self.tx
            .send(WriterCmd::Frame(payload))
            .map_err(|_| TunnelError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A framed connection over any bidirectional byte stream
///
/// Owns the stream exclusively. The write side is driven by a dedicated
/// writer task fed through [`FrameSender`]; the read side is polled through
/// [`receive`](FramedConnection::receive) by a single consumer.
pub struct FramedConnection<S> {
    read_half: ReadHalf<S>,
    sender: FrameSender,
    writer: JoinHandle<()>,
    config: FramedConfig,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Take ownership of a stream and start the writer task
    pub fn new(stream: S, config: FramedConfig) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(writer_task(
            BufWriter::new(write_half),
            rx,
            config.ping_interval,
            config.peer.clone(),
        ));

        Self {
            read_half,
            sender: FrameSender { tx },
            writer,
            config,
        }
    }

    /// Handle for enqueueing outbound frames from any task
    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Receive the next complete non-ping frame
    ///
    /// Returns `Ok(None)` on clean end-of-stream. Fails with
    /// [`TunnelError::FrameTooLarge`] when the declared length exceeds the
    /// configured maximum and [`TunnelError::IdleTimeout`] when the peer
    /// stays silent past the idle deadline.
    pub async fn receive(&mut self) -> Result<Option<Bytes>, TunnelError> {
        loop {
            let mut len_buf = [0u8; 4];
            match timeout(
                self.config.idle_timeout,
                self.read_half.read_exact(&mut len_buf),
            )
            .await
            {
                Err(_) => return Err(TunnelError::IdleTimeout),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(_)) => {}
            }

            let len = u32::from_be_bytes(len_buf) as usize;
            if len > self.config.max_frame_size {
                return Err(TunnelError::FrameTooLarge(len, self.config.max_frame_size));
            }
            if len == 0 {
                // Keep-alive; the timer already reset by virtue of the read
                trace!(peer = %self.config.peer, "ping received");
                continue;
            }

            let mut payload = vec![0u8; len];
            timeout(
                self.config.idle_timeout,
                self.read_half.read_exact(&mut payload),
            )
            .await
            .map_err(|_| TunnelError::IdleTimeout)??;

            return Ok(Some(payload.into()));
        }
    }

    /// Close the connection
    ///
    /// Graceful close drains the send queue, shuts the write side and waits
    /// for the peer to stop talking (up to `drain` per read). Abortive close
    /// drops both halves immediately.
    pub async fn close(mut self, mode: CloseMode, drain: Duration) {
        match mode {
            CloseMode::Graceful => {
                let _ = self.sender.tx.send(WriterCmd::Shutdown);
                // A stalled peer must not pin the shutdown; give the queue
                // a bounded window to flush
                let flush_deadline = drain.max(Duration::from_millis(100));
                if timeout(flush_deadline, &mut self.writer).await.is_err() {
                    self.writer.abort();
                }
                // Drain remaining inbound so the peer's send queue can empty
                let deadline = Instant::now() + drain;
                let mut sink = [0u8; 4096];
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    match timeout(remaining, self.read_half.read(&mut sink)).await {
                        Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                        Ok(Ok(_)) => {}
                    }
                }
            }
            CloseMode::Abortive => {
                self.writer.abort();
            }
        }
        debug!(peer = %self.config.peer, ?mode, "connection closed");
    }

    /// Flush already queued frames within `flush`, then reset
    ///
    /// Rejection paths owe the peer one final frame (AuthFailed, a GoAway
    /// notice) but must still close abortively: no send-side handshake
    /// beyond the flush, no inbound drain. A writer that cannot flush
    /// within the deadline is killed outright.
    pub async fn close_after_flush(mut self, flush: Duration) {
        let _ = self.sender.tx.send(WriterCmd::Shutdown);
        if timeout(flush, &mut self.writer).await.is_err() {
            self.writer.abort();
        }
        debug!(peer = %self.config.peer, "connection reset after flush");
    }
}

/// Drains the frame queue onto the stream, inserting keep-alive pings
/// whenever the outbound side has been idle for a full ping interval.
async fn writer_task<W>(
    mut stream: BufWriter<W>,
    mut rx: mpsc::UnboundedReceiver<WriterCmd>,
    ping_interval: Option<Duration>,
    peer: String,
) where
    W: AsyncWrite + Unpin,
{
    let mut last_write = Instant::now();
    loop {
        let cmd = match ping_interval {
            Some(interval) => {
                tokio::select! {
                    cmd = rx.recv() => cmd,
                    _ = tokio::time::sleep_until(last_write + interval) => {
                        trace!(peer = %peer, "sending ping");
                        if write_frame(&mut stream, &[]).await.is_err() {
                            break;
                        }
                        last_write = Instant::now();
                        continue;
                    }
                }
            }
            None => rx.recv().await,
        };

        match cmd {
            Some(WriterCmd::Frame(payload)) => {
                if write_frame(&mut stream, &payload).await.is_err() {
                    break;
                }
                last_write = Instant::now();
            }
            Some(WriterCmd::Shutdown) | None => {
                // FIFO queue order means everything enqueued before the
                // shutdown has already been written
                let _ = stream.shutdown().await;
                break;
            }
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut BufWriter<W>,
    payload: &[u8],
) -> std::io::Result<()> {
    stream.write_u32(payload.len() as u32).await?;
    if !payload.is_empty() {
        stream.write_all(payload).await?;
    }
    stream.flush().await
}
