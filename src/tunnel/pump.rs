//! Socket pump tasks for one proxied flow
//!
//! Each flow runs two tasks. The socket-reader pulls from the local socket
//! in window-limited chunks and hands them to the role's main loop; the
//! socket-writer drains the flow's inbound channel into the socket and
//! reports consumed byte counts so the peer's window can be refreshed.

use super::flow::SendWindow;
use super::multiplexer::FlowEvent;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Spawn the reader/writer pair for an open flow
///
/// Cancelling `cancel` drops both socket halves promptly. EOF and IO errors
/// are reported through `events`; the tasks themselves never touch the flow
/// table.
pub fn spawn_flow_pumps(
    id: u64,
    socket: TcpStream,
    window: Arc<SendWindow>,
    to_socket: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::Sender<FlowEvent>,
    cancel: CancellationToken,
    max_chunk: usize,
) {
    let (read_half, write_half) = socket.into_split();

    tokio::spawn(socket_reader(
        id,
        read_half,
        window,
        events.clone(),
        cancel.clone(),
        max_chunk,
    ));
    tokio::spawn(socket_writer(id, write_half, to_socket, events, cancel));
}

async fn socket_reader(
    id: u64,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    window: Arc<SendWindow>,
    events: mpsc::Sender<FlowEvent>,
    cancel: CancellationToken,
    max_chunk: usize,
) {
    let mut buf = vec![0u8; max_chunk];
    loop {
        // Claim window credit before touching the socket; this is where a
        // starved flow suspends until the peer sends a WindowUpdate
        let budget = tokio::select! {
            _ = cancel.cancelled() => return,
            b = window.claim(max_chunk) => b,
        };

        let read = tokio::select! {
            _ = cancel.cancelled() => {
                window.release(budget);
                return;
            }
            r = read_half.read(&mut buf[..budget]) => r,
        };

        match read {
            Ok(0) => {
                window.release(budget);
                trace!(id, "local socket eof");
                let _ = events.send(FlowEvent::SourceDone { id }).await;
                return;
            }
            Ok(n) => {
                window.release(budget - n);
                let data = Bytes::copy_from_slice(&buf[..n]);
                if events.send(FlowEvent::Data { id, data }).await.is_err() {
                    return;
                }
                // One chunk per scheduling turn: every other ready flow
                // gets to enqueue before this one comes around again, so
                // no flow can monopolise the tunnel
                tokio::task::yield_now().await;
            }
            Err(e) => {
                window.release(budget);
                trace!(id, error = %e, "local socket read error");
                let _ = events.send(FlowEvent::Failed { id }).await;
                return;
            }
        }
    }
}

async fn socket_writer(
    id: u64,
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut to_socket: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::Sender<FlowEvent>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = to_socket.recv() => item,
        };

        match item {
            Some(data) => {
                let n = data.len();
                if write_half.write_all(&data).await.is_err() {
                    trace!(id, "local socket write error");
                    let _ = events.send(FlowEvent::Failed { id }).await;
                    return;
                }
                if events.send(FlowEvent::Consumed { id, n }).await.is_err() {
                    return;
                }
            }
            None => {
                // Peer half-closed its data direction; propagate to the
                // local socket and leave the reader running
                trace!(id, "shutting local socket write side");
                let _ = write_half.shutdown().await;
                return;
            }
        }
    }
}
