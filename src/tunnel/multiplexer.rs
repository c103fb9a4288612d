//! Flow multiplexer for one tunnel
//!
//! Owns the `connection_id -> flow` table for a proxy role. Flow pump tasks
//! never touch the table directly; they carry only their id and a handle to
//! the role's event channel, and the role's main loop calls back into the
//! multiplexer. Nothing here awaits while a table entry is borrowed: the
//! pattern is look up, clone the handle, then await.

use super::flow::{FlowState, RecvCredit, SendWindow};
use super::framed::FrameSender;
use super::pump::spawn_flow_pumps;
use super::TunnelError;
use crate::protocol::{CloseReason, Message};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Event sent from pump tasks (and role helpers) to the role's main loop
#[derive(Debug)]
pub enum FlowEvent {
    /// Socket-reader produced a chunk; window credit already claimed
    Data { id: u64, data: Bytes },
    /// Socket-reader observed EOF on the local socket
    SourceDone { id: u64 },
    /// A pump task hit an IO error; the flow must be aborted
    Failed { id: u64 },
    /// Socket-writer finished writing `n` bytes to the local socket
    Consumed { id: u64, n: usize },
    /// Proxy-client dial completed (None on failure/timeout)
    Dialed { id: u64, socket: Option<TcpStream> },
    /// Proxy-server listener accepted a local connection
    Accepted {
        socket: TcpStream,
        peer: SocketAddr,
        binding: usize,
    },
}

struct Flow {
    state: FlowState,
    window: Arc<SendWindow>,
    /// Unbounded by design: the receive window bounds what the peer may
    /// put in flight, so depth never exceeds the window
    to_socket: Option<mpsc::UnboundedSender<Bytes>>,
    credit: RecvCredit,
    /// Accepted socket held until the peer confirms with ConnectionOpened
    pending_socket: Option<TcpStream>,
    cancel: CancellationToken,
    /// We have sent the CloseConnection finalising our data direction
    close_sent: bool,
}

/// Multiplexes proxied flows over one framed tunnel connection
pub struct Multiplexer {
    flows: HashMap<u64, Flow>,
    next_id: u64,
    frames: FrameSender,
    events_tx: mpsc::Sender<FlowEvent>,
    initial_window: u32,
    max_chunk: usize,
}

impl Multiplexer {
    pub fn new(
        frames: FrameSender,
        events_tx: mpsc::Sender<FlowEvent>,
        initial_window: u32,
        max_chunk: usize,
    ) -> Self {
        Self {
            flows: HashMap::new(),
            next_id: 1,
            frames,
            events_tx,
            initial_window,
            max_chunk,
        }
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    fn new_flow(&self) -> Flow {
        Flow {
            state: FlowState::Opening,
            window: Arc::new(SendWindow::new(self.initial_window)),
            to_socket: None,
            credit: RecvCredit::new(self.initial_window),
            pending_socket: None,
            cancel: CancellationToken::new(),
            close_sent: false,
        }
    }

    fn send(&self, msg: Message) -> Result<(), TunnelError> {
        self.frames.send(msg.encode())
    }

    /// Proxy-server side: a local listener accepted `socket`; allocate an id
    /// and ask the peer to dial the binding's target.
    pub fn accept_flow(
        &mut self,
        socket: TcpStream,
        target_host: &str,
        target_port: u16,
    ) -> Result<u64, TunnelError> {
        let id = self.next_id;
        self.next_id += 1;

        let mut flow = self.new_flow();
        flow.pending_socket = Some(socket);
        self.flows.insert(id, flow);

        self.send(Message::OpenConnection {
            id,
            host: target_host.to_string(),
            port: target_port,
        })?;
        debug!(id, "flow opening to {}:{}", target_host, target_port);
        Ok(id)
    }

    /// Proxy-server side: the peer dialled the target successfully
    pub fn handle_connection_opened(&mut self, id: u64) {
        let Some(flow) = self.flows.get_mut(&id) else {
            trace!(id, "ConnectionOpened for unknown flow");
            return;
        };
        let Some(socket) = flow.pending_socket.take() else {
            warn!(id, "ConnectionOpened for a flow that is already pumping");
            return;
        };
        flow.state = FlowState::Open;
        self.start_pumps(id, socket);
        debug!(id, "flow open");
    }

    /// Proxy-client side: register a flow for an inbound OpenConnection.
    /// Returns false when the id is already taken.
    pub fn register_opening(&mut self, id: u64) -> bool {
        if self.flows.contains_key(&id) {
            return false;
        }
        self.flows.insert(id, self.new_flow());
        true
    }

    /// Proxy-client side: the dial succeeded; confirm and start pumping
    pub fn attach_dialed(&mut self, id: u64, socket: TcpStream) -> Result<(), TunnelError> {
        if !self.flows.contains_key(&id) {
            // Flow was closed while the dial was in flight
            return Ok(());
        }
        self.send(Message::ConnectionOpened { id })?;
        if let Some(flow) = self.flows.get_mut(&id) {
            flow.state = FlowState::Open;
        }
        self.start_pumps(id, socket);
        debug!(id, "flow open");
        Ok(())
    }

    /// Refuse or abort a flow, notifying the peer once
    pub fn reject(&mut self, id: u64, reason: CloseReason) -> Result<(), TunnelError> {
        if let Some(flow) = self.flows.remove(&id) {
            flow.cancel.cancel();
            if !flow.close_sent {
                self.send(Message::CloseConnection { id, reason })?;
            }
        } else {
            self.send(Message::CloseConnection { id, reason })?;
        }
        debug!(id, %reason, "flow rejected");
        Ok(())
    }

    fn start_pumps(&mut self, id: u64, socket: TcpStream) {
        let Some(flow) = self.flows.get_mut(&id) else {
            return;
        };
        let (to_socket_tx, to_socket_rx) = mpsc::unbounded_channel();
        flow.to_socket = Some(to_socket_tx);
        spawn_flow_pumps(
            id,
            socket,
            flow.window.clone(),
            to_socket_rx,
            self.events_tx.clone(),
            flow.cancel.child_token(),
            self.max_chunk,
        );
    }

    /// Deliver peer data into the flow's local socket
    ///
    /// A peer that sends past the credit it was granted has violated flow
    /// control; that flow is aborted without touching its neighbours.
    pub fn deliver(&mut self, id: u64, data: Bytes) -> Result<(), TunnelError> {
        let violated = match self.flows.get_mut(&id) {
            Some(flow) => flow.credit.delivered(data.len()).is_err(),
            None => {
                trace!(id, "data for unknown flow dropped");
                return Ok(());
            }
        };
        if violated {
            warn!(id, "flow control violated by peer");
            return self.reject(id, CloseReason::Abort);
        }
        match self.flows.get(&id).and_then(|flow| flow.to_socket.as_ref()) {
            Some(to_socket) => {
                let _ = to_socket.send(data);
            }
            None => trace!(id, "data for a flow with a closed sink dropped"),
        }
        Ok(())
    }

    /// Peer replenished a flow's send window
    pub fn handle_window_update(&mut self, id: u64, credit: u32) {
        if let Some(flow) = self.flows.get(&id) {
            flow.window.credit(credit);
            trace!(id, credit, "window update applied");
        }
    }

    /// Peer closed a flow. Reason `Ok` half-closes its data direction;
    /// anything else aborts the flow entirely.
    pub fn handle_close(&mut self, id: u64, reason: CloseReason) {
        let Some(flow) = self.flows.get_mut(&id) else {
            trace!(id, "close for unknown flow");
            return;
        };
        if reason == CloseReason::Ok {
            flow.state = flow.state.close_remote();
            // Dropping the sender lets the socket-writer drain in-flight
            // chunks and then shut the write side of the local socket
            flow.to_socket = None;
            if flow.state.is_closed() {
                self.remove_orderly(id);
            }
        } else {
            debug!(id, %reason, "flow aborted by peer");
            self.remove_aborted(id);
        }
    }

    /// Pump events from the role's main loop
    pub async fn handle_event(&mut self, event: FlowEvent) -> Result<(), TunnelError> {
        match event {
            FlowEvent::Data { id, data } => {
                let send = match self.flows.get(&id) {
                    Some(flow) => !flow.close_sent,
                    None => false,
                };
                if send {
                    self.send(Message::Data { id, payload: data })?;
                }
            }
            FlowEvent::SourceDone { id } => {
                let Some(flow) = self.flows.get_mut(&id) else {
                    return Ok(());
                };
                if !flow.close_sent {
                    flow.close_sent = true;
                    flow.state = flow.state.close_local();
                    let closed = flow.state.is_closed();
                    self.send(Message::CloseConnection {
                        id,
                        reason: CloseReason::Ok,
                    })?;
                    debug!(id, "local direction closed");
                    if closed {
                        self.remove_orderly(id);
                    }
                }
            }
            FlowEvent::Failed { id } => {
                if let Some(flow) = self.flows.get_mut(&id) {
                    let notify = !flow.close_sent;
                    flow.close_sent = true;
                    if notify {
                        self.send(Message::CloseConnection {
                            id,
                            reason: CloseReason::Abort,
                        })?;
                    }
                    debug!(id, "flow failed");
                    self.remove_aborted(id);
                }
            }
            FlowEvent::Consumed { id, n } => {
                let refreshed = match self.flows.get_mut(&id) {
                    Some(flow) => flow.credit.consumed(n),
                    None => return Ok(()),
                };
                match refreshed {
                    Ok(Some(credit)) => {
                        self.send(Message::WindowUpdate { id, credit })?;
                        trace!(id, credit, "window refreshed");
                    }
                    Ok(None) => {}
                    // Bookkeeping gone inconsistent for this flow only
                    Err(_) => self.reject(id, CloseReason::Abort)?,
                }
            }
            FlowEvent::Dialed { .. } | FlowEvent::Accepted { .. } => {
                // Role-level events, handled before reaching the multiplexer
            }
        }
        Ok(())
    }

    /// Drop a completed flow; pump tasks finish draining on their own
    fn remove_orderly(&mut self, id: u64) {
        if self.flows.remove(&id).is_some() {
            debug!(id, remaining = self.flows.len(), "flow removed");
        }
    }

    /// Kill a flow's pump tasks and forget it
    fn remove_aborted(&mut self, id: u64) {
        if let Some(flow) = self.flows.remove(&id) {
            flow.cancel.cancel();
            debug!(id, remaining = self.flows.len(), "flow aborted");
        }
    }

    /// Abort every flow; used when the tunnel itself dies
    pub fn shutdown_all(&mut self) {
        for (_, flow) in self.flows.drain() {
            flow.cancel.cancel();
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{FramedConfig, FramedConnection, INITIAL_WINDOW, MAX_CHUNK};
    use tokio::net::TcpListener;

    struct TestTunnel {
        mux: Multiplexer,
        peer: FramedConnection<TcpStream>,
        _conn: FramedConnection<TcpStream>,
        _events: mpsc::Receiver<FlowEvent>,
    }

    async fn mux_with_tunnel() -> TestTunnel {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let conn = FramedConnection::new(client, FramedConfig::default());
        let peer = FramedConnection::new(server, FramedConfig::default());
        let (events_tx, events_rx) = mpsc::channel(64);
        let mux = Multiplexer::new(conn.sender(), events_tx, INITIAL_WINDOW, MAX_CHUNK);
        TestTunnel {
            mux,
            peer,
            _conn: conn,
            _events: events_rx,
        }
    }

    #[tokio::test]
    async fn test_accept_flow_sends_open_connection() {
        let mut t = mux_with_tunnel().await;
        let (mux, peer) = (&mut t.mux, &mut t.peer);

        // A throwaway local socket pair standing in for the accepted conn
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sock = TcpStream::connect(addr).await.unwrap();

        let id = mux.accept_flow(sock, "10.0.0.9", 80).unwrap();
        assert_eq!(id, 1);
        assert_eq!(mux.flow_count(), 1);

        let frame = peer.receive().await.unwrap().unwrap();
        let msg = Message::decode(&frame).unwrap();
        assert_eq!(
            msg,
            Message::OpenConnection {
                id: 1,
                host: "10.0.0.9".to_string(),
                port: 80
            }
        );
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let mut t = mux_with_tunnel().await;
        let mux = &mut t.mux;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        for expect in 1..=3u64 {
            let sock = TcpStream::connect(addr).await.unwrap();
            let id = mux.accept_flow(sock, "h", 1).unwrap();
            assert_eq!(id, expect);
        }
    }

    #[tokio::test]
    async fn test_reject_unknown_flow_still_notifies_peer() {
        let mut t = mux_with_tunnel().await;
        let (mux, peer) = (&mut t.mux, &mut t.peer);
        mux.reject(42, CloseReason::Forbidden).unwrap();

        let frame = peer.receive().await.unwrap().unwrap();
        assert_eq!(
            Message::decode(&frame).unwrap(),
            Message::CloseConnection {
                id: 42,
                reason: CloseReason::Forbidden
            }
        );
    }

    #[tokio::test]
    async fn test_close_both_directions_removes_flow() {
        let mut t = mux_with_tunnel().await;
        let (mux, peer) = (&mut t.mux, &mut t.peer);
        assert!(mux.register_opening(7));
        assert_eq!(mux.flow_count(), 1);

        // Our side finishes first
        mux.handle_event(FlowEvent::SourceDone { id: 7 }).await.unwrap();
        assert_eq!(mux.flow_count(), 1);
        let frame = peer.receive().await.unwrap().unwrap();
        assert_eq!(
            Message::decode(&frame).unwrap(),
            Message::CloseConnection {
                id: 7,
                reason: CloseReason::Ok
            }
        );

        // Then the peer finishes; the flow is gone
        mux.handle_close(7, CloseReason::Ok);
        assert_eq!(mux.flow_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_close_removes_immediately() {
        let mut t = mux_with_tunnel().await;
        let mux = &mut t.mux;
        assert!(mux.register_opening(3));
        mux.handle_close(3, CloseReason::Abort);
        assert_eq!(mux.flow_count(), 0);
    }

    #[tokio::test]
    async fn test_no_data_after_close_sent() {
        let mut t = mux_with_tunnel().await;
        let (mux, peer) = (&mut t.mux, &mut t.peer);
        assert!(mux.register_opening(5));

        mux.handle_event(FlowEvent::SourceDone { id: 5 }).await.unwrap();
        // A straggler chunk from the reader task must be dropped
        mux.handle_event(FlowEvent::Data {
            id: 5,
            data: Bytes::from_static(b"late"),
        })
        .await
        .unwrap();

        let frame = peer.receive().await.unwrap().unwrap();
        assert_eq!(
            Message::decode(&frame).unwrap(),
            Message::CloseConnection {
                id: 5,
                reason: CloseReason::Ok
            }
        );
    }

    #[tokio::test]
    async fn test_window_refresh_after_consumption() {
        let mut t = mux_with_tunnel().await;
        let (mux, peer) = (&mut t.mux, &mut t.peer);
        assert!(mux.register_opening(9));

        let half = (INITIAL_WINDOW / 2) as usize;
        mux.handle_event(FlowEvent::Consumed { id: 9, n: half })
            .await
            .unwrap();

        let frame = peer.receive().await.unwrap().unwrap();
        assert_eq!(
            Message::decode(&frame).unwrap(),
            Message::WindowUpdate {
                id: 9,
                credit: half as u32
            }
        );
    }
}
