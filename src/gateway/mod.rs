//! Gateway role
//!
//! Accepts tunnel connections from proxy-clients and proxy-servers, pairs
//! them into statically provisioned sessions, and pumps frames between the
//! two slots of each session without interpreting them. The only frames the
//! gateway reads are the initial `Authenticate` and tunnel-level `GoAway`.

use crate::config::GatewayConfig;
use crate::protocol::{CloseReason, Message, Role, AUTH_TIMEOUT, DRAIN_DEADLINE, OP_GO_AWAY};
use crate::transport::{build_acceptor, TunnelStream};
use crate::tunnel::{CloseMode, FrameSender, FramedConfig, FramedConnection};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Frames queued for an empty slot before the sender is cut off (1 MiB)
pub const PEER_BUFFER: usize = 1024 * 1024;

/// How long a rejection close may spend flushing its final frame
const REJECT_FLUSH: std::time::Duration = std::time::Duration::from_millis(250);

struct PeerHandle {
    peer_id: u64,
    frames: FrameSender,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Slot {
    occupant: Option<PeerHandle>,
    /// Frames waiting for this slot's next occupant
    queued: VecDeque<Bytes>,
    queued_bytes: usize,
}

struct Session {
    client_password: Vec<u8>,
    server_password: Vec<u8>,
    client: Slot,
    server: Slot,
}

impl Session {
    fn slot_mut(&mut self, role: Role) -> &mut Slot {
        match role {
            Role::Client => &mut self.client,
            Role::Server => &mut self.server,
        }
    }

    fn partner_mut(&mut self, role: Role) -> &mut Slot {
        match role {
            Role::Client => &mut self.server,
            Role::Server => &mut self.client,
        }
    }

    fn password(&self, role: Role) -> &[u8] {
        match role {
            Role::Client => &self.client_password,
            Role::Server => &self.server_password,
        }
    }
}

/// Outcome of placing an authenticated peer into its slot
struct Joined {
    /// Incumbent pushed out of the slot, to be notified and closed
    evicted: Option<PeerHandle>,
    /// Partner slot occupied at join time
    partner: Option<FrameSender>,
    /// Frames that accumulated while the slot was empty
    backlog: Vec<Bytes>,
}

enum Forwarded {
    Done,
    Overflow,
}

/// Shared session registry
///
/// Every operation takes the lock briefly and never awaits while holding it.
struct Registry {
    sessions: Mutex<HashMap<i32, Session>>,
    next_peer_id: AtomicU64,
}

impl Registry {
    fn new(config: &GatewayConfig) -> Self {
        let sessions = config
            .sessions
            .iter()
            .map(|s| {
                (
                    s.id,
                    Session {
                        client_password: s.client_password.clone().into_bytes(),
                        server_password: s.server_password.clone().into_bytes(),
                        client: Slot::default(),
                        server: Slot::default(),
                    },
                )
            })
            .collect();
        Self {
            sessions: Mutex::new(sessions),
            next_peer_id: AtomicU64::new(1),
        }
    }

    /// Constant-time credential check
    fn authenticate(&self, session_id: i32, role: Role, password: &[u8]) -> bool {
        let sessions = self.sessions.lock().unwrap();
        match sessions.get(&session_id) {
            Some(session) => session.password(role).ct_eq(password).into(),
            None => false,
        }
    }

    /// Place a peer into its slot, evicting any incumbent
    fn join(&self, session_id: i32, role: Role, frames: FrameSender) -> Option<(u64, CancellationToken, Joined)> {
        let peer_id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(&session_id)?;

        let slot = session.slot_mut(role);
        let evicted = slot.occupant.take();
        slot.occupant = Some(PeerHandle {
            peer_id,
            frames,
            cancel: cancel.clone(),
        });
        let backlog: Vec<Bytes> = slot.queued.drain(..).collect();
        slot.queued_bytes = 0;

        // In-flight frames from the evicted incumbent must not reach the
        // partner; whatever it queued for an absent partner is dropped
        if evicted.is_some() {
            let partner_slot = session.partner_mut(role);
            partner_slot.queued.clear();
            partner_slot.queued_bytes = 0;
        }

        let partner = session
            .partner_mut(role)
            .occupant
            .as_ref()
            .map(|p| p.frames.clone());

        Some((
            peer_id,
            cancel,
            Joined {
                evicted,
                partner,
                backlog,
            },
        ))
    }

    /// Forward a frame to the partner slot, queueing when it is empty
    fn forward(&self, session_id: i32, from: Role, frame: Bytes) -> Forwarded {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(session) = sessions.get_mut(&session_id) else {
            return Forwarded::Done;
        };
        let partner = session.partner_mut(from);
        match &partner.occupant {
            Some(handle) => {
                // A failed send means the partner is mid-teardown; its own
                // pump loop will clear the slot shortly
                let _ = handle.frames.send(frame);
                Forwarded::Done
            }
            None => {
                if partner.queued_bytes + frame.len() > PEER_BUFFER {
                    return Forwarded::Overflow;
                }
                partner.queued_bytes += frame.len();
                partner.queued.push_back(frame);
                Forwarded::Done
            }
        }
    }

    /// Clear a slot on disconnect; returns the partner to notify.
    /// A stale peer id (already evicted) leaves the slot untouched.
    fn leave(&self, session_id: i32, role: Role, peer_id: u64) -> Option<FrameSender> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(&session_id)?;
        let slot = session.slot_mut(role);
        match &slot.occupant {
            Some(handle) if handle.peer_id == peer_id => {
                slot.occupant = None;
            }
            _ => return None,
        }
        session
            .partner_mut(role)
            .occupant
            .as_ref()
            .map(|p| p.frames.clone())
    }

    fn shutdown(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        for session in sessions.values_mut() {
            for slot in [&mut session.client, &mut session.server] {
                if let Some(handle) = slot.occupant.take() {
                    handle.cancel.cancel();
                }
            }
        }
    }
}

/// Run the gateway until the token is cancelled
pub async fn run(config: GatewayConfig, cancel: CancellationToken) -> crate::Result<()> {
    let registry = Arc::new(Registry::new(&config));
    info!(
        sessions = config.sessions.len(),
        listeners = config.listeners.len(),
        "gateway starting"
    );

    let mut accept_tasks = Vec::new();
    for listener_config in &config.listeners {
        let acceptor = match (&listener_config.tls_cert, &listener_config.tls_key) {
            (Some(cert), Some(key)) => Some(build_acceptor(cert, key)?),
            _ => None,
        };

        let (ip, port) = listener_config.bind_addr();
        let listener = TcpListener::bind((ip.as_str(), port)).await?;
        info!(%ip, port, tls = acceptor.is_some(), "gateway listening");

        let registry = registry.clone();
        let cancel = cancel.clone();
        accept_tasks.push(tokio::spawn(accept_loop(
            listener, acceptor, registry, cancel,
        )));
    }

    cancel.cancelled().await;
    registry.shutdown();
    for task in accept_tasks {
        task.abort();
    }
    info!("gateway stopped");
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    registry: Arc<Registry>,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "accept error");
                    continue;
                }
            },
        };
        debug!(%peer_addr, "new tunnel connection");
        stream.set_nodelay(true).ok();

        let acceptor = acceptor.clone();
        let registry = registry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let stream: TunnelStream = match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls) => Box::new(tls),
                    Err(e) => {
                        debug!(%peer_addr, error = %e, "tls accept failed");
                        return;
                    }
                },
                None => Box::new(stream),
            };
            if let Err(e) = handle_peer(stream, peer_addr.to_string(), registry, cancel).await {
                debug!(%peer_addr, error = %e, "peer connection ended");
            }
        });
    }
}

/// Drive one tunnel peer from auth to disconnect
async fn handle_peer(
    stream: TunnelStream,
    peer_addr: String,
    registry: Arc<Registry>,
    gateway_cancel: CancellationToken,
) -> crate::Result<()> {
    let mut conn = FramedConnection::new(stream, FramedConfig::with_peer(peer_addr.clone()));

    // Exactly one Authenticate, within the auth deadline
    let frame = match timeout(AUTH_TIMEOUT, conn.receive()).await {
        Err(_) => {
            debug!(peer = %peer_addr, "auth timeout");
            conn.close(CloseMode::Abortive, DRAIN_DEADLINE).await;
            return Ok(());
        }
        Ok(result) => match result? {
            Some(frame) => frame,
            None => return Ok(()),
        },
    };

    let (session_id, role) = match Message::decode(&frame)? {
        Message::Authenticate {
            session_id,
            role,
            password,
        } if registry.authenticate(session_id, role, &password) => (session_id, role),
        Message::Authenticate { session_id, role, .. } => {
            warn!(peer = %peer_addr, session_id, %role, "authentication failed");
            let _ = conn.sender().send(Message::AuthFailed.encode());
            conn.close_after_flush(REJECT_FLUSH).await;
            return Ok(());
        }
        other => {
            debug!(peer = %peer_addr, ?other, "expected Authenticate");
            conn.close(CloseMode::Abortive, DRAIN_DEADLINE).await;
            return Ok(());
        }
    };

    let Some((peer_id, peer_cancel, joined)) = registry.join(session_id, role, conn.sender())
    else {
        // Session vanished between authenticate and join; treat as failure
        let _ = conn.sender().send(Message::AuthFailed.encode());
        conn.close_after_flush(REJECT_FLUSH).await;
        return Ok(());
    };

    info!(peer = %peer_addr, session_id, %role, "peer joined");

    // Push the incumbent out before the newcomer sees any traffic
    if let Some(evicted) = joined.evicted {
        debug!(session_id, %role, "evicting incumbent");
        let _ = evicted.frames.send(
            Message::GoAway {
                code: CloseReason::GatewayClose,
            }
            .encode(),
        );
        evicted.cancel.cancel();
        if let Some(partner) = &joined.partner {
            let _ = partner.send(Message::PartnerLeft.encode());
        }
    }

    let sender = conn.sender();
    let _ = sender.send(Message::AuthOk.encode());
    if let Some(partner) = &joined.partner {
        let _ = sender.send(Message::PartnerJoined.encode());
        let _ = partner.send(Message::PartnerJoined.encode());
    }
    for frame in joined.backlog {
        let _ = sender.send(frame);
    }

    // Transparent pump until disconnect, eviction or gateway shutdown
    let outcome = pump_peer(&mut conn, &registry, session_id, role, &peer_cancel, &gateway_cancel).await;

    if let Some(partner) = registry.leave(session_id, role, peer_id) {
        let _ = partner.send(Message::PartnerLeft.encode());
    }

    match outcome {
        PumpOutcome::Orderly => {
            conn.close(CloseMode::Graceful, DRAIN_DEADLINE).await;
        }
        PumpOutcome::Evicted => {
            // Evicted incumbents get the GoAway notice and a graceful close
            conn.close(CloseMode::Graceful, DRAIN_DEADLINE).await;
        }
        PumpOutcome::Overflow => {
            let _ = conn.sender().send(
                Message::GoAway {
                    code: CloseReason::Overflow,
                }
                .encode(),
            );
            conn.close_after_flush(REJECT_FLUSH).await;
        }
        PumpOutcome::Error => {
            conn.close(CloseMode::Abortive, DRAIN_DEADLINE).await;
        }
    }

    info!(peer = %peer_addr, session_id, %role, "peer left");
    Ok(())
}

enum PumpOutcome {
    Orderly,
    Evicted,
    Overflow,
    Error,
}

async fn pump_peer(
    conn: &mut FramedConnection<TunnelStream>,
    registry: &Registry,
    session_id: i32,
    role: Role,
    peer_cancel: &CancellationToken,
    gateway_cancel: &CancellationToken,
) -> PumpOutcome {
    loop {
        let received = tokio::select! {
            _ = peer_cancel.cancelled() => return PumpOutcome::Evicted,
            _ = gateway_cancel.cancelled() => return PumpOutcome::Orderly,
            received = conn.receive() => received,
        };

        let frame = match received {
            Ok(Some(frame)) => frame,
            Ok(None) => return PumpOutcome::Orderly,
            Err(e) => {
                debug!(session_id, %role, error = %e, "tunnel receive error");
                return PumpOutcome::Error;
            }
        };

        // The single tunnel-level message the gateway interprets: an
        // orderly departure. Everything else passes through verbatim.
        if frame.first() == Some(&OP_GO_AWAY) {
            return PumpOutcome::Orderly;
        }

        match registry.forward(session_id, role, frame) {
            Forwarded::Done => {}
            Forwarded::Overflow => {
                warn!(session_id, %role, "peer buffer overflow");
                return PumpOutcome::Overflow;
            }
        }
    }
}
