//! Proxy-client role
//!
//! Joins the client slot of its session and waits for the partner
//! proxy-server to request connections. Each `OpenConnection` is checked
//! against the allowlist, dialled with a deadline, and on success pumped
//! through the multiplexer until either end closes.

use super::{authenticate, supervise, AuthOutcome, RunEnd};
use crate::config::ProxyClientConfig;
use crate::protocol::{CloseReason, Message, Role, DIAL_TIMEOUT, DRAIN_DEADLINE};
use crate::transport::{connect_gateway, dial_tcp};
use crate::tunnel::{
    CloseMode, FlowEvent, FramedConfig, FramedConnection, Multiplexer, INITIAL_WINDOW, MAX_CHUNK,
};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Run a proxy-client until shutdown or terminal auth failure
pub async fn run_proxy_client(
    config: ProxyClientConfig,
    cancel: CancellationToken,
) -> crate::Result<()> {
    info!(
        session_id = config.session_id,
        "proxy-client starting, gateway {}:{}",
        config.gateway_host, config.gateway_port
    );
    let supervisor_cancel = cancel.clone();
    supervise("proxy-client", &supervisor_cancel, move || {
        run_once(config.clone(), cancel.clone())
    })
    .await
}

async fn run_once(config: ProxyClientConfig, cancel: CancellationToken) -> RunEnd {
    let stream = match connect_gateway(
        &config.gateway_host,
        config.gateway_port,
        config.use_tls,
        DIAL_TIMEOUT,
    )
    .await
    {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "failed to reach gateway");
            return RunEnd::Lost;
        }
    };

    let peer = format!("{}:{}", config.gateway_host, config.gateway_port);
    let mut conn = FramedConnection::new(stream, FramedConfig::with_peer(peer));

    match authenticate(&mut conn, config.session_id, Role::Client, &config.password).await {
        AuthOutcome::Ok => {}
        AuthOutcome::Rejected => return RunEnd::AuthFailed,
        AuthOutcome::Lost => return RunEnd::Lost,
    }
    info!(session_id = config.session_id, "authenticated, waiting for partner");

    let allowlist: Option<HashSet<(String, u16)>> = config
        .allowlist
        .as_ref()
        .map(|list| list.iter().map(|e| (e.host.clone(), e.port)).collect());

    let (events_tx, mut events_rx) = mpsc::channel(256);
    let mut mux = Multiplexer::new(conn.sender(), events_tx.clone(), INITIAL_WINDOW, MAX_CHUNK);

    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = conn.sender().send(Message::GoAway { code: CloseReason::Ok }.encode());
                break RunEnd::Shutdown;
            }
            received = conn.receive() => {
                let frame = match received {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        info!("gateway closed the tunnel");
                        break RunEnd::Lost;
                    }
                    Err(e) => {
                        warn!(error = %e, "tunnel error");
                        break RunEnd::Lost;
                    }
                };
                let msg = match Message::decode(&frame) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(error = %e, "malformed message, dropping tunnel");
                        break RunEnd::Lost;
                    }
                };
                match handle_message(&mut mux, &allowlist, &events_tx, msg).await {
                    Ok(None) => {}
                    Ok(Some(end)) => break end,
                    Err(_) => break RunEnd::Lost,
                }
            }
            Some(event) = events_rx.recv() => {
                if handle_event(&mut mux, event).await.is_err() {
                    break RunEnd::Lost;
                }
            }
        }
    };

    mux.shutdown_all();
    match end {
        RunEnd::Shutdown => conn.close(CloseMode::Graceful, DRAIN_DEADLINE).await,
        _ => conn.close(CloseMode::Abortive, DRAIN_DEADLINE).await,
    }
    end
}

/// Dispatch one inbound protocol message; `Some(end)` finishes the run
async fn handle_message(
    mux: &mut Multiplexer,
    allowlist: &Option<HashSet<(String, u16)>>,
    events_tx: &mpsc::Sender<FlowEvent>,
    msg: Message,
) -> Result<Option<RunEnd>, crate::tunnel::TunnelError> {
    match msg {
        Message::PartnerJoined => {
            info!("partner joined, session active");
        }
        Message::PartnerLeft => {
            info!("partner left, dropping all flows");
            mux.shutdown_all();
        }
        Message::OpenSession { targets } => {
            // Informational: the partner announces what it will forward.
            // Authorization stays with the allowlist on each open.
            info!(targets = %targets.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "), "partner session targets");
        }
        Message::OpenConnection { id, host, port } => {
            let allowed = match allowlist {
                Some(set) => set.contains(&(host.clone(), port)),
                None => true,
            };
            if !allowed {
                warn!(id, "target {}:{} not in allowlist", host, port);
                mux.reject(id, CloseReason::Forbidden)?;
            } else if !mux.register_opening(id) {
                warn!(id, "duplicate connection id");
                mux.reject(id, CloseReason::Abort)?;
            } else {
                debug!(id, "dialling target {}:{}", host, port);
                let events_tx = events_tx.clone();
                tokio::spawn(async move {
                    let socket = dial_tcp(&host, port, DIAL_TIMEOUT).await.ok();
                    let _ = events_tx.send(FlowEvent::Dialed { id, socket }).await;
                });
            }
        }
        Message::ConnectionOpened { id } => {
            // Only the proxy-server opens flows; nothing to confirm here
            debug!(id, "unexpected ConnectionOpened");
        }
        Message::CloseConnection { id, reason } => {
            mux.handle_close(id, reason);
        }
        Message::Data { id, payload } => {
            mux.deliver(id, payload)?;
        }
        Message::WindowUpdate { id, credit } => {
            mux.handle_window_update(id, credit);
        }
        Message::GoAway { code } => {
            return Ok(Some(match code {
                CloseReason::GatewayClose => RunEnd::Evicted,
                _ => RunEnd::Lost,
            }));
        }
        Message::Authenticate { .. } | Message::AuthOk | Message::AuthFailed => {
            debug!("stray auth message ignored");
        }
        Message::Unknown(op) => {
            debug!(op, "unknown opcode dropped");
        }
    }
    Ok(None)
}

async fn handle_event(
    mux: &mut Multiplexer,
    event: FlowEvent,
) -> Result<(), crate::tunnel::TunnelError> {
    match event {
        FlowEvent::Dialed { id, socket } => match socket {
            Some(socket) => {
                socket.set_nodelay(true).ok();
                mux.attach_dialed(id, socket)?;
            }
            None => {
                debug!(id, "target unreachable");
                mux.reject(id, CloseReason::Unreachable)?;
            }
        },
        other => mux.handle_event(other).await?,
    }
    Ok(())
}
