//! Proxy-server role
//!
//! Joins the server slot of its session, announces its forwarding targets,
//! and opens its local listeners once the partner proxy-client is present.
//! Every accepted local connection becomes a flow: the peer is asked to dial
//! the binding's target and bytes are pumped both ways until either side
//! closes.

use super::{authenticate, supervise, AuthOutcome, RunEnd};
use crate::config::{Binding, ProxyServerConfig};
use crate::protocol::{CloseReason, Message, Role, SessionTarget, DIAL_TIMEOUT, DRAIN_DEADLINE};
use crate::transport::connect_gateway;
use crate::tunnel::{
    CloseMode, FlowEvent, FramedConfig, FramedConnection, Multiplexer, INITIAL_WINDOW, MAX_CHUNK,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Run a proxy-server until shutdown or terminal auth failure
pub async fn run_proxy_server(
    config: ProxyServerConfig,
    cancel: CancellationToken,
) -> crate::Result<()> {
    info!(
        session_id = config.session_id,
        bindings = config.bindings.len(),
        "proxy-server starting, gateway {}:{}",
        config.gateway_host, config.gateway_port
    );
    let supervisor_cancel = cancel.clone();
    supervise("proxy-server", &supervisor_cancel, move || {
        run_once(config.clone(), cancel.clone())
    })
    .await
}

async fn run_once(config: ProxyServerConfig, cancel: CancellationToken) -> RunEnd {
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

    match authenticate(&mut conn, config.session_id, Role::Server, &config.password).await {
        AuthOutcome::Ok => {}
        AuthOutcome::Rejected => return RunEnd::AuthFailed,
        AuthOutcome::Lost => return RunEnd::Lost,
    }

    // Announce the forwarding targets, then wait for the partner. Listeners
    // stay closed until both the announcement is out and the partner is in.
    let targets: Vec<SessionTarget> = config
        .bindings
        .iter()
        .map(|b| SessionTarget {
            host: b.target_host.clone(),
            port: b.target_port,
        })
        .collect();
    if conn
        .sender()
        .send(Message::OpenSession { targets }.encode())
        .is_err()
    {
        return RunEnd::Lost;
    }
    info!(session_id = config.session_id, "authenticated, waiting for partner");

    let (events_tx, mut events_rx) = mpsc::channel(256);
    let mut mux = Multiplexer::new(conn.sender(), events_tx.clone(), INITIAL_WINDOW, MAX_CHUNK);

    // Child token so listeners die with the tunnel and on PartnerLeft
    let mut listeners: Option<CancellationToken> = None;

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
                match msg {
                    Message::PartnerJoined => {
                        if listeners.is_none() {
                            match open_listeners(&config.bindings, &events_tx, &cancel).await {
                                Ok(token) => {
                                    info!("partner joined, listeners open");
                                    listeners = Some(token);
                                }
                                Err(e) => {
                                    warn!(error = %e, "failed to open listeners");
                                    break RunEnd::Lost;
                                }
                            }
                        }
                    }
                    Message::PartnerLeft => {
                        info!("partner left, closing listeners and flows");
                        if let Some(token) = listeners.take() {
                            token.cancel();
                        }
                        mux.shutdown_all();
                    }
                    Message::ConnectionOpened { id } => {
                        mux.handle_connection_opened(id);
                    }
                    Message::CloseConnection { id, reason } => {
                        mux.handle_close(id, reason);
                    }
                    Message::Data { id, payload } => {
                        if mux.deliver(id, payload).is_err() {
                            break RunEnd::Lost;
                        }
                    }
                    Message::WindowUpdate { id, credit } => {
                        mux.handle_window_update(id, credit);
                    }
                    Message::GoAway { code } => {
                        break match code {
                            CloseReason::GatewayClose => RunEnd::Evicted,
                            _ => RunEnd::Lost,
                        };
                    }
                    Message::OpenSession { .. } | Message::OpenConnection { .. } => {
                        debug!("message for the opposite role ignored");
                    }
                    Message::Authenticate { .. } | Message::AuthOk | Message::AuthFailed => {
                        debug!("stray auth message ignored");
                    }
                    Message::Unknown(op) => {
                        debug!(op, "unknown opcode dropped");
                    }
                }
            }
            Some(event) = events_rx.recv() => {
                let result = match event {
                    FlowEvent::Accepted { socket, peer, binding } => {
                        let Binding { target_host, target_port, .. } = &config.bindings[binding];
                        debug!(%peer, "local connection accepted for {}:{}", target_host, target_port);
                        mux.accept_flow(socket, target_host, *target_port).map(|_| ())
                    }
                    other => mux.handle_event(other).await,
                };
                if result.is_err() {
                    break RunEnd::Lost;
                }
            }
        }
    };

    if let Some(token) = listeners.take() {
        token.cancel();
    }
    mux.shutdown_all();
    match end {
        RunEnd::Shutdown => conn.close(CloseMode::Graceful, DRAIN_DEADLINE).await,
        _ => conn.close(CloseMode::Abortive, DRAIN_DEADLINE).await,
    }
    end
}

/// Bind every configured listener and spawn its accept loop
async fn open_listeners(
    bindings: &[Binding],
    events_tx: &mpsc::Sender<FlowEvent>,
    cancel: &CancellationToken,
) -> std::io::Result<CancellationToken> {
    let token = cancel.child_token();
    for (index, binding) in bindings.iter().enumerate() {
        let (ip, port) = binding.bind_addr();
        let listener = TcpListener::bind((ip.as_str(), port)).await?;
        info!(
            "listening on {}:{} for {}:{}",
            ip, port, binding.target_host, binding.target_port
        );

        let events_tx = events_tx.clone();
        let token = token.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((socket, peer)) => {
                        socket.set_nodelay(true).ok();
                        if events_tx
                            .send(FlowEvent::Accepted {
                                socket,
                                peer,
                                binding: index,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "accept error");
                    }
                }
            }
        });
    }
    Ok(token)
}
