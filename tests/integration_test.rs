//! Integration tests for Portgate
//!
//! Exercises the full gateway / proxy-client / proxy-server triangle over
//! loopback: echo round trips, allowlist rejection, reconnection, eviction,
//! half-close and flow-control behaviour.

use portgate::config::{
    Binding, Endpoint, GatewayConfig, GatewayListener, ProxyClientConfig, ProxyServerConfig,
    SessionConfig,
};
use portgate::tunnel::{spawn_flow_pumps, FlowEvent, SendWindow, MAX_CHUNK};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Reserve a loopback port by binding and immediately releasing it
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Echo server: copies every connection's input back until EOF
async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    port
}

fn gateway_config(port: u16) -> GatewayConfig {
    GatewayConfig {
        listeners: vec![GatewayListener {
            ip: Some("127.0.0.1".to_string()),
            port,
            tls_cert: None,
            tls_key: None,
        }],
        sessions: vec![SessionConfig {
            id: 1,
            client_password: "c".to_string(),
            server_password: "s".to_string(),
        }],
    }
}

fn client_config(gateway_port: u16, allowlist: Option<Vec<Endpoint>>) -> ProxyClientConfig {
    ProxyClientConfig {
        gateway_host: "127.0.0.1".to_string(),
        gateway_port,
        use_tls: false,
        session_id: 1,
        password: "c".to_string(),
        allowlist,
    }
}

fn server_config(gateway_port: u16, bindings: Vec<Binding>) -> ProxyServerConfig {
    ProxyServerConfig {
        gateway_host: "127.0.0.1".to_string(),
        gateway_port,
        use_tls: false,
        session_id: 1,
        password: "s".to_string(),
        bindings,
    }
}

fn binding(listen_port: u16, target_port: u16) -> Binding {
    Binding {
        listen_ip: Some("127.0.0.1".to_string()),
        listen_port,
        target_host: "127.0.0.1".to_string(),
        target_port,
    }
}

/// Keep connecting until the proxy-server's listener comes up
async fn connect_with_retry(port: u16, deadline: Duration) -> Option<TcpStream> {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return Some(stream);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

struct Triangle {
    cancel: CancellationToken,
    listen_port: u16,
}

impl Triangle {
    /// Gateway + proxy-server + proxy-client wired to one echo target
    async fn start(target_port: u16, allowlist: Option<Vec<Endpoint>>) -> Self {
        Self::start_with_bindings(vec![], target_port, allowlist).await
    }

    async fn start_with_bindings(
        extra_bindings: Vec<Binding>,
        target_port: u16,
        allowlist: Option<Vec<Endpoint>>,
    ) -> Self {
        let gateway_port = free_port().await;
        let listen_port = free_port().await;
        let cancel = CancellationToken::new();

        let mut bindings = vec![binding(listen_port, target_port)];
        bindings.extend(extra_bindings);

        tokio::spawn(portgate::gateway::run(
            gateway_config(gateway_port),
            cancel.clone(),
        ));
        tokio::spawn(portgate::proxy::run_proxy_server(
            server_config(gateway_port, bindings),
            cancel.clone(),
        ));
        tokio::spawn(portgate::proxy::run_proxy_client(
            client_config(gateway_port, allowlist),
            cancel.clone(),
        ));

        Self {
            cancel,
            listen_port,
        }
    }
}

impl Drop for Triangle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A local connection through the whole triangle echoes bytes back
#[tokio::test]
async fn test_echo_round_trip() {
    let echo_port = spawn_echo_server().await;
    let triangle = Triangle::start(echo_port, None).await;

    let mut stream = connect_with_retry(triangle.listen_port, Duration::from_secs(10))
        .await
        .expect("proxied listener never opened");

    stream.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(1), stream.read_exact(&mut buf))
        .await
        .expect("no echo within 1s")
        .unwrap();
    assert_eq!(&buf, b"hello");
}

/// Multiple concurrent connections each get their own clean echo
#[tokio::test]
async fn test_concurrent_flows() {
    let echo_port = spawn_echo_server().await;
    let triangle = Triangle::start(echo_port, None).await;

    let first = connect_with_retry(triangle.listen_port, Duration::from_secs(10))
        .await
        .expect("proxied listener never opened");

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let port = triangle.listen_port;
        tasks.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let payload = vec![i; 1000];
            stream.write_all(&payload).await.unwrap();
            let mut buf = vec![0u8; 1000];
            timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
                .await
                .expect("echo timed out")
                .unwrap();
            assert_eq!(buf, payload);
        }));
    }
    drop(first);
    for task in tasks {
        task.await.unwrap();
    }
}

/// A target outside the allowlist is refused and the tunnel stays healthy
#[tokio::test]
async fn test_forbidden_target() {
    let echo_port = spawn_echo_server().await;
    let forbidden_listen = free_port().await;
    // Allowlist admits only the echo target; the extra binding points at the
    // discard port which is not on the list
    let allowlist = vec![Endpoint {
        host: "127.0.0.1".to_string(),
        port: echo_port,
    }];
    let triangle = Triangle::start_with_bindings(
        vec![binding(forbidden_listen, 9)],
        echo_port,
        Some(allowlist),
    )
    .await;

    // Wait for the session to go active
    let probe = connect_with_retry(triangle.listen_port, Duration::from_secs(10))
        .await
        .expect("proxied listener never opened");
    drop(probe);

    // The forbidden binding accepts, then the flow is shot down
    let mut stream = TcpStream::connect(("127.0.0.1", forbidden_listen))
        .await
        .unwrap();
    stream.write_all(b"knock").await.unwrap();
    let mut buf = [0u8; 16];
    let outcome = timeout(Duration::from_secs(5), stream.read(&mut buf)).await;
    match outcome {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        other => panic!("expected close on forbidden flow, got {:?}", other),
    }

    // The allowed binding still works: the tunnel survived
    let mut stream = TcpStream::connect(("127.0.0.1", triangle.listen_port))
        .await
        .unwrap();
    stream.write_all(b"still alive").await.unwrap();
    let mut buf = [0u8; 11];
    timeout(Duration::from_secs(1), stream.read_exact(&mut buf))
        .await
        .expect("tunnel unhealthy after forbidden flow")
        .unwrap();
    assert_eq!(&buf, b"still alive");
}

/// A proxy-server started before the gateway keeps retrying, opens its
/// listeners only once the gateway appears and the partner joins
#[tokio::test]
async fn test_gateway_absent_then_appears() {
    let echo_port = spawn_echo_server().await;
    let gateway_port = free_port().await;
    let listen_port = free_port().await;
    let cancel = CancellationToken::new();

    tokio::spawn(portgate::proxy::run_proxy_server(
        server_config(gateway_port, vec![binding(listen_port, echo_port)]),
        cancel.clone(),
    ));

    // No gateway: the local listener must stay closed
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        TcpStream::connect(("127.0.0.1", listen_port)).await.is_err(),
        "listener must not open while reconnecting"
    );

    // Bring up the gateway and the partner
    tokio::spawn(portgate::gateway::run(
        gateway_config(gateway_port),
        cancel.clone(),
    ));
    tokio::spawn(portgate::proxy::run_proxy_client(
        client_config(gateway_port, None),
        cancel.clone(),
    ));

    // Backoff starts at ~3s; well inside 15s the listener must be up
    let stream = connect_with_retry(listen_port, Duration::from_secs(15)).await;
    assert!(stream.is_some(), "listener never opened after gateway came up");
    cancel.cancel();
}

/// An oversize declared frame length gets the connection dropped
#[tokio::test]
async fn test_oversize_frame_rejected_by_gateway() {
    let gateway_port = free_port().await;
    let cancel = CancellationToken::new();
    tokio::spawn(portgate::gateway::run(
        gateway_config(gateway_port),
        cancel.clone(),
    ));

    let mut stream = connect_with_retry(gateway_port, Duration::from_secs(5))
        .await
        .expect("gateway never came up");

    let oversize = ((portgate::MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
    stream.write_all(&oversize).await.unwrap();

    let mut buf = [0u8; 16];
    let outcome = timeout(Duration::from_secs(5), stream.read(&mut buf)).await;
    match outcome {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        other => panic!("expected abortive close, got {:?}", other),
    }
    cancel.cancel();
}

/// A second client with the same credentials evicts the first
#[tokio::test]
async fn test_eviction() {
    let gateway_port = free_port().await;
    let cancel = CancellationToken::new();
    tokio::spawn(portgate::gateway::run(
        gateway_config(gateway_port),
        cancel.clone(),
    ));

    let first = tokio::spawn(portgate::proxy::run_proxy_client(
        client_config(gateway_port, None),
        cancel.clone(),
    ));
    // Let the first client settle into its slot
    tokio::time::sleep(Duration::from_millis(500)).await;

    let _second = tokio::spawn(portgate::proxy::run_proxy_client(
        client_config(gateway_port, None),
        cancel.clone(),
    ));

    // The evicted client observes the gateway-close notice and stops cleanly
    let outcome = timeout(Duration::from_secs(5), first)
        .await
        .expect("evicted client did not stop")
        .unwrap();
    assert!(outcome.is_ok());
    cancel.cancel();
}

/// Half-close: bytes written before shutdown arrive exactly, the reverse
/// direction keeps working, and EOF propagates end-to-end
#[tokio::test]
async fn test_half_close_exact_bytes() {
    // Target reads everything until EOF, then echoes it back and closes
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_port = target.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = target.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut collected = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => collected.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = socket.write_all(&collected).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    let triangle = Triangle::start(target_port, None).await;
    let mut stream = connect_with_retry(triangle.listen_port, Duration::from_secs(10))
        .await
        .expect("proxied listener never opened");

    let payload: Vec<u8> = (0..100u8).collect();
    stream.write_all(&payload).await.unwrap();
    // Half-close our sending direction; the target sees EOF and replies
    stream.shutdown().await.unwrap();

    let mut received = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
        .await
        .expect("no reply after half-close")
        .unwrap();
    assert_eq!(received, payload);
}

/// Wrong password is terminal: no reconnect loop
#[tokio::test]
async fn test_failed_auth_is_terminal() {
    let gateway_port = free_port().await;
    let cancel = CancellationToken::new();
    tokio::spawn(portgate::gateway::run(
        gateway_config(gateway_port),
        cancel.clone(),
    ));

    let mut config = server_config(gateway_port, vec![binding(free_port().await, 9)]);
    config.password = "wrong".to_string();

    let result = timeout(
        Duration::from_secs(5),
        portgate::proxy::run_proxy_server(config, cancel.clone()),
    )
    .await
    .expect("auth failure must be prompt");
    assert!(matches!(result, Err(portgate::Error::AuthenticationFailed)));
    cancel.cancel();
}

/// Fair interleaving: flows with endless input split the tunnel's output
/// evenly; over a 1 MiB sample each flow's byte share stays within
/// 1/N ± 0.1
#[tokio::test]
async fn test_fair_interleaving() {
    const FLOWS: usize = 4;
    const SAMPLE: usize = 1024 * 1024;

    let (events_tx, mut events_rx) = mpsc::channel(64);
    for id in 0..FLOWS as u64 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut feeder = TcpStream::connect(addr).await.unwrap();
        let (local, _) = listener.accept().await.unwrap();

        // An endless stream of input for this flow
        tokio::spawn(async move {
            let block = vec![id as u8; 64 * 1024];
            while feeder.write_all(&block).await.is_ok() {}
        });

        let (_to_socket_tx, to_socket_rx) = mpsc::unbounded_channel();
        spawn_flow_pumps(
            id,
            local,
            Arc::new(SendWindow::new(u32::MAX / 2)),
            to_socket_rx,
            events_tx.clone(),
            CancellationToken::new(),
            MAX_CHUNK,
        );
    }

    let mut per_flow = [0usize; FLOWS];
    let mut total = 0usize;
    while total < SAMPLE {
        match timeout(Duration::from_secs(10), events_rx.recv()).await {
            Ok(Some(FlowEvent::Data { id, data })) => {
                per_flow[id as usize] += data.len();
                total += data.len();
            }
            Ok(Some(_)) => {}
            other => panic!("tunnel output stalled: {:?}", other),
        }
    }

    let fair_share = 1.0 / FLOWS as f64;
    for (id, &bytes) in per_flow.iter().enumerate() {
        let observed = bytes as f64 / total as f64;
        assert!(
            (observed - fair_share).abs() <= 0.1,
            "flow {} got {:.3} of the bytes, expected {:.3} within 0.1",
            id,
            observed,
            fair_share
        );
    }
}

/// Window starvation: with a 1 KiB window, exactly one window of data moves
/// per credit
#[tokio::test]
async fn test_window_starvation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut feeder = TcpStream::connect(addr).await.unwrap();
    let (local, _) = listener.accept().await.unwrap();

    let window = Arc::new(SendWindow::new(1024));
    let (events_tx, mut events_rx) = mpsc::channel(64);
    let (_to_socket_tx, to_socket_rx) = mpsc::unbounded_channel();
    spawn_flow_pumps(
        1,
        local,
        window.clone(),
        to_socket_rx,
        events_tx,
        CancellationToken::new(),
        MAX_CHUNK,
    );

    feeder.write_all(&vec![0xAB; 10 * 1024]).await.unwrap();

    let mut total = 0usize;
    while total < 10 * 1024 {
        // Drain exactly one window's worth
        let mut burst = 0usize;
        loop {
            match timeout(Duration::from_millis(200), events_rx.recv()).await {
                Ok(Some(FlowEvent::Data { data, .. })) => burst += data.len(),
                Ok(other) => panic!("unexpected event {:?}", other),
                Err(_) => break,
            }
        }
        assert_eq!(burst, 1024, "exactly one window of data per credit");
        total += burst;
        if total < 10 * 1024 {
            window.credit(1024);
        }
    }
    assert_eq!(total, 10 * 1024);
}
