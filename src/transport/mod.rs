//! Transport layer: establishing the outer byte stream
//!
//! The tunnel layer is polymorphic over any bidirectional byte stream; this
//! module produces those streams. TLS is an adapter wrapped around the raw
//! TCP stream before the framed connection is constructed, never a concern
//! of the layers above.

use rustls::pki_types::ServerName;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Timeout")]
    Timeout,
}

/// Capability set required of the outer stream
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}

/// An established outer stream, plain or TLS-wrapped
pub type TunnelStream = Box<dyn TunnelIo>;

/// Dial a TCP endpoint with a timeout, returning a nodelay socket
pub async fn dial_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| TransportError::Timeout)??;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Establish the outer stream to a gateway, wrapping in TLS when asked
pub async fn connect_gateway(
    host: &str,
    port: u16,
    use_tls: bool,
    timeout: Duration,
) -> Result<TunnelStream, TransportError> {
    let stream = dial_tcp(host, port, timeout).await?;

    if !use_tls {
        return Ok(Box::new(stream));
    }

    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::Tls(format!("invalid server name '{}': {}", host, e)))?;

    let tls_stream = tokio::time::timeout(timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    debug!(host, port, "tls handshake complete");
    Ok(Box::new(tls_stream))
}

/// Build a TLS acceptor from PEM cert/key files (gateway listeners)
pub fn build_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, TransportError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Load a TLS certificate chain from a PEM file
fn load_certs(
    path: &str,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, TransportError> {
    let mut file = io::BufReader::new(std::fs::File::open(path)?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("failed to parse {}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates found in {}",
            path
        )));
    }
    Ok(certs)
}

/// Load a TLS private key from a PEM file
fn load_private_key(
    path: &str,
) -> Result<rustls::pki_types::PrivateKeyDer<'static>, TransportError> {
    let mut file = io::BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::private_key(&mut file)
        .map_err(|e| TransportError::Tls(format!("failed to parse {}: {}", path, e)))?
        .ok_or_else(|| TransportError::Tls(format!("no private key found in {}", path)))
}
