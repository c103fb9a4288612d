//! # Portgate
//!
//! A reverse TCP tunneling proxy. A proxy-server on one side of a gateway
//! and a proxy-client on the other both dial out to the gateway, which pairs
//! them into a session. The proxy-server listens on local ports and forwards
//! every accepted TCP connection through the tunnel; the proxy-client dials
//! the target endpoint and pumps bytes back.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Role Layer                        │
//! │        (gateway, proxy-client, proxy-server)         │
//! ├─────────────────────────────────────────────────────┤
//! │                 Multiplexing Layer                   │
//! │        (per-flow windows, fair interleaving)         │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel Layer                       │
//! │     (length-prefixed framing, ping supervision)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │                 (TCP, optional TLS)                  │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod gateway;
pub mod protocol;
pub mod proxy;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum frame size on the tunnel (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Default gateway port
pub const DEFAULT_PORT: u16 = 8000;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,

    #[error("Authentication failed")]
    AuthenticationFailed,
}
