//! Tunnel layer - framed connection and flow multiplexing
//!
//! Provides:
//! - Length-prefixed frame transport with ping/idle supervision
//! - Per-flow state and window accounting
//! - Flow multiplexing over one tunnel
//! - Socket pump tasks for proxied connections

mod flow;
mod framed;
mod multiplexer;
mod pump;

pub use flow::{FlowState, SendWindow};
pub use framed::{CloseMode, FrameSender, FramedConfig, FramedConnection};
pub use multiplexer::{FlowEvent, Multiplexer};
pub use pump::spawn_flow_pumps;

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Idle timeout expired")]
    IdleTimeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Flow control violation")]
    FlowControl,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Initial per-direction flow-control window (384 KiB)
pub const INITIAL_WINDOW: u32 = 384 * 1024;

/// Largest Data chunk a single flow may put on the tunnel at once (16 KiB)
pub const MAX_CHUNK: usize = 16 * 1024;

/// Interval between keep-alive pings when the connection is idle outbound
pub const PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Slack added on top of two ping intervals before declaring the peer dead
pub const IDLE_SLACK: std::time::Duration = std::time::Duration::from_secs(60);
