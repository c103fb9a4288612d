//! Protocol messages carried inside tunnel frames
//!
//! Every non-ping frame starts with a one-byte opcode followed by the
//! message payload. Variable-length fields are prefixed with a 4-byte
//! big-endian count. The opcode table is a stable wire contract; unknown
//! opcodes decode to [`Message::Unknown`] so newer peers can add messages
//! without breaking older ones.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(&'static str),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(&'static str),
}

/// Maximum encoded message size, equal to the framing cap (1 MiB)
pub const MAX_MESSAGE_SIZE: usize = crate::MAX_FRAME_SIZE;

/// How long a freshly accepted peer may take to authenticate
pub const AUTH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// How long a proxy-client may spend dialling a target
pub const DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// How long a graceful shutdown drains remaining inbound frames
pub const DRAIN_DEADLINE: std::time::Duration = std::time::Duration::from_secs(2);

pub const OP_AUTHENTICATE: u8 = 0x01;
pub const OP_AUTH_OK: u8 = 0x02;
pub const OP_AUTH_FAILED: u8 = 0x03;
pub const OP_PARTNER_JOINED: u8 = 0x04;
pub const OP_PARTNER_LEFT: u8 = 0x05;
pub const OP_OPEN_SESSION: u8 = 0x06;
pub const OP_OPEN_CONNECTION: u8 = 0x10;
pub const OP_CONNECTION_OPENED: u8 = 0x11;
pub const OP_CLOSE_CONNECTION: u8 = 0x12;
pub const OP_DATA: u8 = 0x13;
pub const OP_WINDOW_UPDATE: u8 = 0x14;
pub const OP_GO_AWAY: u8 = 0x1F;

/// Which end of a session a peer authenticates as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    Client = 0,
    Server = 1,
}

impl TryFrom<u8> for Role {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Role::Client),
            1 => Ok(Role::Server),
            _ => Err(ProtocolError::Malformed("invalid role byte")),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Why a flow (or the whole tunnel, via GoAway) was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseReason {
    /// Orderly close of the sender's data direction
    Ok = 0,
    /// Abortive close, both directions
    Abort = 1,
    /// Target could not be dialled
    Unreachable = 2,
    /// Target rejected by the proxy-client allowlist
    Forbidden = 3,
    /// Peer buffer overflowed at the gateway
    Overflow = 4,
    /// Closed by the gateway (eviction)
    GatewayClose = 5,
}

impl CloseReason {
    /// Lenient conversion; unknown reasons are treated as aborts so that
    /// a newer peer's reason codes still tear the flow down.
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => CloseReason::Ok,
            1 => CloseReason::Abort,
            2 => CloseReason::Unreachable,
            3 => CloseReason::Forbidden,
            4 => CloseReason::Overflow,
            5 => CloseReason::GatewayClose,
            _ => CloseReason::Abort,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::Ok => "ok",
            CloseReason::Abort => "abort",
            CloseReason::Unreachable => "unreachable",
            CloseReason::Forbidden => "forbidden",
            CloseReason::Overflow => "overflow",
            CloseReason::GatewayClose => "gateway-close",
        };
        write!(f, "{}", s)
    }
}

/// A (host, port) target announced in an `OpenSession` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A typed protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Authenticate {
        session_id: i32,
        role: Role,
        password: Vec<u8>,
    },
    AuthOk,
    AuthFailed,
    PartnerJoined,
    PartnerLeft,
    OpenSession {
        targets: Vec<SessionTarget>,
    },
    OpenConnection {
        id: u64,
        host: String,
        port: u16,
    },
    ConnectionOpened {
        id: u64,
    },
    CloseConnection {
        id: u64,
        reason: CloseReason,
    },
    Data {
        id: u64,
        payload: Bytes,
    },
    WindowUpdate {
        id: u64,
        credit: u32,
    },
    GoAway {
        code: CloseReason,
    },
    /// Unrecognized opcode, dropped silently by state machines
    Unknown(u8),
}

impl Message {
    /// Encode this message into a frame payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Message::Authenticate {
                session_id,
                role,
                password,
            } => {
                buf.put_u8(OP_AUTHENTICATE);
                buf.put_i32(*session_id);
                buf.put_u8(*role as u8);
                put_bytes(&mut buf, password);
            }
            Message::AuthOk => buf.put_u8(OP_AUTH_OK),
            Message::AuthFailed => buf.put_u8(OP_AUTH_FAILED),
            Message::PartnerJoined => buf.put_u8(OP_PARTNER_JOINED),
            Message::PartnerLeft => buf.put_u8(OP_PARTNER_LEFT),
            Message::OpenSession { targets } => {
                buf.put_u8(OP_OPEN_SESSION);
                for target in targets {
                    put_bytes(&mut buf, target.host.as_bytes());
                    buf.put_u16(target.port);
                }
            }
            Message::OpenConnection { id, host, port } => {
                buf.put_u8(OP_OPEN_CONNECTION);
                buf.put_u64(*id);
                put_bytes(&mut buf, host.as_bytes());
                buf.put_u16(*port);
            }
            Message::ConnectionOpened { id } => {
                buf.put_u8(OP_CONNECTION_OPENED);
                buf.put_u64(*id);
            }
            Message::CloseConnection { id, reason } => {
                buf.put_u8(OP_CLOSE_CONNECTION);
                buf.put_u64(*id);
                buf.put_u8(*reason as u8);
            }
            Message::Data { id, payload } => {
                buf.put_u8(OP_DATA);
                buf.put_u64(*id);
                buf.extend_from_slice(payload);
            }
            Message::WindowUpdate { id, credit } => {
                buf.put_u8(OP_WINDOW_UPDATE);
                buf.put_u64(*id);
                buf.put_u32(*credit);
            }
            Message::GoAway { code } => {
                buf.put_u8(OP_GO_AWAY);
                buf.put_u8(*code as u8);
            }
            Message::Unknown(op) => buf.put_u8(*op),
        }
        buf.freeze()
    }

    /// Decode a message from a frame payload
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(payload.len()));
        }
        let mut buf = Bytes::copy_from_slice(payload);
        if buf.is_empty() {
            return Err(ProtocolError::Malformed("empty message"));
        }
        let op = buf.get_u8();
        let msg = match op {
            OP_AUTHENTICATE => {
                let session_id = get_i32(&mut buf)?;
                let role = Role::try_from(get_u8(&mut buf)?)?;
                let password = get_bytes(&mut buf)?.to_vec();
                Message::Authenticate {
                    session_id,
                    role,
                    password,
                }
            }
            OP_AUTH_OK => Message::AuthOk,
            OP_AUTH_FAILED => Message::AuthFailed,
            OP_PARTNER_JOINED => Message::PartnerJoined,
            OP_PARTNER_LEFT => Message::PartnerLeft,
            OP_OPEN_SESSION => {
                let mut targets = Vec::new();
                while buf.has_remaining() {
                    let host = get_string(&mut buf)?;
                    let port = get_u16(&mut buf)?;
                    targets.push(SessionTarget { host, port });
                }
                Message::OpenSession { targets }
            }
            OP_OPEN_CONNECTION => {
                let id = get_u64(&mut buf)?;
                let host = get_string(&mut buf)?;
                let port = get_u16(&mut buf)?;
                Message::OpenConnection { id, host, port }
            }
            OP_CONNECTION_OPENED => Message::ConnectionOpened {
                id: get_u64(&mut buf)?,
            },
            OP_CLOSE_CONNECTION => {
                let id = get_u64(&mut buf)?;
                let reason = CloseReason::from_byte(get_u8(&mut buf)?);
                Message::CloseConnection { id, reason }
            }
            OP_DATA => {
                let id = get_u64(&mut buf)?;
                Message::Data { id, payload: buf }
            }
            OP_WINDOW_UPDATE => {
                let id = get_u64(&mut buf)?;
                let credit = get_u32(&mut buf)?;
                Message::WindowUpdate { id, credit }
            }
            OP_GO_AWAY => Message::GoAway {
                code: CloseReason::from_byte(get_u8(&mut buf)?),
            },
            other => Message::Unknown(other),
        };
        Ok(msg)
    }
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.extend_from_slice(data);
}

fn get_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::Malformed("truncated message"));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::Malformed("truncated message"));
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Malformed("truncated message"));
    }
    Ok(buf.get_u32())
}

fn get_i32(buf: &mut Bytes) -> Result<i32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Malformed("truncated message"));
    }
    Ok(buf.get_i32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, ProtocolError> {
    if buf.remaining() < 8 {
        return Err(ProtocolError::Malformed("truncated message"));
    }
    Ok(buf.get_u64())
}

/// Read a u32-length-prefixed byte string, rejecting lengths that would
/// read past the frame boundary.
fn get_bytes(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = get_u32(buf)? as usize;
    if len > buf.remaining() {
        return Err(ProtocolError::Malformed("length prefix past frame end"));
    }
    Ok(buf.split_to(len))
}

fn get_string(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::Malformed("invalid utf-8"))
}
