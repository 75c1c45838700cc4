use std::io;

use crate::message::ClientId;

/// Error code used when a peer refuses or drops a connection attempt.
pub const CONNECTION_REFUSED: i32 = -1;
/// Error code used when a handshake or an idle connection times out.
pub const CONNECTION_TIMED_OUT: i32 = -2;
/// Error code used when the server has no free client id left.
pub const SERVER_FULL: i32 = -3;
/// Error code for I/O failures that carry no OS error number.
pub const UNKNOWN_TRANSPORT_ERROR: i32 = -4;
/// Error code used when a peer stops draining its outbound queue.
pub const SEND_QUEUE_FULL: i32 = -5;

/// Errors reported asynchronously through `on_error`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NetworkError {
    #[error("transport error {code}: {message}")]
    Transport { code: i32, message: String },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("heartbeat lost: {missed} consecutive pings missed (client {client_id:?})")]
    Heartbeat {
        client_id: Option<ClientId>,
        missed: u32,
    },
    #[error("remote error {code}: {message}")]
    Remote { code: i32, message: String },
}

impl NetworkError {
    pub fn transport(code: i32, message: impl Into<String>) -> Self {
        Self::Transport {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Transport { code, .. } | Self::Remote { code, .. } => *code,
            Self::Protocol(_) => 0,
            Self::Heartbeat { .. } => CONNECTION_TIMED_OUT,
        }
    }
}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::TimedOut => CONNECTION_TIMED_OUT,
            io::ErrorKind::ConnectionRefused => CONNECTION_REFUSED,
            _ => err.raw_os_error().unwrap_or(UNKNOWN_TRANSPORT_ERROR),
        };
        Self::Transport {
            code,
            message: err.to_string(),
        }
    }
}

/// A frame or payload that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("truncated payload: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    #[error("frame length mismatch: header declares {declared} payload bytes, got {actual}")]
    FrameLength { declared: usize, actual: usize },
    #[error("frame payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("malformed control frame of type {message_type}")]
    MalformedControl { message_type: u8 },
    #[error("unexpected control frame of type {message_type}")]
    UnexpectedControl { message_type: u8 },
    #[error("malformed heartbeat payload of {len} bytes")]
    MalformedHeartbeat { len: usize },
}

/// Misuse of the API, reported at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    #[error("message was already sent")]
    AlreadySent,
    #[error("client is not connected")]
    NotConnected,
    #[error("server is not running")]
    NotRunning,
    #[error("message type {0} is reserved")]
    ReservedType(u8),
    #[error("message of {size} bytes exceeds the {max} byte limit of this transport")]
    PayloadTooLarge { size: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_transport_codes() {
        let refused: NetworkError = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(refused.code(), CONNECTION_REFUSED);

        let timed_out: NetworkError = io::Error::from(io::ErrorKind::TimedOut).into();
        assert_eq!(timed_out.code(), CONNECTION_TIMED_OUT);

        let other: NetworkError = io::Error::other("boom").into();
        assert!(matches!(other, NetworkError::Transport { .. }));
    }
}
