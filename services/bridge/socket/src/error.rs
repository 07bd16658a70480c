//! Bridge error types.

use bridge_session::SessionError;
use thiserror::Error;

/// Errors surfaced by builders, local sockets and relays
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// A stream or local socket could not be opened
    #[error("connection failed")]
    ConnectionFailed,

    /// The matching stream was not received in time
    #[error("connection timed out")]
    ConnectionTimedOut,

    /// Too many concurrent virtual sockets on one relay
    #[error("max connections reached")]
    MaxConnectionsReached,

    /// The peer session was torn down mid-operation
    #[error("session disconnected")]
    SessionDisconnected,
}

impl BridgeError {
    /// Stable numeric code reported to callers outside the process.
    pub fn code(&self) -> i32 {
        match self {
            BridgeError::ConnectionFailed => 1,
            BridgeError::ConnectionTimedOut => 2,
            BridgeError::MaxConnectionsReached => 3,
            BridgeError::SessionDisconnected => 9,
        }
    }
}

impl From<SessionError> for BridgeError {
    fn from(_: SessionError) -> Self {
        BridgeError::ConnectionFailed
    }
}
