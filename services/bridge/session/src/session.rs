//! The contract the relays consume from a peer session.

use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Read half of a named stream delivered by the peer.
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a named stream opened towards the peer.
pub type OutputStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Opaque identity of the remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(name: &str) -> Self {
        PeerId(name.to_string())
    }
}

/// Lifecycle state of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Negotiation is still in progress.
    Connecting,
    /// Streams can be opened and received.
    Connected,
    /// The session is gone; no stream will be opened or delivered again.
    NotConnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::NotConnected => "notConnected",
        };
        f.write_str(name)
    }
}

/// Notifications raised by a session towards its observer.
pub enum SessionEvent {
    /// The session moved to a new state.
    StateChanged(SessionState),
    /// The peer opened a named stream towards us.
    InputStream {
        /// Name the peer chose when opening the stream
        name: String,
        /// Readable half of the stream
        stream: InputStream,
    },
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::StateChanged(state) => {
                f.debug_tuple("StateChanged").field(state).finish()
            }
            SessionEvent::InputStream { name, .. } => f
                .debug_struct("InputStream")
                .field("name", name)
                .finish_non_exhaustive(),
        }
    }
}

/// Errors raised by session operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session is not connected
    #[error("session is not connected")]
    NotConnected,

    /// The peer refused to accept the named stream
    #[error("stream {0} rejected by peer")]
    StreamRejected(String),
}

/// A negotiated connection to one remote peer able to exchange named streams.
///
/// Implementations must tolerate every method being called from any task,
/// including after the session has been disconnected.
pub trait PeerSession: Send + Sync {
    /// Identity of the remote peer.
    fn peer(&self) -> &PeerId;

    /// Current session state.
    fn state(&self) -> SessionState;

    /// Open a unidirectional stream towards the peer under `name`.
    fn open_output_stream(&self, name: &str) -> Result<OutputStream, SessionError>;

    /// Route all subsequent events to `events`.
    ///
    /// Events raised before the first attach are buffered and flushed here.
    fn attach(&self, events: mpsc::UnboundedSender<SessionEvent>);

    /// Tear the session down. Idempotent.
    fn disconnect(&self);
}
