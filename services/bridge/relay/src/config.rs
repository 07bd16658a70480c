//! Relay tuning knobs.

use bridge_socket::DEFAULT_READ_CHUNK_SIZE;
use std::time::Duration;

/// Default time an initiator waits for the peer to answer a stream.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on concurrent virtual sockets per browser relay.
pub const DEFAULT_MAX_VIRTUAL_SOCKETS: usize = 16;

/// Settings shared by both relay roles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// How long an initiator builder waits for the matching stream
    pub stream_timeout: Duration,
    /// Maximum concurrent virtual sockets, in flight or live (browser role)
    pub max_virtual_sockets: usize,
    /// Bytes read from a peer stream at a time
    pub read_chunk_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            max_virtual_sockets: DEFAULT_MAX_VIRTUAL_SOCKETS,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}
