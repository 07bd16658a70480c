//! One-shot construction of matched virtual sockets.
//!
//! The initiator opens an output stream under a fresh name and waits for the
//! peer to open the matching stream back. The acceptor already holds the
//! peer's stream and answers it under the same name right away.

use crate::error::BridgeError;
use crate::metrics::metrics;
use crate::virtual_socket::{VirtualSocket, DEFAULT_READ_CHUNK_SIZE};
use bridge_session::{InputStream, PeerSession};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds a virtual socket from the initiating side of a session.
///
/// The result is delivered exactly once: by the stream handed to
/// [`complete`](Self::complete), by the timeout, or by [`cancel`](Self::cancel).
/// Streams arriving after that are handed back to the caller for disposal.
pub struct InitiatorSocketBuilder {
    name: String,
    timeout: Duration,
    read_chunk_size: usize,
    stream_tx: Mutex<Option<oneshot::Sender<InputStream>>>,
    stream_rx: Mutex<Option<oneshot::Receiver<InputStream>>>,
}

impl InitiatorSocketBuilder {
    /// Create a builder waiting at most `timeout` for the peer's stream.
    pub fn new(timeout: Duration) -> Self {
        let (stream_tx, stream_rx) = oneshot::channel();
        Self {
            name: Uuid::new_v4().to_string(),
            timeout,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            stream_tx: Mutex::new(Some(stream_tx)),
            stream_rx: Mutex::new(Some(stream_rx)),
        }
    }

    /// Set the read chunk size of the socket being built.
    pub fn with_read_chunk_size(mut self, read_chunk_size: usize) -> Self {
        self.read_chunk_size = read_chunk_size;
        self
    }

    /// Stream name used for both directions.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open the output stream and wait for the matching input stream.
    pub async fn build(&self, session: &dyn PeerSession) -> Result<Arc<VirtualSocket>, BridgeError> {
        let Some(stream_rx) = lock(&self.stream_rx).take() else {
            warn!("Builder for stream {} was already used", self.name);
            return Err(BridgeError::ConnectionFailed);
        };
        metrics().builder_started();

        let output = match session.open_output_stream(&self.name) {
            Ok(output) => output,
            Err(e) => {
                warn!(
                    "Failed to open stream {} to {}: {}",
                    self.name,
                    session.peer(),
                    e
                );
                metrics().builder_failed();
                return Err(e.into());
            }
        };
        debug!("Opened stream {}, waiting for {} to answer", self.name, session.peer());

        match tokio::time::timeout(self.timeout, stream_rx).await {
            Ok(Ok(input)) => {
                metrics().builder_succeeded();
                Ok(VirtualSocket::new(
                    self.name.clone(),
                    input,
                    output,
                    self.read_chunk_size,
                ))
            }
            Ok(Err(_)) => {
                debug!("Builder for stream {} cancelled", self.name);
                metrics().builder_failed();
                Err(BridgeError::SessionDisconnected)
            }
            Err(_) => {
                self.cancel();
                warn!(
                    "Stream {} not answered by {} within {:?}",
                    self.name,
                    session.peer(),
                    self.timeout
                );
                metrics().builder_timed_out();
                Err(BridgeError::ConnectionTimedOut)
            }
        }
    }

    /// Hand over the peer's stream. Gives it back if the builder already finished.
    pub fn complete(&self, input: InputStream) -> Result<(), InputStream> {
        match lock(&self.stream_tx).take() {
            Some(stream_tx) => stream_tx.send(input),
            None => Err(input),
        }
    }

    /// Fail a pending or future `build` with [`BridgeError::SessionDisconnected`].
    pub fn cancel(&self) {
        lock(&self.stream_tx).take();
    }
}

/// Builds a virtual socket for a stream the peer has already opened.
pub struct AcceptorSocketBuilder {
    session: Arc<dyn PeerSession>,
    read_chunk_size: usize,
}

impl AcceptorSocketBuilder {
    /// Create a builder answering streams on `session`.
    pub fn new(session: Arc<dyn PeerSession>) -> Self {
        Self {
            session,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }

    /// Set the read chunk size of the sockets being built.
    pub fn with_read_chunk_size(mut self, read_chunk_size: usize) -> Self {
        self.read_chunk_size = read_chunk_size;
        self
    }

    /// Answer `input` with an output stream of the same name.
    ///
    /// On failure `input` is dropped.
    pub fn build(&self, input: InputStream, name: &str) -> Result<Arc<VirtualSocket>, BridgeError> {
        metrics().builder_started();
        match self.session.open_output_stream(name) {
            Ok(output) => {
                metrics().builder_succeeded();
                Ok(VirtualSocket::new(name, input, output, self.read_chunk_size))
            }
            Err(e) => {
                warn!(
                    "Failed to answer stream {} from {}: {}",
                    name,
                    self.session.peer(),
                    e
                );
                metrics().builder_failed();
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_session::{MemorySession, SessionEvent};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// Answer every stream `responder` receives, keeping the sockets alive.
    fn spawn_responder(responder: Arc<MemorySession>) -> tokio::task::JoinHandle<Vec<Arc<VirtualSocket>>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        responder.attach(tx);
        let acceptor = AcceptorSocketBuilder::new(responder);
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Some(event) = rx.recv().await {
                match event {
                    SessionEvent::InputStream { name, stream } => {
                        if let Ok(socket) = acceptor.build(stream, &name) {
                            sockets.push(socket);
                        }
                    }
                    SessionEvent::StateChanged(_) => break,
                }
            }
            sockets
        })
    }

    /// Route streams arriving on `initiator` to `builder`.
    fn spawn_router(initiator: &MemorySession, builder: Arc<InitiatorSocketBuilder>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        initiator.attach(tx);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let SessionEvent::InputStream { name, stream } = event {
                    assert_eq!(name, builder.name());
                    let _ = builder.complete(stream);
                }
            }
        });
    }

    #[tokio::test]
    async fn test_initiator_receives_answer() {
        let (initiator, responder) = MemorySession::pair("browser", "advertiser");
        let _responder = spawn_responder(responder.clone());
        let builder = Arc::new(InitiatorSocketBuilder::new(Duration::from_secs(5)));
        spawn_router(&initiator, builder.clone());

        let socket = builder.build(&*initiator).await.unwrap();
        assert_eq!(socket.name(), builder.name());
        assert!(!socket.is_closed());
    }

    #[tokio::test]
    async fn test_initiator_names_are_unique() {
        let a = InitiatorSocketBuilder::new(Duration::from_secs(1));
        let b = InitiatorSocketBuilder::new(Duration::from_secs(1));
        assert_ne!(a.name(), b.name());
    }

    #[tokio::test]
    async fn test_initiator_open_failure() {
        let (initiator, _responder) = MemorySession::pair("browser", "advertiser");
        initiator.set_refuse_streams(true);
        let builder = InitiatorSocketBuilder::new(Duration::from_secs(5));
        assert_eq!(
            builder.build(&*initiator).await.err(),
            Some(BridgeError::ConnectionFailed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiator_times_out_once() {
        let (initiator, responder) = MemorySession::pair("browser", "advertiser");
        responder.set_drop_inbound(true);
        let builder = InitiatorSocketBuilder::new(Duration::from_secs(5));

        let start = Instant::now();
        let result = builder.build(&*initiator).await;
        let elapsed = start.elapsed();

        assert_eq!(result.err(), Some(BridgeError::ConnectionTimedOut));
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(5) + Duration::from_millis(50));

        // A late stream cannot be delivered and comes back to the caller.
        let (late, _peer) = tokio::io::duplex(16);
        assert!(builder.complete(Box::new(late)).is_err());
        // The builder is spent.
        assert_eq!(
            builder.build(&*initiator).await.err(),
            Some(BridgeError::ConnectionFailed)
        );
    }

    #[tokio::test]
    async fn test_cancel_fails_pending_build() {
        let (initiator, responder) = MemorySession::pair("browser", "advertiser");
        responder.set_drop_inbound(true);
        let builder = Arc::new(InitiatorSocketBuilder::new(Duration::from_secs(60)));

        let pending = {
            let builder = builder.clone();
            let initiator = initiator.clone();
            tokio::spawn(async move { builder.build(&*initiator).await })
        };
        tokio::task::yield_now().await;
        builder.cancel();

        let result = pending.await.unwrap();
        assert_eq!(result.err(), Some(BridgeError::SessionDisconnected));
    }

    #[tokio::test]
    async fn test_acceptor_fails_on_disconnected_session() {
        let (initiator, responder) = MemorySession::pair("browser", "advertiser");
        let _output = initiator.open_output_stream("s1").unwrap();
        responder.disconnect();

        let acceptor = AcceptorSocketBuilder::new(responder);
        let (input, _peer) = tokio::io::duplex(16);
        assert_eq!(
            acceptor.build(Box::new(input), "s1").err(),
            Some(BridgeError::ConnectionFailed)
        );
    }
}
