//! Initiating side: exposes a local port and opens a stream per accepted connection.

use crate::config::RelayConfig;
use crate::events::{self, SessionHandler};
use crate::gate::{LifecycleGate, RelayState};
use crate::pairing::PairingTable;
use bridge_session::{InputStream, PeerId, PeerSession, SessionState};
use bridge_socket::{
    metrics, BridgeError, ConnectionObserver, InitiatorSocketBuilder, ListenerObserver,
    TcpConnection, TcpListener, VirtualSocket, VirtualSocketObserver,
};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Bridges every local connection on its listener port to a new stream pair.
///
/// Moves through connecting, connected and disconnecting, never backwards.
/// The relay closes itself when the session is lost; dropping the handle
/// closes it as well.
pub struct BrowserRelay {
    inner: Arc<BrowserInner>,
}

struct BrowserInner {
    this: Weak<BrowserInner>,
    session: Arc<dyn PeerSession>,
    generation: u64,
    config: RelayConfig,
    listener: TcpListener,
    builders: DashMap<String, Arc<InitiatorSocketBuilder>>,
    pairings: PairingTable,
    capacity: Arc<Semaphore>,
    gate: LifecycleGate,
}

impl BrowserRelay {
    /// Create a relay for `session` waiting `stream_timeout` for each answer.
    pub fn new(session: Arc<dyn PeerSession>, generation: u64, stream_timeout: Duration) -> Self {
        let config = RelayConfig {
            stream_timeout,
            ..RelayConfig::default()
        };
        Self::with_config(session, generation, config)
    }

    /// Create a relay for `session`. Must be called within a tokio runtime.
    pub fn with_config(session: Arc<dyn PeerSession>, generation: u64, config: RelayConfig) -> Self {
        let inner = Arc::new_cyclic(|this: &Weak<BrowserInner>| {
            let observer: Weak<dyn ListenerObserver> = this.clone();
            BrowserInner {
                this: this.clone(),
                session,
                generation,
                capacity: Arc::new(Semaphore::new(config.max_virtual_sockets)),
                config,
                listener: TcpListener::new(observer),
                builders: DashMap::new(),
                pairings: PairingTable::default(),
                gate: LifecycleGate::new(RelayState::Connecting),
            }
        });
        info!(
            "Browser relay for {} created (generation {})",
            inner.session.peer(),
            generation
        );

        events::attach(&*inner.session, Arc::downgrade(&inner));
        if inner.session.state() == SessionState::NotConnected {
            inner.close_relay();
        }
        Self { inner }
    }

    /// Start the local listener and return its port.
    pub fn open_relay(&self) -> Result<u16, BridgeError> {
        let inner = &self.inner;
        if inner.gate.is_disconnecting() {
            return Err(BridgeError::SessionDisconnected);
        }
        let port = inner.listener.start_listening(0)?;
        inner.gate.advance(RelayState::Connecting, RelayState::Connected);

        // close_relay may have run while we were binding.
        if inner.gate.is_disconnecting() {
            inner.listener.stop_listening();
            return Err(BridgeError::SessionDisconnected);
        }
        info!("Browser relay for {} listening on port {}", inner.session.peer(), port);
        Ok(port)
    }

    /// Stop the listener, tear down every pairing and disconnect the session. Idempotent.
    pub fn close_relay(&self) {
        self.inner.close_relay();
    }

    /// Disconnect the session. The relay follows once the session reports it.
    pub fn disconnect_session(&self) {
        self.inner.session.disconnect();
    }

    /// Generation of the peer this relay was created for.
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Local port while the relay is listening.
    pub fn listener_port(&self) -> Option<u16> {
        self.inner.listener.listener_port()
    }

    /// Number of live virtual socket / TCP connection pairs.
    pub fn virtual_sockets_count(&self) -> usize {
        self.inner.pairings.len()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RelayState {
        self.inner.gate.state()
    }

    /// The remote peer.
    pub fn peer(&self) -> &PeerId {
        self.inner.session.peer()
    }
}

impl Drop for BrowserRelay {
    fn drop(&mut self) {
        self.inner.close_relay();
    }
}

impl BrowserInner {
    fn close_relay(&self) {
        if !self.gate.begin_disconnect() {
            return;
        }
        info!(
            "Closing browser relay for {} (generation {})",
            self.session.peer(),
            self.generation
        );
        self.listener.stop_listening();
        for pairing in self.pairings.drain() {
            pairing.teardown();
        }
        let mut builders = Vec::new();
        self.builders.retain(|_, builder| {
            builders.push(builder.clone());
            false
        });
        for builder in builders {
            builder.cancel();
        }
        self.session.disconnect();
    }

    async fn create_virtual_socket(
        &self,
    ) -> Result<(Arc<VirtualSocket>, OwnedSemaphorePermit), BridgeError> {
        let permit = self.capacity.clone().try_acquire_owned().map_err(|_| {
            metrics().capacity_rejected();
            warn!(
                "Relay for {} is at its limit of {} virtual sockets",
                self.session.peer(),
                self.config.max_virtual_sockets
            );
            BridgeError::MaxConnectionsReached
        })?;

        let builder = Arc::new(
            InitiatorSocketBuilder::new(self.config.stream_timeout)
                .with_read_chunk_size(self.config.read_chunk_size),
        );
        self.builders
            .insert(builder.name().to_string(), builder.clone());
        if self.gate.is_disconnecting() {
            builder.cancel();
        }

        let result = builder.build(&*self.session).await;
        self.builders.remove(builder.name());
        result.map(|socket| (socket, permit))
    }

    async fn bridge_connection(self: Arc<Self>, connection: TcpConnection) {
        let (socket, permit) = match self.create_virtual_socket().await {
            Ok(created) => created,
            Err(e) => {
                warn!("Failed to bridge {}: {}", connection.id(), e);
                connection.disconnect();
                return;
            }
        };

        let observer: Weak<dyn VirtualSocketObserver> = self.this.clone();
        socket.set_observer(observer);
        if !self
            .pairings
            .insert(connection.clone(), socket.clone(), Some(permit))
        {
            debug!("{} went away before stream {} was paired", connection.id(), socket.name());
            return;
        }
        if self.gate.is_disconnecting() {
            self.pairings.unpair_connection(connection.id());
            return;
        }
        debug!("Paired {} with stream {}", connection.id(), socket.name());
        socket.open();
    }
}

impl SessionHandler for BrowserInner {
    fn on_input_stream(self: &Arc<Self>, name: String, stream: InputStream) {
        let builder = self.builders.get(&name).map(|entry| entry.value().clone());
        match builder {
            Some(builder) => {
                if builder.complete(stream).is_err() {
                    debug!("Stream {} arrived after its builder finished, discarding", name);
                }
            }
            None => debug!("No builder waiting for stream {}, discarding", name),
        }
    }

    fn on_session_lost(self: &Arc<Self>) {
        self.close_relay();
    }
}

impl VirtualSocketObserver for BrowserInner {
    fn did_open(&self, socket: &VirtualSocket) {
        if let Some(connection) = self.pairings.connection_for(socket.id()) {
            connection.start_reading();
        }
    }

    fn did_read(&self, socket: &VirtualSocket, data: Bytes) {
        if let Some(connection) = self.pairings.connection_for(socket.id()) {
            connection.write(data);
        }
    }

    fn did_close(&self, socket: &VirtualSocket) {
        if self.pairings.unpair_socket(socket.id()) {
            debug!("Stream {} closed, unpaired", socket.name());
        }
    }
}

impl ConnectionObserver for BrowserInner {
    fn did_read(&self, connection: &TcpConnection, data: Bytes) {
        if let Some(socket) = self.pairings.socket_for(connection.id()) {
            socket.write(data);
        }
    }

    fn did_disconnect(&self, connection: &TcpConnection) {
        let unpaired = if self.gate.is_disconnecting() {
            self.pairings.unpair_connection(connection.id())
        } else {
            self.pairings.release_connection(connection.id())
        };
        if unpaired {
            debug!("{} disconnected, unpaired", connection.id());
        }
    }
}

impl ListenerObserver for BrowserInner {
    fn did_accept(&self, connection: &TcpConnection) {
        match self.this.upgrade() {
            Some(inner) if !self.gate.is_disconnecting() => {
                tokio::spawn(inner.bridge_connection(connection.clone()));
            }
            _ => connection.disconnect(),
        }
    }

    fn did_stop_listening(&self) {
        if self.gate.is_disconnecting() {
            return;
        }
        warn!(
            "Listener for {} stopped unexpectedly, disconnecting session",
            self.session.peer()
        );
        self.session.disconnect();
    }
}
