//! Accepting side: answers the peer's streams and dials a fixed local port.

use crate::config::RelayConfig;
use crate::events::{self, SessionHandler};
use crate::gate::{LifecycleGate, RelayState};
use crate::pairing::PairingTable;
use bridge_session::{InputStream, PeerId, PeerSession, SessionState};
use bridge_socket::{
    AcceptorSocketBuilder, ConnectionObserver, TcpClient, TcpConnection, VirtualSocket,
    VirtualSocketObserver,
};
use bytes::Bytes;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Bridges every stream a peer opens to a new connection to `client_port`.
///
/// Created once the session is connected. The relay closes itself when the
/// session is lost; dropping the handle closes it as well.
pub struct AdvertiserRelay {
    inner: Arc<AdvertiserInner>,
}

struct AdvertiserInner {
    this: Weak<AdvertiserInner>,
    session: Arc<dyn PeerSession>,
    client_port: u16,
    client: TcpClient,
    acceptor: AcceptorSocketBuilder,
    pairings: PairingTable,
    gate: LifecycleGate,
}

impl AdvertiserRelay {
    /// Bridge `session` to `127.0.0.1:client_port` with default settings.
    pub fn new(session: Arc<dyn PeerSession>, client_port: u16) -> Self {
        Self::with_config(session, client_port, RelayConfig::default())
    }

    /// Bridge `session` to `127.0.0.1:client_port`. Must be called within a tokio runtime.
    pub fn with_config(session: Arc<dyn PeerSession>, client_port: u16, config: RelayConfig) -> Self {
        let inner = Arc::new_cyclic(|this: &Weak<AdvertiserInner>| {
            let observer: Weak<dyn ConnectionObserver> = this.clone();
            AdvertiserInner {
                this: this.clone(),
                acceptor: AcceptorSocketBuilder::new(session.clone())
                    .with_read_chunk_size(config.read_chunk_size),
                session,
                client_port,
                client: TcpClient::new(observer),
                pairings: PairingTable::default(),
                gate: LifecycleGate::new(RelayState::Connected),
            }
        });
        info!(
            "Advertiser relay for {} bridging to port {}",
            inner.session.peer(),
            client_port
        );

        events::attach(&*inner.session, Arc::downgrade(&inner));
        if inner.session.state() == SessionState::NotConnected {
            inner.close_relay();
        }
        Self { inner }
    }

    /// Tear down every pairing and disconnect the session. Idempotent.
    pub fn close_relay(&self) {
        self.inner.close_relay();
    }

    /// Local port every bridged stream is dialled to.
    pub fn client_port(&self) -> u16 {
        self.inner.client_port
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

impl Drop for AdvertiserRelay {
    fn drop(&mut self) {
        self.inner.close_relay();
    }
}

impl AdvertiserInner {
    fn close_relay(&self) {
        if !self.gate.begin_disconnect() {
            return;
        }
        info!("Closing advertiser relay for {}", self.session.peer());
        self.client.disconnect_all();
        for pairing in self.pairings.drain() {
            pairing.teardown();
        }
        self.session.disconnect();
    }

    async fn bridge_stream(self: Arc<Self>, socket: Arc<VirtualSocket>) {
        let connection = match self.client.connect(self.client_port).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(
                    "Failed to bridge stream {} to port {}: {}",
                    socket.name(),
                    self.client_port,
                    e
                );
                socket.close();
                return;
            }
        };

        if !self.pairings.insert(connection.clone(), socket.clone(), None) {
            debug!("Stream {} died before it was paired", socket.name());
            return;
        }
        if self.gate.is_disconnecting() {
            self.pairings.unpair_connection(connection.id());
            return;
        }
        debug!("Paired stream {} with {}", socket.name(), connection.id());
        socket.open();
        connection.start_reading();
    }
}

impl SessionHandler for AdvertiserInner {
    fn on_input_stream(self: &Arc<Self>, name: String, stream: InputStream) {
        if self.gate.is_disconnecting() {
            debug!("Relay closing, discarding stream {}", name);
            return;
        }
        let socket = match self.acceptor.build(stream, &name) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Discarding stream {} from {}: {}", name, self.session.peer(), e);
                return;
            }
        };
        let observer: Weak<dyn VirtualSocketObserver> = self.this.clone();
        socket.set_observer(observer);
        tokio::spawn(self.clone().bridge_stream(socket));
    }

    fn on_session_lost(self: &Arc<Self>) {
        self.close_relay();
    }
}

impl VirtualSocketObserver for AdvertiserInner {
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

impl ConnectionObserver for AdvertiserInner {
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
