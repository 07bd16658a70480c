//! Outbound local TCP connections to a fixed service port.

use crate::connection::{ConnectionId, ConnectionObserver, TcpConnection};
use crate::error::BridgeError;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

struct ClientInner {
    active: DashMap<ConnectionId, TcpConnection>,
    disconnecting: AtomicBool,
    observer: Weak<dyn ConnectionObserver>,
}

impl ConnectionObserver for ClientInner {
    fn did_read(&self, connection: &TcpConnection, data: Bytes) {
        if let Some(observer) = self.observer.upgrade() {
            observer.did_read(connection, data);
        }
    }

    fn did_disconnect(&self, connection: &TcpConnection) {
        self.active.remove(&connection.id());
        if self.disconnecting.load(Ordering::SeqCst) {
            return;
        }
        if let Some(observer) = self.observer.upgrade() {
            observer.did_disconnect(connection);
        }
    }
}

/// Dials loopback connections and tracks them until they go away.
///
/// Reads and disconnects of every connection are forwarded to the observer
/// given at construction. Once [`disconnect_all`](Self::disconnect_all) has
/// been called, disconnects are expected and no longer forwarded.
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

impl TcpClient {
    /// Create a client forwarding connection events to `observer`.
    pub fn new(observer: Weak<dyn ConnectionObserver>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                active: DashMap::new(),
                disconnecting: AtomicBool::new(false),
                observer,
            }),
        }
    }

    /// Connect to `127.0.0.1:port`.
    ///
    /// The returned connection does not read until `start_reading` is called.
    pub async fn connect(&self, port: u16) -> Result<TcpConnection, BridgeError> {
        if self.inner.disconnecting.load(Ordering::SeqCst) {
            return Err(BridgeError::SessionDisconnected);
        }
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            warn!("Failed to connect to {}: {}", addr, e);
            BridgeError::ConnectionFailed
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
        }

        let inner: Arc<dyn ConnectionObserver> = self.inner.clone();
        let connection = TcpConnection::spawn(stream, Arc::downgrade(&inner));
        self.inner.active.insert(connection.id(), connection.clone());

        // disconnect_all may have drained the set while we were connecting.
        if self.inner.disconnecting.load(Ordering::SeqCst) {
            connection.disconnect();
            return Err(BridgeError::SessionDisconnected);
        }
        debug!("Connected {} to {}", connection.id(), addr);
        Ok(connection)
    }

    /// Disconnect every tracked connection. Idempotent.
    pub fn disconnect_all(&self) {
        if self.inner.disconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut connections = Vec::new();
        self.inner.active.retain(|_, connection| {
            connections.push(connection.clone());
            false
        });
        info!("Disconnecting {} client connections", connections.len());
        for connection in connections {
            connection.disconnect();
        }
    }

    /// Number of connections currently tracked.
    pub fn active_connections(&self) -> usize {
        self.inner.active.len()
    }

    /// True once `disconnect_all` has been called.
    pub fn is_disconnecting(&self) -> bool {
        self.inner.disconnecting.load(Ordering::SeqCst)
    }
}
