//! The relay's one-to-one mapping between local connections and virtual sockets.

use bridge_socket::{ConnectionId, TcpConnection, VirtualSocket};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

pub(crate) struct Pairing {
    pub(crate) connection: TcpConnection,
    pub(crate) socket: Arc<VirtualSocket>,
    /// Capacity slot, released when the pairing is dropped
    _permit: Option<OwnedSemaphorePermit>,
}

impl Pairing {
    /// Close both halves.
    pub(crate) fn teardown(self) {
        self.connection.disconnect();
        self.socket.close();
    }

    /// Close both halves, letting the socket deliver what the connection
    /// already read.
    pub(crate) fn release(self) {
        self.connection.disconnect();
        self.socket.close_gracefully();
    }
}

/// Both directions of the mapping, always updated together.
///
/// Whoever removes an entry first owns its teardown; every later removal of
/// the same pair finds nothing.
#[derive(Default)]
pub(crate) struct PairingTable {
    by_connection: DashMap<ConnectionId, Pairing>,
    by_socket: DashMap<u64, ConnectionId>,
}

impl PairingTable {
    /// Register a pair. Returns false, after tearing it down, when either half
    /// died before the pair became visible.
    pub(crate) fn insert(
        &self,
        connection: TcpConnection,
        socket: Arc<VirtualSocket>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> bool {
        let id = connection.id();
        self.by_socket.insert(socket.id(), id);
        self.by_connection.insert(
            id,
            Pairing {
                connection: connection.clone(),
                socket: socket.clone(),
                _permit: permit,
            },
        );
        if socket.is_closed() || !connection.is_connected() {
            self.unpair_connection(id);
            return false;
        }
        true
    }

    pub(crate) fn socket_for(&self, id: ConnectionId) -> Option<Arc<VirtualSocket>> {
        self.by_connection
            .get(&id)
            .map(|pairing| pairing.socket.clone())
    }

    pub(crate) fn connection_for(&self, socket_id: u64) -> Option<TcpConnection> {
        let id = *self.by_socket.get(&socket_id)?;
        self.by_connection
            .get(&id)
            .map(|pairing| pairing.connection.clone())
    }

    fn remove(&self, id: ConnectionId) -> Option<Pairing> {
        let (_, pairing) = self.by_connection.remove(&id)?;
        self.by_socket.remove(&pairing.socket.id());
        Some(pairing)
    }

    /// Remove and tear down the pair holding `id`.
    pub(crate) fn unpair_connection(&self, id: ConnectionId) -> bool {
        match self.remove(id) {
            Some(pairing) => {
                pairing.teardown();
                true
            }
            None => false,
        }
    }

    /// Remove the pair holding `id` after its connection ended, flushing the
    /// socket's queued writes to the peer.
    pub(crate) fn release_connection(&self, id: ConnectionId) -> bool {
        match self.remove(id) {
            Some(pairing) => {
                pairing.release();
                true
            }
            None => false,
        }
    }

    /// Remove and tear down the pair holding socket `socket_id`.
    pub(crate) fn unpair_socket(&self, socket_id: u64) -> bool {
        match self.by_socket.remove(&socket_id) {
            Some((_, id)) => self.unpair_connection(id),
            None => false,
        }
    }

    /// Empty the table, handing every pair to the caller.
    pub(crate) fn drain(&self) -> Vec<Pairing> {
        let mut pairings = Vec::new();
        let ids: Vec<ConnectionId> = self.by_connection.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some(pairing) = self.remove(id) {
                pairings.push(pairing);
            }
        }
        pairings
    }

    pub(crate) fn len(&self) -> usize {
        self.by_connection.len()
    }
}
