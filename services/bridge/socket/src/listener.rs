//! Inbound local TCP connections on one ephemeral loopback port.

use crate::connection::{ConnectionId, ConnectionObserver, TcpConnection};
use crate::error::BridgeError;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Callbacks raised by a [`TcpListener`] and the connections it accepted.
pub trait ListenerObserver: ConnectionObserver {
    /// A local application connected. The connection is not reading yet.
    fn did_accept(&self, connection: &TcpConnection);

    /// The listening socket closed, whether asked to or not.
    fn did_stop_listening(&self);
}

#[derive(Default)]
struct ListenerState {
    listening: bool,
    port: u16,
    run: u64,
    stop_tx: Option<oneshot::Sender<()>>,
}

struct ListenerInner {
    state: Mutex<ListenerState>,
    accepted: DashMap<ConnectionId, TcpConnection>,
    observer: Weak<dyn ListenerObserver>,
}

impl ConnectionObserver for ListenerInner {
    fn did_read(&self, connection: &TcpConnection, data: Bytes) {
        if let Some(observer) = self.observer.upgrade() {
            observer.did_read(connection, data);
        }
    }

    fn did_disconnect(&self, connection: &TcpConnection) {
        self.accepted.remove(&connection.id());
        if let Some(observer) = self.observer.upgrade() {
            observer.did_disconnect(connection);
        }
    }
}

/// Accepts loopback connections on a single port.
pub struct TcpListener {
    inner: Arc<ListenerInner>,
}

impl TcpListener {
    /// Create an idle listener reporting to `observer`.
    pub fn new(observer: Weak<dyn ListenerObserver>) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                state: Mutex::new(ListenerState::default()),
                accepted: DashMap::new(),
                observer,
            }),
        }
    }

    /// Bind `127.0.0.1:port` (0 picks a free port) and start accepting.
    ///
    /// Returns the bound port. While already listening this is a no-op
    /// returning the current port. Must be called within a tokio runtime.
    pub fn start_listening(&self, port: u16) -> Result<u16, BridgeError> {
        let mut state = lock(&self.inner.state);
        if state.listening {
            return Ok(state.port);
        }

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = bind(addr).map_err(|e| {
            warn!("Failed to listen on {}: {}", addr, e);
            BridgeError::ConnectionFailed
        })?;
        let bound_port = listener
            .local_addr()
            .map_err(|_| BridgeError::ConnectionFailed)?
            .port();

        let (stop_tx, stop_rx) = oneshot::channel();
        state.listening = true;
        state.port = bound_port;
        state.run += 1;
        state.stop_tx = Some(stop_tx);
        let run = state.run;
        drop(state);

        info!("Listening for local connections on 127.0.0.1:{}", bound_port);
        tokio::spawn(accept_loop(self.inner.clone(), listener, stop_rx, run));
        Ok(bound_port)
    }

    /// Close the listening socket and disconnect every accepted connection.
    ///
    /// Each connection reports its own disconnect; the listener reports
    /// `did_stop_listening` once the accept loop has exited. Idempotent.
    pub fn stop_listening(&self) {
        let stop_tx = {
            let mut state = lock(&self.inner.state);
            if !state.listening {
                return;
            }
            state.listening = false;
            state.stop_tx.take()
        };
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(());
        }

        let mut connections = Vec::new();
        self.inner.accepted.retain(|_, connection| {
            connections.push(connection.clone());
            false
        });
        debug!("Disconnecting {} accepted connections", connections.len());
        for connection in connections {
            connection.disconnect();
        }
    }

    /// Bound port while listening.
    pub fn listener_port(&self) -> Option<u16> {
        let state = lock(&self.inner.state);
        state.listening.then_some(state.port)
    }

    /// True between a successful `start_listening` and the listener stopping.
    pub fn is_listening(&self) -> bool {
        lock(&self.inner.state).listening
    }

    /// Number of accepted connections still up.
    pub fn accepted_connections(&self) -> usize {
        self.inner.accepted.len()
    }
}

fn bind(addr: SocketAddr) -> std::io::Result<tokio::net::TcpListener> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    tokio::net::TcpListener::from_std(listener)
}

async fn accept_loop(
    inner: Arc<ListenerInner>,
    listener: tokio::net::TcpListener,
    mut stop_rx: oneshot::Receiver<()>,
    run: u64,
) {
    let port = listener.local_addr().map(|addr| addr.port()).unwrap_or(0);
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                    }
                    let observer: Arc<dyn ConnectionObserver> = inner.clone();
                    let connection = TcpConnection::spawn(stream, Arc::downgrade(&observer));
                    inner.accepted.insert(connection.id(), connection.clone());

                    // stop_listening may have drained the set before the insert.
                    if !matches!(stop_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
                        connection.disconnect();
                        break;
                    }
                    debug!("Accepted {} from {}", connection.id(), addr);
                    if let Some(observer) = inner.observer.upgrade() {
                        observer.did_accept(&connection);
                    }
                }
                Err(e) => {
                    warn!("Accept on port {} failed: {}", port, e);
                    break;
                }
            },
        }
    }
    drop(listener);

    {
        let mut state = lock(&inner.state);
        if state.run == run {
            state.listening = false;
            state.stop_tx = None;
        }
    }
    info!("Stopped listening on port {}", port);
    if let Some(observer) = inner.observer.upgrade() {
        observer.did_stop_listening();
    }
}
