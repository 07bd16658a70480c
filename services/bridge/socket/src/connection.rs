//! A local TCP connection with a gated read loop and a queued write loop.

use crate::metrics::metrics;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

/// Size of the buffer used by each read loop.
const READ_BUFFER_SIZE: usize = 16 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle of a local TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Callbacks raised by a [`TcpConnection`].
pub trait ConnectionObserver: Send + Sync {
    /// Bytes arrived from the local application.
    fn did_read(&self, connection: &TcpConnection, data: Bytes);

    /// The connection is gone. Fires exactly once per connection.
    fn did_disconnect(&self, connection: &TcpConnection);
}

enum WriteCommand {
    Data(Bytes),
    Close,
}

struct ConnectionInner {
    id: ConnectionId,
    peer_addr: SocketAddr,
    write_tx: mpsc::UnboundedSender<WriteCommand>,
    reading: AtomicBool,
    read_gate: Notify,
    shutdown: Notify,
    closed: AtomicBool,
    observer: Weak<dyn ConnectionObserver>,
}

/// Cheaply cloneable handle to a local TCP connection.
///
/// Reading is held back until [`start_reading`](Self::start_reading) so no
/// bytes are consumed before there is somewhere to send them. Writes queue
/// without blocking and are flushed in order, including after `disconnect`.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<ConnectionInner>,
}

impl TcpConnection {
    /// Take over `stream` and start its I/O tasks.
    pub fn spawn(stream: TcpStream, observer: Weak<dyn ConnectionObserver>) -> Self {
        let peer_addr = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 0)));
        let (reader, writer) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
                peer_addr,
                write_tx,
                reading: AtomicBool::new(false),
                read_gate: Notify::new(),
                shutdown: Notify::new(),
                closed: AtomicBool::new(false),
                observer,
            }),
        };
        metrics().tcp_opened();
        debug!("TCP connection {} established with {}", connection.id(), peer_addr);

        tokio::spawn(connection.clone().read_loop(reader));
        tokio::spawn(connection.clone().write_loop(writer, write_rx));
        connection
    }

    /// Connection handle.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Address of the local application's end.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Open the read gate. Idempotent.
    pub fn start_reading(&self) {
        if !self.inner.reading.swap(true, Ordering::SeqCst) {
            self.inner.read_gate.notify_one();
        }
    }

    /// Queue `data` for the local application. Returns false once disconnected.
    pub fn write(&self, data: Bytes) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.write_tx.send(WriteCommand::Data(data)).is_ok()
    }

    /// True until the connection is disconnected from either end.
    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop reading, flush queued writes, then close. Idempotent.
    pub fn disconnect(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.write_tx.send(WriteCommand::Close);
        self.inner.shutdown.notify_one();
        metrics().tcp_closed();
        debug!("TCP connection {} with {} disconnected", self.id(), self.peer_addr());

        if let Some(observer) = self.inner.observer.upgrade() {
            observer.did_disconnect(self);
        }
    }

    async fn read_loop(self, mut reader: OwnedReadHalf) {
        if !self.inner.reading.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.inner.shutdown.notified() => return,
                _ = self.inner.read_gate.notified() => {}
            }
        }

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = self.inner.shutdown.notified() => break,
                result = reader.read(&mut buf) => match result {
                    Ok(0) => {
                        debug!("TCP connection {} closed by {}", self.id(), self.peer_addr());
                        self.disconnect();
                        break;
                    }
                    Ok(n) => {
                        trace!("TCP connection {} read {} bytes", self.id(), n);
                        if let Some(observer) = self.inner.observer.upgrade() {
                            observer.did_read(&self, Bytes::copy_from_slice(&buf[..n]));
                        }
                    }
                    Err(e) => {
                        debug!("TCP connection {} read failed: {}", self.id(), e);
                        self.disconnect();
                        break;
                    }
                },
            }
        }
    }

    async fn write_loop(
        self,
        mut writer: OwnedWriteHalf,
        mut commands: mpsc::UnboundedReceiver<WriteCommand>,
    ) {
        while let Some(command) = commands.recv().await {
            match command {
                WriteCommand::Data(data) => {
                    if let Err(e) = writer.write_all(&data).await {
                        debug!("TCP connection {} write failed: {}", self.id(), e);
                        self.disconnect();
                        break;
                    }
                }
                WriteCommand::Close => break,
            }
        }
        let _ = writer.shutdown().await;
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}
