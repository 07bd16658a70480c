//! Full-duplex channel over one inbound and one outbound named stream.
//!
//! Every opened socket owns a single task multiplexing both directions, so a
//! stalled stream of one socket never holds up another. Writes are queued as
//! chunks and drained strictly in call order; a partial write leaves only the
//! unwritten tail at the head of the queue.
//!
//! [`close`](VirtualSocket::close) drops whatever is still queued, while
//! [`close_gracefully`](VirtualSocket::close_gracefully) stops reading and
//! delivers the queue before releasing the streams.

use crate::metrics::metrics;
use bridge_session::{InputStream, OutputStream};
use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Bytes pulled from the input stream per read.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 1024;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Callbacks raised by a [`VirtualSocket`].
///
/// `did_open` fires at most once and before any `did_read`. `did_close` fires
/// exactly once, after both streams have been released.
pub trait VirtualSocketObserver: Send + Sync {
    /// Both directions are ready; writes will now be delivered.
    fn did_open(&self, _socket: &VirtualSocket) {}

    /// A chunk arrived from the peer.
    fn did_read(&self, socket: &VirtualSocket, data: Bytes);

    /// The socket is closed for good.
    fn did_close(&self, socket: &VirtualSocket);
}

/// A full-duplex channel synthesized from two unidirectional streams
pub struct VirtualSocket {
    id: u64,
    name: String,
    read_chunk_size: usize,
    streams: Mutex<Option<(InputStream, OutputStream)>>,
    observer: Mutex<Option<Weak<dyn VirtualSocketObserver>>>,
    opened: AtomicBool,
    closed: AtomicBool,
    draining: AtomicBool,
    finished: AtomicBool,
    pending: Mutex<VecDeque<Bytes>>,
    write_ready: Notify,
    shutdown: Notify,
}

impl VirtualSocket {
    /// Pair `input` and `output`, both carried under the stream `name`.
    pub fn new(
        name: impl Into<String>,
        input: InputStream,
        output: OutputStream,
        read_chunk_size: usize,
    ) -> Arc<Self> {
        let socket = Arc::new(Self {
            id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            read_chunk_size: read_chunk_size.max(1),
            streams: Mutex::new(Some((input, output))),
            observer: Mutex::new(None),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            write_ready: Notify::new(),
            shutdown: Notify::new(),
        });
        debug!("Virtual socket {} created for stream {}", socket.id, socket.name);
        socket
    }

    /// Process-unique socket id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name of the stream pair backing this socket.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the observer. Only a weak reference is kept.
    pub fn set_observer(&self, observer: Weak<dyn VirtualSocketObserver>) {
        *lock(&self.observer) = Some(observer);
    }

    /// True once opened and until closed.
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    /// True once the socket has been closed, by either side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Start the I/O task. A second call is a no-op.
    pub fn open(self: &Arc<Self>) {
        if self.opened.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.closed.load(Ordering::SeqCst) {
            // close() raced us and left teardown to whoever saw the socket opened.
            self.finish();
            return;
        }
        let Some((input, output)) = lock(&self.streams).take() else {
            return;
        };
        metrics().socket_opened();
        let socket = Arc::clone(self);
        tokio::spawn(async move {
            socket.run(input, output).await;
        });
    }

    /// Queue `data` for delivery to the peer.
    pub fn write(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        if self.closed.load(Ordering::SeqCst) || self.draining.load(Ordering::SeqCst) {
            trace!("Virtual socket {} closed, dropping {} bytes", self.id, data.len());
            return;
        }
        lock(&self.pending).push_back(data);
        self.write_ready.notify_one();
    }

    /// Close the socket. Concurrent and repeated calls collapse into one.
    pub fn close(&self) {
        if !self.mark_closed() {
            return;
        }
        if self.opened.load(Ordering::SeqCst) {
            self.shutdown.notify_one();
        } else {
            self.finish();
        }
    }

    /// Stop reading and close once every queued write has reached the peer.
    ///
    /// A socket that never opened closes at once. A later [`close`](Self::close)
    /// still cuts the drain short.
    pub fn close_gracefully(&self) {
        if self.closed.load(Ordering::SeqCst) || self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.opened.load(Ordering::SeqCst) {
            self.write_ready.notify_one();
        } else {
            self.close();
        }
    }

    fn mark_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        lock(&self.pending).clear();
        true
    }

    async fn run(self: Arc<Self>, mut input: InputStream, mut output: OutputStream) {
        if let Some(observer) = self.observer() {
            observer.did_open(&self);
        }

        let mut buf = vec![0u8; self.read_chunk_size];
        let mut drained = false;
        loop {
            let draining = self.draining.load(Ordering::SeqCst);
            let front = lock(&self.pending).front().cloned();
            if draining && front.is_none() {
                drained = !self.closed.load(Ordering::SeqCst);
                break;
            }
            tokio::select! {
                _ = self.shutdown.notified() => break,
                result = input.read(&mut buf), if !draining => match result {
                    Ok(0) => {
                        debug!("Virtual socket {} input reached end of stream", self.id);
                        break;
                    }
                    Ok(n) => {
                        metrics().received_from_peer(n);
                        if let Some(observer) = self.observer() {
                            observer.did_read(&self, Bytes::copy_from_slice(&buf[..n]));
                        }
                    }
                    Err(e) => {
                        debug!("Virtual socket {} read failed: {}", self.id, e);
                        break;
                    }
                },
                result = write_chunk(&mut output, front.as_ref()), if front.is_some() => match result {
                    Ok(n) => {
                        metrics().sent_to_peer(n);
                        if self.advance(n) {
                            if let Err(e) = output.flush().await {
                                debug!("Virtual socket {} flush failed: {}", self.id, e);
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("Virtual socket {} write failed: {}", self.id, e);
                        break;
                    }
                },
                _ = self.write_ready.notified(), if front.is_none() => {}
            }
        }

        drop(input);
        if drained {
            debug!("Virtual socket {} drained, closing output", self.id);
            if let Err(e) = output.shutdown().await {
                debug!("Virtual socket {} shutdown failed: {}", self.id, e);
            }
        }
        self.mark_closed();
        drop(output);
        metrics().socket_closed();
        self.finish();
    }

    /// Drop `n` written bytes from the queue head. Returns true when the queue drained.
    fn advance(&self, n: usize) -> bool {
        let mut pending = lock(&self.pending);
        if let Some(front) = pending.front_mut() {
            if n >= front.len() {
                pending.pop_front();
            } else {
                front.advance(n);
            }
        }
        pending.is_empty()
    }

    fn observer(&self) -> Option<Arc<dyn VirtualSocketObserver>> {
        lock(&self.observer).as_ref().and_then(Weak::upgrade)
    }

    fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        drop(lock(&self.streams).take());
        let observer = lock(&self.observer).take();
        debug!("Virtual socket {} for stream {} closed", self.id, self.name);
        if let Some(observer) = observer.and_then(|weak| weak.upgrade()) {
            observer.did_close(self);
        }
    }
}

async fn write_chunk(output: &mut OutputStream, chunk: Option<&Bytes>) -> io::Result<usize> {
    match chunk {
        Some(chunk) => match output.write(chunk).await? {
            0 => Err(io::ErrorKind::WriteZero.into()),
            n => Ok(n),
        },
        None => std::future::pending().await,
    }
}

impl fmt::Debug for VirtualSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualSocket")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("opened", &self.opened.load(Ordering::SeqCst))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[derive(Debug, PartialEq)]
    enum Recorded {
        Open,
        Read(Bytes),
        Close,
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Recorded>,
    }

    impl VirtualSocketObserver for Recorder {
        fn did_open(&self, _socket: &VirtualSocket) {
            let _ = self.tx.send(Recorded::Open);
        }

        fn did_read(&self, _socket: &VirtualSocket, data: Bytes) {
            let _ = self.tx.send(Recorded::Read(data));
        }

        fn did_close(&self, _socket: &VirtualSocket) {
            let _ = self.tx.send(Recorded::Close);
        }
    }

    struct Harness {
        socket: Arc<VirtualSocket>,
        _recorder: Arc<Recorder>,
        events: mpsc::UnboundedReceiver<Recorded>,
        /// Peer end feeding the socket's input
        peer_writer: DuplexStream,
        /// Peer end draining the socket's output
        peer_reader: DuplexStream,
    }

    fn harness(capacity: usize, chunk: usize) -> Harness {
        let (input, peer_writer) = tokio::io::duplex(capacity);
        let (output, peer_reader) = tokio::io::duplex(capacity);
        let socket = VirtualSocket::new("test", Box::new(input), Box::new(output), chunk);
        let (tx, events) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder { tx });
        let observer: Weak<dyn VirtualSocketObserver> = Arc::<Recorder>::downgrade(&recorder);
        socket.set_observer(observer);
        Harness {
            socket,
            _recorder: recorder,
            events,
            peer_writer,
            peer_reader,
        }
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<Recorded>) -> Recorded {
        timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("timed out waiting for socket event")
            .expect("recorder dropped")
    }

    #[tokio::test]
    async fn test_open_then_read() {
        let mut h = harness(4096, DEFAULT_READ_CHUNK_SIZE);
        h.socket.open();
        h.socket.open();
        assert_eq!(next(&mut h.events).await, Recorded::Open);
        assert!(h.socket.is_open());

        h.peer_writer.write_all(b"ping").await.unwrap();
        assert_eq!(
            next(&mut h.events).await,
            Recorded::Read(Bytes::from_static(b"ping"))
        );
    }

    #[tokio::test]
    async fn test_reads_are_chunked() {
        let mut h = harness(8192, 1024);
        h.socket.open();
        assert_eq!(next(&mut h.events).await, Recorded::Open);

        h.peer_writer.write_all(&[7u8; 3000]).await.unwrap();
        let mut total = 0;
        while total < 3000 {
            match next(&mut h.events).await {
                Recorded::Read(data) => {
                    assert!(data.len() <= 1024);
                    total += data.len();
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(total, 3000);
    }

    #[tokio::test]
    async fn test_writes_preserve_order_across_partial_writes() {
        // An 8 byte pipe forces nearly every write to be partial.
        let mut h = harness(8, DEFAULT_READ_CHUNK_SIZE);
        h.socket.open();
        assert_eq!(next(&mut h.events).await, Recorded::Open);

        let mut expected = Vec::new();
        for i in 0..50u8 {
            let chunk: Vec<u8> = (0..(i as usize % 13 + 1)).map(|j| i.wrapping_add(j as u8)).collect();
            expected.extend_from_slice(&chunk);
            h.socket.write(Bytes::from(chunk));
        }

        let mut received = vec![0u8; expected.len()];
        timeout(Duration::from_secs(2), h.peer_reader.read_exact(&mut received))
            .await
            .expect("timed out draining writes")
            .unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut h = harness(4096, DEFAULT_READ_CHUNK_SIZE);
        h.socket.open();
        assert_eq!(next(&mut h.events).await, Recorded::Open);

        h.socket.close();
        h.socket.close();
        assert_eq!(next(&mut h.events).await, Recorded::Close);
        assert!(h.socket.is_closed());

        // Output released: the peer reads end of stream.
        let mut buf = [0u8; 4];
        assert_eq!(h.peer_reader.read(&mut buf).await.unwrap(), 0);

        h.socket.close();
        h.socket.write(Bytes::from_static(b"late"));
        tokio::task::yield_now().await;
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_peer_end_of_stream_closes_socket() {
        let mut h = harness(4096, DEFAULT_READ_CHUNK_SIZE);
        h.socket.open();
        assert_eq!(next(&mut h.events).await, Recorded::Open);

        drop(h.peer_writer);
        assert_eq!(next(&mut h.events).await, Recorded::Close);
        assert!(h.socket.is_closed());
    }

    #[tokio::test]
    async fn test_graceful_close_delivers_queued_writes() {
        // A small pipe keeps most of the queue pending when the close arrives.
        let mut h = harness(64, DEFAULT_READ_CHUNK_SIZE);
        h.socket.open();
        assert_eq!(next(&mut h.events).await, Recorded::Open);

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        for chunk in payload.chunks(500) {
            h.socket.write(Bytes::copy_from_slice(chunk));
        }
        h.socket.close_gracefully();
        h.socket.close_gracefully();
        h.socket.write(Bytes::from_static(b"late"));
        assert!(!h.socket.is_closed());

        let mut received = Vec::new();
        timeout(Duration::from_secs(2), h.peer_reader.read_to_end(&mut received))
            .await
            .expect("timed out draining writes")
            .unwrap();
        assert_eq!(received, payload);

        assert_eq!(next(&mut h.events).await, Recorded::Close);
        assert!(h.socket.is_closed());
        tokio::task::yield_now().await;
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_graceful_close_stops_reading() {
        let mut h = harness(4096, DEFAULT_READ_CHUNK_SIZE);
        h.socket.open();
        assert_eq!(next(&mut h.events).await, Recorded::Open);

        h.socket.close_gracefully();
        assert_eq!(next(&mut h.events).await, Recorded::Close);

        // The input was released, so the peer can no longer write into it.
        let result = h.peer_writer.write_all(b"too late").await;
        assert!(result.is_err());
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hard_close_interrupts_drain() {
        let mut h = harness(8, DEFAULT_READ_CHUNK_SIZE);
        h.socket.open();
        assert_eq!(next(&mut h.events).await, Recorded::Open);

        h.socket.write(Bytes::from(vec![1u8; 1024]));
        h.socket.close_gracefully();
        h.socket.close();
        assert_eq!(next(&mut h.events).await, Recorded::Close);

        let mut received = Vec::new();
        timeout(Duration::from_secs(1), h.peer_reader.read_to_end(&mut received))
            .await
            .expect("output was not released")
            .unwrap();
        assert!(received.len() < 1024);
    }

    #[tokio::test]
    async fn test_close_before_open() {
        let mut h = harness(4096, DEFAULT_READ_CHUNK_SIZE);
        h.socket.close();
        assert_eq!(next(&mut h.events).await, Recorded::Close);

        h.socket.open();
        tokio::task::yield_now().await;
        assert!(h.events.try_recv().is_err());
        assert!(!h.socket.is_open());
    }
}
