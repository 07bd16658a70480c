//! In-process peer sessions connected back to back.
//!
//! Each output stream is carried by a pump task copying between two duplex
//! pipes, so tearing the session down only has to abort the pumps: writers
//! start failing and readers see end of stream.

use crate::session::{
    InputStream, OutputStream, PeerId, PeerSession, SessionError, SessionEvent, SessionState,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of each duplex pipe backing a stream.
const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Delivery {
    sender: Option<mpsc::UnboundedSender<SessionEvent>>,
    backlog: Vec<SessionEvent>,
}

/// State shared by both ends of a pair.
#[derive(Default)]
struct Link {
    pumps: Mutex<Vec<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

/// One end of an in-memory session pair.
pub struct MemorySession {
    peer: PeerId,
    state: Mutex<SessionState>,
    delivery: Mutex<Delivery>,
    remote: Mutex<Weak<MemorySession>>,
    link: Arc<Link>,
    pipe_capacity: usize,
    refuse_streams: AtomicBool,
    drop_inbound: AtomicBool,
}

impl MemorySession {
    /// Create two connected sessions. `a` talks to peer `b` and vice versa.
    pub fn pair(a: &str, b: &str) -> (Arc<MemorySession>, Arc<MemorySession>) {
        Self::pair_with_capacity(a, b, DEFAULT_PIPE_CAPACITY)
    }

    /// Create a pair whose stream pipes buffer at most `pipe_capacity` bytes.
    pub fn pair_with_capacity(
        a: &str,
        b: &str,
        pipe_capacity: usize,
    ) -> (Arc<MemorySession>, Arc<MemorySession>) {
        let link = Arc::new(Link::default());
        // Each side is named after the peer it talks to.
        let left = Arc::new(Self::new(PeerId::from(b), link.clone(), pipe_capacity));
        let right = Arc::new(Self::new(PeerId::from(a), link, pipe_capacity));
        *lock(&left.remote) = Arc::downgrade(&right);
        *lock(&right.remote) = Arc::downgrade(&left);
        debug!("Created memory session pair {} <-> {}", a, b);
        (left, right)
    }

    fn new(peer: PeerId, link: Arc<Link>, pipe_capacity: usize) -> Self {
        Self {
            peer,
            state: Mutex::new(SessionState::Connected),
            delivery: Mutex::new(Delivery::default()),
            remote: Mutex::new(Weak::new()),
            link,
            pipe_capacity,
            refuse_streams: AtomicBool::new(false),
            drop_inbound: AtomicBool::new(false),
        }
    }

    /// Make `open_output_stream` on this side fail with [`SessionError::StreamRejected`].
    pub fn set_refuse_streams(&self, refuse: bool) {
        self.refuse_streams.store(refuse, Ordering::SeqCst);
    }

    /// Silently discard streams the peer opens towards this side.
    pub fn set_drop_inbound(&self, drop_inbound: bool) {
        self.drop_inbound.store(drop_inbound, Ordering::SeqCst);
    }

    /// Number of stream pumps that are still running.
    pub fn active_streams(&self) -> usize {
        let mut pumps = lock(&self.link.pumps);
        pumps.retain(|pump| !pump.is_finished());
        pumps.len()
    }

    fn set_state(&self, new_state: SessionState) {
        let old_state = {
            let mut state = lock(&self.state);
            if *state == new_state {
                return;
            }
            std::mem::replace(&mut *state, new_state)
        };
        info!("Session with {} {} -> {}", self.peer, old_state, new_state);
        self.deliver(SessionEvent::StateChanged(new_state));
    }

    fn deliver(&self, event: SessionEvent) {
        let mut delivery = lock(&self.delivery);
        match delivery.sender.as_ref() {
            Some(sender) => {
                if sender.send(event).is_err() {
                    debug!("Observer of session with {} has gone away", self.peer);
                    delivery.sender = None;
                }
            }
            None => delivery.backlog.push(event),
        }
    }

    fn receive_stream(&self, name: String, stream: InputStream) {
        if self.drop_inbound.load(Ordering::SeqCst) {
            debug!("Dropping inbound stream {} from {}", name, self.peer);
            return;
        }
        self.deliver(SessionEvent::InputStream { name, stream });
    }
}

impl PeerSession for MemorySession {
    fn peer(&self) -> &PeerId {
        &self.peer
    }

    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn open_output_stream(&self, name: &str) -> Result<OutputStream, SessionError> {
        if self.state() != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        if self.refuse_streams.load(Ordering::SeqCst) {
            return Err(SessionError::StreamRejected(name.to_string()));
        }
        let remote = lock(&self.remote)
            .upgrade()
            .ok_or(SessionError::NotConnected)?;

        let (writer, mut pump_in) = tokio::io::duplex(self.pipe_capacity);
        let (mut pump_out, reader) = tokio::io::duplex(self.pipe_capacity);

        let peer = self.peer.clone();
        let stream_name = name.to_string();
        let pump = tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut pump_in, &mut pump_out).await {
                debug!("Stream {} to {} stopped: {}", stream_name, peer, e);
            }
            let _ = pump_out.shutdown().await;
        });

        {
            let mut pumps = lock(&self.link.pumps);
            if self.link.torn_down.load(Ordering::SeqCst) {
                pump.abort();
                return Err(SessionError::NotConnected);
            }
            pumps.retain(|pump| !pump.is_finished());
            pumps.push(pump);
        }

        debug!("Opened output stream {} to {}", name, self.peer);
        remote.receive_stream(name.to_string(), Box::new(reader));
        Ok(Box::new(writer))
    }

    fn attach(&self, events: mpsc::UnboundedSender<SessionEvent>) {
        let mut delivery = lock(&self.delivery);
        for event in delivery.backlog.drain(..) {
            if events.send(event).is_err() {
                warn!("Observer of session with {} dropped before attach", self.peer);
                return;
            }
        }
        delivery.sender = Some(events);
    }

    fn disconnect(&self) {
        if self.link.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let pumps: Vec<_> = lock(&self.link.pumps).drain(..).collect();
        for pump in &pumps {
            pump.abort();
        }
        debug!("Aborted {} streams with {}", pumps.len(), self.peer);

        let remote = lock(&self.remote).upgrade();
        self.set_state(SessionState::NotConnected);
        if let Some(remote) = remote {
            remote.set_state(SessionState::NotConnected);
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        // The pair lives only as long as both ends.
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_output_stream_delivered_to_peer() {
        let (left, right) = MemorySession::pair("left", "right");
        assert_eq!(left.peer().0, "right");
        assert_eq!(right.peer().0, "left");

        let (tx, mut rx) = mpsc::unbounded_channel();
        right.attach(tx);

        let mut output = left.open_output_stream("s1").unwrap();
        output.write_all(b"hello peer").await.unwrap();
        output.shutdown().await.unwrap();

        match next_event(&mut rx).await {
            SessionEvent::InputStream { name, mut stream } => {
                assert_eq!(name, "s1");
                let mut received = Vec::new();
                stream.read_to_end(&mut received).await.unwrap();
                assert_eq!(received, b"hello peer");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_events_buffered_until_attach() {
        let (left, right) = MemorySession::pair("left", "right");
        let _output = left.open_output_stream("early").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        right.attach(tx);

        match next_event(&mut rx).await {
            SessionEvent::InputStream { name, .. } => assert_eq!(name, "early"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_notifies_both_sides() {
        let (left, right) = MemorySession::pair("left", "right");
        let (left_tx, mut left_rx) = mpsc::unbounded_channel();
        let (right_tx, mut right_rx) = mpsc::unbounded_channel();
        left.attach(left_tx);
        right.attach(right_tx);

        left.disconnect();
        left.disconnect();
        right.disconnect();

        assert_eq!(left.state(), SessionState::NotConnected);
        assert_eq!(right.state(), SessionState::NotConnected);

        for rx in [&mut left_rx, &mut right_rx] {
            match next_event(rx).await {
                SessionEvent::StateChanged(state) => {
                    assert_eq!(state, SessionState::NotConnected)
                }
                other => panic!("unexpected event {:?}", other),
            }
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_streams() {
        let (left, right) = MemorySession::pair("left", "right");
        let (tx, mut rx) = mpsc::unbounded_channel();
        right.attach(tx);

        let _output = left.open_output_stream("s1").unwrap();
        let mut input = match next_event(&mut rx).await {
            SessionEvent::InputStream { stream, .. } => stream,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(left.active_streams(), 1);

        right.disconnect();

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(1), input.read(&mut buf))
            .await
            .expect("read did not finish")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(left.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_open_output_stream_errors() {
        let (left, right) = MemorySession::pair("left", "right");

        left.set_refuse_streams(true);
        assert_eq!(
            left.open_output_stream("s1").err(),
            Some(SessionError::StreamRejected("s1".to_string()))
        );

        right.disconnect();
        assert_eq!(
            right.open_output_stream("s2").err(),
            Some(SessionError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_drop_inbound_swallows_streams() {
        let (left, right) = MemorySession::pair("left", "right");
        right.set_drop_inbound(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        right.attach(tx);

        let _output = left.open_output_stream("lost").unwrap();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
