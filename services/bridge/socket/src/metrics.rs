//! Bridge metrics and monitoring

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

static METRICS: Lazy<BridgeMetrics> = Lazy::new(BridgeMetrics::default);

/// Process-wide bridge counters.
pub fn metrics() -> &'static BridgeMetrics {
    &METRICS
}

/// Live-object and traffic counters shared by every relay in the process
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    sockets_opened: AtomicU64,
    sockets_closed: AtomicU64,
    builders_started: AtomicU64,
    builders_succeeded: AtomicU64,
    builders_failed: AtomicU64,
    builders_timed_out: AtomicU64,
    capacity_rejections: AtomicU64,
    tcp_opened: AtomicU64,
    tcp_closed: AtomicU64,
    bytes_to_peer: AtomicU64,
    bytes_from_peer: AtomicU64,
}

impl BridgeMetrics {
    pub(crate) fn socket_opened(&self) {
        self.sockets_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn socket_closed(&self) {
        self.sockets_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn builder_started(&self) {
        self.builders_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn builder_succeeded(&self) {
        self.builders_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn builder_failed(&self) {
        self.builders_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn builder_timed_out(&self) {
        self.builders_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a virtual socket refused because a relay is at capacity.
    pub fn capacity_rejected(&self) {
        self.capacity_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tcp_opened(&self) {
        self.tcp_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tcp_closed(&self) {
        self.tcp_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sent_to_peer(&self, bytes: usize) {
        self.bytes_to_peer.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn received_from_peer(&self, bytes: usize) {
        self.bytes_from_peer.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Take a consistent-enough copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let sockets_opened = self.sockets_opened.load(Ordering::Relaxed);
        let sockets_closed = self.sockets_closed.load(Ordering::Relaxed);
        let tcp_opened = self.tcp_opened.load(Ordering::Relaxed);
        let tcp_closed = self.tcp_closed.load(Ordering::Relaxed);
        MetricsSnapshot {
            sockets_opened,
            sockets_closed,
            live_sockets: sockets_opened.saturating_sub(sockets_closed),
            builders_started: self.builders_started.load(Ordering::Relaxed),
            builders_succeeded: self.builders_succeeded.load(Ordering::Relaxed),
            builders_failed: self.builders_failed.load(Ordering::Relaxed),
            builders_timed_out: self.builders_timed_out.load(Ordering::Relaxed),
            capacity_rejections: self.capacity_rejections.load(Ordering::Relaxed),
            tcp_opened,
            tcp_closed,
            live_tcp_connections: tcp_opened.saturating_sub(tcp_closed),
            bytes_to_peer: self.bytes_to_peer.load(Ordering::Relaxed),
            bytes_from_peer: self.bytes_from_peer.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`BridgeMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Virtual sockets whose I/O task started
    pub sockets_opened: u64,
    /// Opened virtual sockets that have since closed
    pub sockets_closed: u64,
    /// Opened virtual sockets not yet closed
    pub live_sockets: u64,
    /// Builder attempts
    pub builders_started: u64,
    /// Builders that produced a socket
    pub builders_succeeded: u64,
    /// Builders that failed for any reason other than a timeout
    pub builders_failed: u64,
    /// Builders that gave up waiting for the peer's stream
    pub builders_timed_out: u64,
    /// Sockets refused because a relay was full
    pub capacity_rejections: u64,
    /// Local TCP connections established
    pub tcp_opened: u64,
    /// Local TCP connections torn down
    pub tcp_closed: u64,
    /// Local TCP connections still up
    pub live_tcp_connections: u64,
    /// Bytes written towards the peer
    pub bytes_to_peer: u64,
    /// Bytes read from the peer
    pub bytes_from_peer: u64,
}

/// Periodic bridge metrics reporter
#[derive(Debug)]
pub struct MetricsReporter {
    collection_interval: Duration,
}

impl MetricsReporter {
    /// Create a reporter logging every `collection_interval`
    pub fn new(collection_interval: Duration) -> Self {
        Self {
            collection_interval,
        }
    }

    /// Start the metrics collection task
    pub fn start_collection_task(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval_timer = interval(self.collection_interval);

            info!(
                "Starting bridge metrics collection task (interval: {:?})",
                self.collection_interval
            );

            loop {
                interval_timer.tick().await;

                let snapshot = metrics().snapshot();
                self.log_metrics(&snapshot);
                self.check_health(&snapshot);
            }
        })
    }

    fn log_metrics(&self, snapshot: &MetricsSnapshot) {
        info!(
            "Bridge Metrics - Live sockets: {}, Live TCP: {}, Builders: {} started / {} ok / {} failed / {} timed out, Rejected: {}, To peer: {} B, From peer: {} B",
            snapshot.live_sockets,
            snapshot.live_tcp_connections,
            snapshot.builders_started,
            snapshot.builders_succeeded,
            snapshot.builders_failed,
            snapshot.builders_timed_out,
            snapshot.capacity_rejections,
            snapshot.bytes_to_peer,
            snapshot.bytes_from_peer
        );
    }

    fn check_health(&self, snapshot: &MetricsSnapshot) {
        if snapshot.builders_started > 0 {
            let failed = snapshot.builders_failed + snapshot.builders_timed_out;
            let failure_rate = (failed as f64 / snapshot.builders_started as f64) * 100.0;
            if failure_rate > 10.0 {
                warn!(
                    "High virtual socket build failure rate: {:.1}% ({}/{})",
                    failure_rate, failed, snapshot.builders_started
                );
            }
        }

        if snapshot.live_sockets != snapshot.live_tcp_connections {
            debug!(
                "Live sockets ({}) and live TCP connections ({}) differ",
                snapshot.live_sockets, snapshot.live_tcp_connections
            );
        }
    }
}
