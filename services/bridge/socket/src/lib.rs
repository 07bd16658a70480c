//! Virtual sockets and local TCP primitives for the bridge.
//!
//! A virtual socket pairs one inbound and one outbound named stream of a peer
//! session into a full-duplex channel. The local side of the bridge is plain
//! TCP on the loopback interface: [`TcpClient`] dials a fixed service port and
//! [`TcpListener`] accepts on an ephemeral one. Relays glue the two together.
//!
//! ## Features
//!
//! - **Virtual sockets**: ordered, queued writes and chunked reads on a per-socket task
//! - **Builders**: initiator (open, then wait for the echo stream) and acceptor
//! - **Local TCP**: gated read loops, queued writes, bulk and per-connection teardown
//! - **Instrumentation**: process-wide counters with a periodic reporter

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod client;
pub mod connection;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod virtual_socket;

pub use builder::{AcceptorSocketBuilder, InitiatorSocketBuilder};
pub use client::TcpClient;
pub use connection::{ConnectionId, ConnectionObserver, TcpConnection};
pub use error::BridgeError;
pub use listener::{ListenerObserver, TcpListener};
pub use metrics::{metrics, BridgeMetrics, MetricsReporter, MetricsSnapshot};
pub use virtual_socket::{VirtualSocket, VirtualSocketObserver, DEFAULT_READ_CHUNK_SIZE};
