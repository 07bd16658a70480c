//! Peer session contract and in-memory named-stream transport for the bridge.
//!
//! A peer session is a negotiated connection to one remote endpoint that can
//! only exchange named, unidirectional byte streams. The relay layer consumes
//! sessions through the [`PeerSession`] trait; this crate also ships
//! [`MemorySession`], a loopback pair used by tests and the local harness.
//!
//! ## Features
//!
//! - **Session contract**: state, output streams, inbound stream events, disconnect
//! - **Event buffering**: events raised before an observer attaches are replayed
//! - **Memory transport**: paired sessions backed by `tokio::io::duplex`
//!
//! ## Example
//!
//! ```rust,no_run
//! use bridge_session::{MemorySession, PeerSession, SessionEvent};
//! use tokio::io::AsyncWriteExt;
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (local, remote) = MemorySession::pair("local", "remote");
//!
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! remote.attach(tx);
//!
//! let mut output = local.open_output_stream("s1")?;
//! output.write_all(b"hello").await?;
//!
//! while let Some(event) = rx.recv().await {
//!     match event {
//!         SessionEvent::InputStream { name, .. } => println!("peer opened {}", name),
//!         SessionEvent::StateChanged(state) => println!("session is now {}", state),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod session;

pub use memory::MemorySession;
pub use session::{
    InputStream, OutputStream, PeerId, PeerSession, SessionError, SessionEvent, SessionState,
};
