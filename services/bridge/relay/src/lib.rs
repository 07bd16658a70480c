//! Advertiser and browser relays for the bridge.
//!
//! A relay owns one peer session and binds each virtual socket built on it to
//! exactly one local TCP connection. The [`AdvertiserRelay`] answers streams
//! the peer opens and dials a fixed local service port; the [`BrowserRelay`]
//! listens on an ephemeral local port and opens a stream per accepted
//! connection. Whichever half of a pair fails first tears down the other.
//!
//! ## Example
//!
//! ```rust,no_run
//! use bridge_relay::{AdvertiserRelay, BrowserRelay};
//! use bridge_session::MemorySession;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), bridge_socket::BridgeError> {
//! let (browser_side, advertiser_side) = MemorySession::pair("browser", "advertiser");
//!
//! let advertiser = AdvertiserRelay::new(advertiser_side, 8080);
//! let browser = BrowserRelay::new(browser_side, 1, Duration::from_secs(5));
//!
//! // Local clients connecting here reach 127.0.0.1:8080 on the other side.
//! let port = browser.open_relay()?;
//! println!("bridge listening on {}", port);
//!
//! browser.close_relay();
//! advertiser.close_relay();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod advertiser;
pub mod browser;
pub mod config;
mod events;
pub mod gate;
mod pairing;

pub use advertiser::AdvertiserRelay;
pub use browser::BrowserRelay;
pub use config::{RelayConfig, DEFAULT_MAX_VIRTUAL_SOCKETS, DEFAULT_STREAM_TIMEOUT};
pub use gate::RelayState;
