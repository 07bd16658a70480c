//! One-directional relay lifecycle with a one-shot teardown gate.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a relay. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RelayState {
    /// Created, local endpoint not yet up
    Connecting = 0,
    /// Bridging traffic
    Connected = 1,
    /// Torn down or being torn down; terminal
    Disconnecting = 2,
}

impl RelayState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RelayState::Connecting,
            1 => RelayState::Connected,
            _ => RelayState::Disconnecting,
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayState::Connecting => "connecting",
            RelayState::Connected => "connected",
            RelayState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub(crate) struct LifecycleGate(AtomicU8);

impl LifecycleGate {
    pub(crate) fn new(initial: RelayState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub(crate) fn state(&self) -> RelayState {
        RelayState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move from `from` to `to`. Fails if the state is no longer `from`.
    pub(crate) fn advance(&self, from: RelayState, to: RelayState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Flip to `Disconnecting`. Returns true for exactly one caller.
    pub(crate) fn begin_disconnect(&self) -> bool {
        self.0.swap(RelayState::Disconnecting as u8, Ordering::SeqCst)
            != RelayState::Disconnecting as u8
    }

    pub(crate) fn is_disconnecting(&self) -> bool {
        self.state() == RelayState::Disconnecting
    }
}
