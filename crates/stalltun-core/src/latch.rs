//! First-error-wins latch for the acceptor's terminal error.

use crate::error::TunnelError;
use std::sync::OnceLock;

/// Single-assignment slot, readable any number of times.
#[derive(Debug, Default)]
pub struct ErrorLatch {
    slot: OnceLock<TunnelError>,
}

impl ErrorLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `err` unless an error was already recorded. Returns `true` if
    /// this call won.
    pub fn set(&self, err: TunnelError) -> bool {
        self.slot.set(err).is_ok()
    }

    pub fn get(&self) -> Option<&TunnelError> {
        self.slot.get()
    }
}
