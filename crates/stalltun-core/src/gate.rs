//! Per-direction stall gate.
//!
//! A gate is either open or armed. While armed, a forwarding task that calls
//! [`StallGate::check_and_wait`] parks until [`StallGate::unlock`] is called.
//! Arming is idempotent (there is never more than one pending stall), and an
//! unlock on an open gate does nothing: it cannot be "saved up" to let a later
//! lock pass through.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GateState {
    armed: bool,
    /// Bumped on every effective unlock. A waiter that saw epoch `n` is
    /// released once the epoch moves on, even if the gate was re-armed in the
    /// meantime.
    epoch: u64,
}

/// Single-slot arm/wait/release primitive shared between the control surface
/// and one forwarding task.
#[derive(Debug)]
pub struct StallGate {
    state: watch::Sender<GateState>,
}

impl Default for StallGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StallGate {
    /// Create an open (unarmed) gate.
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState {
            armed: false,
            epoch: 0,
        });
        Self { state }
    }

    /// Arm the gate. Has no additional effect if already armed.
    pub fn lock(&self) {
        self.state.send_if_modified(|s| {
            if s.armed {
                false
            } else {
                s.armed = true;
                true
            }
        });
    }

    /// Disarm the gate and release the waiter, if armed. No-op otherwise.
    pub fn unlock(&self) {
        self.state.send_if_modified(|s| {
            if s.armed {
                s.armed = false;
                s.epoch = s.epoch.wrapping_add(1);
                true
            } else {
                false
            }
        });
    }

    /// Whether the gate is currently armed.
    pub fn is_armed(&self) -> bool {
        self.state.borrow().armed
    }

    /// Return immediately if the gate is open, otherwise wait for the next
    /// unlock.
    pub async fn check_and_wait(&self) {
        let mut rx = self.state.subscribe();
        let seen = *rx.borrow_and_update();
        if !seen.armed {
            return;
        }
        // The sender lives in `self`, so `wait_for` cannot observe a closed
        // channel while we hold `&self`.
        let _ = rx
            .wait_for(|s| !s.armed || s.epoch != seen.epoch)
            .await;
    }
}
