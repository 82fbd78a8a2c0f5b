//! Session lifecycle state machine.
//!
//! ```text
//! [Connecting] ──activate──→ [Active] ──begin_close──→ [Closing] ──finish_close──→ [Closed]
//!       │                                                  ↑
//!       └──────────────────── begin_close ─────────────────┘
//! ```
//!
//! Only `Active` accepts request, broadcast and tunnel operations.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Atomically updated session state.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(SessionState::Connecting as u8))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.get() == SessionState::Active
    }

    /// Connecting → Active. Returns false from any other state.
    pub fn activate(&self) -> bool {
        self.transition(SessionState::Connecting, SessionState::Active)
    }

    /// Connecting/Active → Closing.
    ///
    /// Returns true for exactly one caller; that caller owns the teardown.
    pub fn begin_close(&self) -> bool {
        self.transition(SessionState::Active, SessionState::Closing)
            || self.transition(SessionState::Connecting, SessionState::Closing)
    }

    /// Closing → Closed.
    pub fn finish_close(&self) {
        self.0.store(SessionState::Closed as u8, Ordering::Release);
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
