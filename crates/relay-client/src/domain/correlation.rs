//! Correlation identifiers for matching replies to pending calls.
//!
//! Ids are allocated from a per-session monotonic counter, so no two live
//! ids collide within one session and an id is never reused while its call
//! is outstanding.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Correlation ID tying an outbound request to its reply or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Wrap a raw id, e.g. one assigned by the relay to an inbound request.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw counter value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for CorrelationId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Identifier of an open tunnel, assigned by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(u64);

impl TunnelId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tun-{}", self.0)
    }
}

/// Monotonic id source scoped to one session.
#[derive(Debug, Default)]
pub struct IdSequence {
    next: AtomicU64,
}

impl IdSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id.
    pub fn next(&self) -> CorrelationId {
        CorrelationId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
