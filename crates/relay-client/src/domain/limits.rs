//! Service admission limits.
//!
//! [`ServiceLimits`] is the user-facing configuration surface: every field is
//! an optional override and zero means "use the default". It is resolved
//! once, at registration time, into explicit [`AdmissionLimits`] that the
//! admission controller consumes as plain data.

use serde::{Deserialize, Serialize};

/// Default memory allowance per traffic class (64 MiB).
pub const DEFAULT_MEMORY_LIMIT: usize = 64 * 1024 * 1024;

/// Handler threads per processing unit when a thread limit is not given.
pub const THREADS_PER_PROCESSING_UNIT: usize = 4;

/// Concurrency and memory allowances for a registered service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceLimits {
    /// Broadcast handlers to execute concurrently
    pub broadcast_threads: usize,
    /// Memory allowance for executing broadcasts (bytes)
    pub broadcast_memory: usize,
    /// Request handlers to execute concurrently
    pub request_threads: usize,
    /// Memory allowance for executing requests (bytes)
    pub request_memory: usize,
}

impl ServiceLimits {
    /// Resolve zero fields to defaults for a host with `processing_units` CPUs.
    pub fn resolve(&self, processing_units: usize) -> AdmissionLimits {
        let default_threads = THREADS_PER_PROCESSING_UNIT * processing_units.max(1);
        let pick = |value: usize, default: usize| if value == 0 { default } else { value };

        AdmissionLimits {
            broadcast: GateLimits::new(
                pick(self.broadcast_threads, default_threads),
                pick(self.broadcast_memory, DEFAULT_MEMORY_LIMIT),
            ),
            request: GateLimits::new(
                pick(self.request_threads, default_threads),
                pick(self.request_memory, DEFAULT_MEMORY_LIMIT),
            ),
        }
    }
}

/// Joint thread and memory budget of one traffic class.
///
/// Zero values are accepted here and admit nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateLimits {
    pub threads: usize,
    pub memory: usize,
}

impl GateLimits {
    pub const fn new(threads: usize, memory: usize) -> Self {
        Self { threads, memory }
    }

    /// True when the gate can never admit anything.
    pub const fn is_degenerate(&self) -> bool {
        self.threads == 0 || self.memory == 0
    }
}

/// Resolved limits for both traffic classes of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub broadcast: GateLimits,
    pub request: GateLimits,
}

/// Number of processing units on this host, at least one.
pub fn available_processing_units() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
