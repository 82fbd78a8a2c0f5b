//! Pending-call table: the async-to-sync bridge for outbound calls.
//!
//! Maps correlation IDs to the one-shot slots that suspended callers wait on.
//!
//! Flow:
//! 1. Broker allocates an id with `next_id()`
//! 2. Broker calls `register()` to get a oneshot receiver
//! 3. Broker hands the framed request to the transport
//! 4. Dispatch loop receives the reply and calls `resolve()`
//! 5. Broker awaits the receiver or times out and calls `cancel()`
//!
//! Every entry is removed exactly once. All mutation happens under a single
//! mutex that also guards the closed flag, so a registration can never slip
//! in after `close()` has drained the table.

use crate::domain::correlation::{CorrelationId, IdSequence};
use crate::domain::error::RelayError;
use parking_lot::Mutex;
use relay_telemetry::metrics::PENDING_CALLS;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// What a pending call resolves to.
pub type CallOutcome<T> = Result<T, RelayError>;

/// A call waiting for resolution
struct PendingCall<T> {
    /// Slot the suspended caller waits on
    sender: oneshot::Sender<CallOutcome<T>>,
    /// When the call was registered
    created_at: Instant,
    /// Absolute deadline; `None` when it lies beyond what `Instant` can represent
    deadline: Option<Instant>,
    /// Topic (for logging)
    topic: String,
}

/// Statistics for the pending-call table
#[derive(Debug, Default)]
pub struct PendingStats {
    /// Total calls registered
    pub total_registered: AtomicU64,
    /// Total calls resolved with a success payload
    pub total_completed: AtomicU64,
    /// Total calls resolved with a failure (remote or transport)
    pub total_failed: AtomicU64,
    /// Total calls abandoned at their deadline
    pub total_timeouts: AtomicU64,
    /// Total calls cancelled by teardown or caller drop
    pub total_cancelled: AtomicU64,
    /// Deliveries for ids that were unknown or already resolved
    pub total_late: AtomicU64,
}

struct TableState<T> {
    calls: HashMap<CorrelationId, PendingCall<T>>,
    closed: bool,
}

/// Pending-call table for one session.
pub struct PendingCallTable<T> {
    ids: IdSequence,
    state: Mutex<TableState<T>>,
    stats: PendingStats,
}

impl<T> Default for PendingCallTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingCallTable<T> {
    pub fn new() -> Self {
        Self {
            ids: IdSequence::new(),
            state: Mutex::new(TableState {
                calls: HashMap::new(),
                closed: false,
            }),
            stats: PendingStats::default(),
        }
    }

    /// Allocate a fresh correlation id for this session.
    pub fn next_id(&self) -> CorrelationId {
        self.ids.next()
    }

    /// Register a pending call and get the receiver its caller waits on.
    ///
    /// Fails with `NotConnected` once the table has been closed.
    pub fn register(
        &self,
        id: CorrelationId,
        topic: &str,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<CallOutcome<T>>, RelayError> {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();

        let call = PendingCall {
            sender: tx,
            created_at: now,
            deadline: now.checked_add(timeout),
            topic: topic.to_string(),
        };

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(RelayError::NotConnected);
            }
            state.calls.insert(id, call);
        }
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
        PENDING_CALLS.inc();

        debug!(
            correlation_id = %id,
            topic = topic,
            timeout_ms = saturating_u64(timeout.as_millis()),
            "Registered pending call"
        );

        Ok(rx)
    }

    /// Resolve a pending call with its outcome.
    ///
    /// Returns false if the id is unknown or was already resolved; duplicate
    /// and late deliveries are therefore harmless.
    pub fn resolve(&self, id: CorrelationId, outcome: CallOutcome<T>) -> bool {
        let Some(call) = self.take(id) else {
            self.stats.total_late.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %id, "Delivery for unknown or expired correlation ID");
            return false;
        };

        let elapsed = call.created_at.elapsed();
        if call.deadline.is_some_and(|deadline| Instant::now() > deadline) {
            debug!(
                correlation_id = %id,
                topic = call.topic,
                "Call resolved just past its deadline"
            );
        }

        let counter = if outcome.is_ok() {
            &self.stats.total_completed
        } else {
            &self.stats.total_failed
        };

        match call.sender.send(outcome) {
            Ok(()) => {
                counter.fetch_add(1, Ordering::Relaxed);
                debug!(
                    correlation_id = %id,
                    topic = call.topic,
                    response_time_us = saturating_u64(elapsed.as_micros()),
                    "Resolved pending call"
                );
                true
            }
            Err(_) => {
                // Caller went away between registration and delivery
                self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(correlation_id = %id, topic = call.topic, "Pending call receiver dropped");
                false
            }
        }
    }

    /// Remove a call because its deadline elapsed, resolving its slot with `reason`.
    ///
    /// Returns false if the call had already been resolved.
    pub fn cancel(&self, id: CorrelationId, reason: RelayError) -> bool {
        let Some(call) = self.take(id) else {
            return false;
        };
        if matches!(reason, RelayError::Timeout(_)) {
            self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
        }
        warn!(
            correlation_id = %id,
            topic = call.topic,
            reason = %reason,
            "Cancelled pending call"
        );
        let _ = call.sender.send(Err(reason));
        true
    }

    /// Drop a call whose caller stopped waiting, without resolving it.
    pub fn discard(&self, id: CorrelationId) -> bool {
        if self.take(id).is_some() {
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Close the table: resolve every outstanding call with `reason` and
    /// refuse further registrations. Returns the number of calls resolved.
    pub fn close(&self, reason: RelayError) -> usize {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.calls.drain().collect()
        };

        let count = drained.len();
        for (id, call) in drained {
            PENDING_CALLS.dec();
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %id, topic = call.topic, "Resolving pending call on close");
            let _ = call.sender.send(Err(reason.clone()));
        }
        count
    }

    /// Get number of currently pending calls
    pub fn pending_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Check if a correlation ID is pending
    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.state.lock().calls.contains_key(id)
    }

    /// Whether `close()` has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Get statistics
    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }

    fn take(&self, id: CorrelationId) -> Option<PendingCall<T>> {
        let call = self.state.lock().calls.remove(&id);
        if call.is_some() {
            PENDING_CALLS.dec();
        }
        call
    }
}

fn saturating_u64(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
