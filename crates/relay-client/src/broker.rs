//! Request/reply broker.
//!
//! Turns an outbound call into a correlated frame, parks the caller on a
//! pending-call slot and wakes it when the reply, a remote failure, the
//! deadline, or session teardown resolves the slot. Whichever comes first
//! wins; the rest are no-ops.

use crate::domain::correlation::CorrelationId;
use crate::domain::error::{RelayError, RelayResult};
use crate::domain::pending::{CallOutcome, PendingCallTable};
use crate::ports::FrameSink;
use crate::protocol::{Frame, ReplyOutcome};
use crate::session::Tunnel;
use bytes::Bytes;
use relay_telemetry::metrics::{REQUESTS_SENT, REQUEST_DURATION, REQUEST_OUTCOMES};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Correlates outbound requests and tunnel opens of one session.
pub struct RequestBroker {
    sink: Arc<dyn FrameSink>,
    requests: PendingCallTable<Bytes>,
    tunnels: PendingCallTable<Tunnel>,
}

impl RequestBroker {
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self {
            sink,
            requests: PendingCallTable::new(),
            tunnels: PendingCallTable::new(),
        }
    }

    /// Send a request to `topic` and wait up to `timeout` for its reply.
    pub async fn request(
        &self,
        topic: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> RelayResult<Bytes> {
        let started = Instant::now();
        let id = self.requests.next_id();
        let rx = self.requests.register(id, topic, timeout)?;
        let mut guard = CallGuard::new(&self.requests, id);

        let frame = Frame::Request {
            id,
            topic: topic.to_string(),
            payload,
            timeout_ms: duration_ms(timeout),
        };

        let outcome = match self.sink.send(frame).await {
            Ok(()) => {
                REQUESTS_SENT.inc();
                wait_for_outcome(&self.requests, id, rx, timeout).await
            }
            Err(err) => {
                let err = RelayError::from(err);
                warn!(correlation_id = %id, topic = topic, error = %err, "Request send failed");
                self.requests.resolve(id, Err(err.clone()));
                Err(err)
            }
        };
        guard.disarm();

        REQUEST_OUTCOMES
            .with_label_values(&[outcome_label(&outcome)])
            .inc();
        REQUEST_DURATION.observe(started.elapsed().as_secs_f64());
        outcome
    }

    /// Ask the relay for a tunnel to one member of `topic`.
    pub async fn open_tunnel(&self, topic: &str, timeout: Duration) -> RelayResult<Tunnel> {
        let id = self.tunnels.next_id();
        let rx = self.tunnels.register(id, topic, timeout)?;
        let mut guard = CallGuard::new(&self.tunnels, id);

        let frame = Frame::TunnelOpen {
            id,
            topic: topic.to_string(),
        };

        let outcome = match self.sink.send(frame).await {
            Ok(()) => wait_for_outcome(&self.tunnels, id, rx, timeout).await,
            Err(err) => {
                let err = RelayError::from(err);
                self.tunnels.resolve(id, Err(err.clone()));
                Err(err)
            }
        };
        guard.disarm();
        outcome
    }

    /// Resolve the request `id` with the outcome carried by a reply frame.
    ///
    /// Returns false for unknown, expired or duplicate replies.
    pub fn deliver_reply(&self, id: CorrelationId, outcome: ReplyOutcome) -> bool {
        let outcome = match outcome {
            ReplyOutcome::Success(payload) => Ok(payload),
            ReplyOutcome::Failure(message) => Err(RelayError::Remote(message)),
        };
        self.requests.resolve(id, outcome)
    }

    /// Hand an opened tunnel to the caller waiting under `id`.
    ///
    /// Returns false when nobody is waiting any more; the caller should close
    /// the tunnel.
    pub fn deliver_tunnel(&self, id: CorrelationId, tunnel: Tunnel) -> bool {
        self.tunnels.resolve(id, Ok(tunnel))
    }

    /// Resolve every outstanding call with `reason` and refuse new ones.
    pub fn close(&self, reason: RelayError) -> usize {
        let resolved = self.requests.close(reason.clone()) + self.tunnels.close(reason);
        if resolved > 0 {
            debug!(resolved = resolved, "Broker closed with calls outstanding");
        }
        resolved
    }

    /// Outbound requests waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.requests.pending_count()
    }

    /// Tunnel opens waiting for the relay
    pub fn pending_tunnels(&self) -> usize {
        self.tunnels.pending_count()
    }

    pub fn requests(&self) -> &PendingCallTable<Bytes> {
        &self.requests
    }
}

/// Wait for a registered call, cancelling it at the deadline.
async fn wait_for_outcome<T>(
    table: &PendingCallTable<T>,
    id: CorrelationId,
    mut rx: oneshot::Receiver<CallOutcome<T>>,
    timeout: Duration,
) -> CallOutcome<T> {
    match tokio::time::timeout(timeout, &mut rx).await {
        Ok(Ok(outcome)) => outcome,
        // Sender dropped unresolved: only happens if the table itself went away
        Ok(Err(_)) => Err(RelayError::ConnectionClosed),
        Err(_) => {
            if table.cancel(id, RelayError::Timeout(timeout)) {
                Err(RelayError::Timeout(timeout))
            } else {
                // Resolved concurrently with the deadline; its outcome is
                // already on the way.
                rx.await.unwrap_or(Err(RelayError::Timeout(timeout)))
            }
        }
    }
}

/// Removes the call from its table if the caller stops waiting early.
struct CallGuard<'a, T> {
    table: &'a PendingCallTable<T>,
    id: CorrelationId,
    armed: bool,
}

impl<'a, T> CallGuard<'a, T> {
    fn new(table: &'a PendingCallTable<T>, id: CorrelationId) -> Self {
        Self {
            table,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<T> Drop for CallGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed && self.table.discard(self.id) {
            debug!(correlation_id = %self.id, "Caller abandoned pending call");
        }
    }
}

fn outcome_label(outcome: &RelayResult<Bytes>) -> &'static str {
    match outcome {
        Ok(_) => "reply",
        Err(err) => err.kind(),
    }
}

fn duration_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}
