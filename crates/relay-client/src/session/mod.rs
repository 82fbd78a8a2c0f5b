//! Connection sessions.
//!
//! A [`Connection`] is a cheap, clonable handle to one attachment to the
//! relay. Each session runs a single dispatch task that reads inbound frames
//! in order and routes them: replies to the broker, requests and broadcasts
//! through the admission gates, tunnel traffic to the tunnel registry. The
//! dispatch task never awaits a handler body.
//!
//! Teardown runs once, on its own task, whoever triggers it (local close,
//! relay drop, or the inbound stream ending).

mod service;
pub(crate) mod tunnel;

pub use service::Service;
pub use tunnel::Tunnel;

use crate::admission::{Admission, AdmissionController, GateSnapshot, TrafficClass};
use crate::broker::RequestBroker;
use crate::domain::correlation::{CorrelationId, TunnelId};
use crate::domain::error::{RelayError, RelayResult};
use crate::domain::limits::AdmissionLimits;
use crate::domain::state::{SessionState, StateCell};
use crate::ports::{FrameSink, RelayLink, ServiceHandler};
use crate::protocol::{Frame, ReplyOutcome};
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use relay_telemetry::log_session_event;
use relay_telemetry::metrics::{HANDLER_FAILURES, INBOUND_UNITS, SESSION_EVENTS};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use tunnel::TunnelRegistry;

/// Failure text sent back for a request that can never fit the memory allowance.
pub const OVERSIZED_REQUEST: &str = "request exceeds service memory allowance";

tokio::task_local! {
    /// Set while `handle_drop` runs, so a close from inside it does not wait on itself.
    static IN_TEARDOWN: ();
}

/// Handler bound to a session by a service registration.
struct ServiceBinding {
    topic: String,
    handler: Arc<dyn ServiceHandler>,
    admission: Arc<AdmissionController>,
}

struct Session {
    address: String,
    state: StateCell,
    sink: Arc<dyn FrameSink>,
    broker: RequestBroker,
    tunnels: Arc<TunnelRegistry>,
    binding: Mutex<Option<ServiceBinding>>,
    runtime: Handle,
    stop: watch::Sender<bool>,
    closed: watch::Sender<bool>,
}

/// Handle to a relay session.
#[derive(Clone)]
pub struct Connection {
    session: Arc<Session>,
}

impl Connection {
    /// Activate a freshly dialed link and start its dispatch task.
    pub(crate) fn establish(address: &str, link: RelayLink, runtime: Handle) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let (closed, _) = watch::channel(false);

        let session = Arc::new(Session {
            address: address.to_string(),
            state: StateCell::new(),
            broker: RequestBroker::new(link.sink.clone()),
            sink: link.sink,
            tunnels: Arc::new(TunnelRegistry::new()),
            binding: Mutex::new(None),
            runtime: runtime.clone(),
            stop,
            closed,
        });
        session.state.activate();

        runtime.spawn(dispatch_loop(Arc::clone(&session), link.inbound, stop_rx));

        SESSION_EVENTS.with_label_values(&["connected"]).inc();
        log_session_event!(info, "Relay session established", address);

        Self { session }
    }

    /// Relay address this session is attached to
    pub fn address(&self) -> &str {
        &self.session.address
    }

    pub fn state(&self) -> SessionState {
        self.session.state.get()
    }

    /// Send a request to one member of `topic` and wait for its reply.
    ///
    /// A handler failure comes back as [`RelayError::Remote`] carrying the
    /// handler's message verbatim.
    pub async fn request(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> RelayResult<Bytes> {
        self.ensure_active()?;
        self.session
            .broker
            .request(topic, payload.into(), timeout)
            .await
    }

    /// Send a message to every member of `topic`.
    pub async fn broadcast(&self, topic: &str, payload: impl Into<Bytes>) -> RelayResult<()> {
        self.ensure_active()?;
        self.session
            .sink
            .send(Frame::Broadcast {
                topic: topic.to_string(),
                payload: payload.into(),
            })
            .await?;
        Ok(())
    }

    /// Open a tunnel to one member of `topic`.
    pub async fn open_tunnel(&self, topic: &str, timeout: Duration) -> RelayResult<Tunnel> {
        self.ensure_active()?;
        self.session.broker.open_tunnel(topic, timeout).await
    }

    /// Tear the session down and wait for teardown to finish.
    ///
    /// Every outstanding call resolves with [`RelayError::ConnectionClosed`].
    /// Calling it again, or after the relay dropped the session, is a no-op.
    pub async fn close(&self) -> RelayResult<()> {
        self.session
            .begin_teardown(RelayError::ConnectionClosed, true);
        self.session.wait_closed().await;
        Ok(())
    }

    /// Outbound requests still waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.session.broker.pending_requests()
    }

    /// Admission state of the bound service, if any.
    pub fn admission_snapshot(&self, class: TrafficClass) -> Option<GateSnapshot> {
        self.session
            .binding
            .lock()
            .as_ref()
            .map(|binding| binding.admission.snapshot(class))
    }

    /// Route inbound traffic to `handler` from now on.
    pub(crate) fn bind_service(
        &self,
        topic: &str,
        handler: Arc<dyn ServiceHandler>,
        limits: AdmissionLimits,
    ) {
        let admission = Arc::new(AdmissionController::new(
            limits,
            self.session.runtime.clone(),
        ));
        *self.session.binding.lock() = Some(ServiceBinding {
            topic: topic.to_string(),
            handler,
            admission,
        });
    }

    pub(crate) async fn send(&self, frame: Frame) -> RelayResult<()> {
        self.session.sink.send(frame).await?;
        Ok(())
    }

    fn ensure_active(&self) -> RelayResult<()> {
        if self.session.state.is_active() {
            Ok(())
        } else {
            Err(RelayError::NotConnected)
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.session.address)
            .field("state", &self.session.state.get())
            .finish()
    }
}

impl Session {
    fn bound(&self) -> Option<(Arc<dyn ServiceHandler>, Arc<AdmissionController>)> {
        self.binding
            .lock()
            .as_ref()
            .map(|b| (Arc::clone(&b.handler), Arc::clone(&b.admission)))
    }

    async fn route(&self, frame: Frame) {
        match frame {
            Frame::Reply { id, outcome } => {
                if !self.broker.deliver_reply(id, outcome) {
                    debug!(correlation_id = %id, "Dropping reply with no pending call");
                }
            }
            Frame::Request {
                id,
                topic,
                payload,
                timeout_ms,
            } => self.dispatch_request(id, &topic, payload, timeout_ms).await,
            Frame::Broadcast { topic, payload } => self.dispatch_broadcast(&topic, payload),
            Frame::TunnelOpened { id, tunnel } => {
                let local = Tunnel::attach(tunnel, Arc::clone(&self.sink), Arc::clone(&self.tunnels));
                if !self.broker.deliver_tunnel(id, local) {
                    debug!(tunnel = %tunnel, "Tunnel opened after its caller gave up");
                    self.refuse_tunnel(tunnel).await;
                }
            }
            Frame::TunnelIncoming { tunnel } => self.dispatch_tunnel(tunnel).await,
            Frame::TunnelData { tunnel, payload } => match self.tunnels.get(&tunnel) {
                Some(route) => {
                    let _ = route.send(payload);
                }
                None => debug!(tunnel = %tunnel, "Data for unknown tunnel"),
            },
            Frame::TunnelClose { tunnel } => {
                self.tunnels.remove(&tunnel);
            }
            other => warn!(kind = other.kind(), "Unexpected frame from relay"),
        }
    }

    async fn dispatch_request(&self, id: CorrelationId, topic: &str, payload: Bytes, timeout_ms: u64) {
        let Some((handler, admission)) = self.bound() else {
            warn!(correlation_id = %id, topic = topic, "Request for a session with no service, dropping");
            return;
        };

        let arrived = Instant::now();
        let size = payload.len();
        let sink = Arc::clone(&self.sink);
        let job = async move {
            if timeout_ms > 0 && arrived.elapsed() > Duration::from_millis(timeout_ms) {
                INBOUND_UNITS
                    .with_label_values(&[TrafficClass::Request.as_str(), "expired"])
                    .inc();
                debug!(correlation_id = %id, "Request expired while queued, skipping");
                return;
            }

            let outcome = match catch_panic(handler.handle_request(payload)).await {
                Ok(Ok(reply)) => ReplyOutcome::Success(reply),
                Ok(Err(err)) => {
                    HANDLER_FAILURES
                        .with_label_values(&[TrafficClass::Request.as_str(), "error"])
                        .inc();
                    ReplyOutcome::Failure(err.to_string())
                }
                Err(message) => {
                    HANDLER_FAILURES
                        .with_label_values(&[TrafficClass::Request.as_str(), "panic"])
                        .inc();
                    warn!(correlation_id = %id, panic = %message, "Request handler panicked");
                    ReplyOutcome::Failure(message)
                }
            };

            if let Err(err) = sink.send(Frame::Reply { id, outcome }).await {
                debug!(correlation_id = %id, error = %err, "Failed to send reply");
            }
        }
        .boxed();

        if admission.submit(TrafficClass::Request, size, job) == Admission::Rejected {
            let reply = Frame::Reply {
                id,
                outcome: ReplyOutcome::Failure(OVERSIZED_REQUEST.to_string()),
            };
            if let Err(err) = self.sink.send(reply).await {
                debug!(correlation_id = %id, error = %err, "Failed to send rejection");
            }
        }
    }

    fn dispatch_broadcast(&self, topic: &str, payload: Bytes) {
        let Some((handler, admission)) = self.bound() else {
            warn!(topic = topic, "Broadcast for a session with no service, dropping");
            return;
        };

        let size = payload.len();
        let job = async move {
            if let Err(message) = catch_panic(handler.handle_broadcast(payload)).await {
                HANDLER_FAILURES
                    .with_label_values(&[TrafficClass::Broadcast.as_str(), "panic"])
                    .inc();
                warn!(panic = %message, "Broadcast handler panicked");
            }
        }
        .boxed();

        if admission.submit(TrafficClass::Broadcast, size, job) == Admission::Rejected {
            warn!(topic = topic, size = size, "Broadcast discarded");
        }
    }

    async fn dispatch_tunnel(&self, tunnel: TunnelId) {
        let Some((handler, _)) = self.bound() else {
            debug!(tunnel = %tunnel, "Inbound tunnel for a session with no service");
            self.refuse_tunnel(tunnel).await;
            return;
        };

        let local = Tunnel::attach(tunnel, Arc::clone(&self.sink), Arc::clone(&self.tunnels));
        self.runtime.spawn(async move {
            if let Err(message) = catch_panic(handler.handle_tunnel(local)).await {
                warn!(tunnel = %tunnel, panic = %message, "Tunnel handler panicked");
            }
        });
    }

    async fn refuse_tunnel(&self, tunnel: TunnelId) {
        self.tunnels.remove(&tunnel);
        if let Err(err) = self.sink.send(Frame::TunnelClose { tunnel }).await {
            debug!(tunnel = %tunnel, error = %err, "Failed to close tunnel");
        }
    }

    /// Start teardown. Returns false if it already started.
    fn begin_teardown(self: &Arc<Self>, reason: RelayError, local: bool) -> bool {
        if !self.state.begin_close() {
            return false;
        }
        let session = Arc::clone(self);
        self.runtime.spawn(session.teardown(reason, local));
        true
    }

    async fn teardown(self: Arc<Self>, reason: RelayError, local: bool) {
        self.stop.send_replace(true);
        let binding = self.binding.lock().take();

        if local {
            if binding.is_some() {
                if let Err(err) = self.sink.send(Frame::Unregister).await {
                    debug!(error = %err, "Failed to unregister service");
                }
            }
            if let Err(err) = self.sink.send(Frame::Close).await {
                debug!(error = %err, "Failed to send close");
            }
        }
        self.sink.close().await;

        let resolved = self.broker.close(RelayError::ConnectionClosed);
        self.tunnels.clear();

        if let Some(binding) = binding {
            let aborted = binding.admission.shutdown();
            binding.admission.wait_idle().await;
            debug!(topic = %binding.topic, aborted = aborted, "Service handlers stopped");

            let handler = binding.handler;
            let dropped = IN_TEARDOWN.scope((), handler.handle_drop(reason.clone()));
            if let Err(message) = catch_panic(dropped).await {
                warn!(topic = %binding.topic, panic = %message, "Drop handler panicked");
            }
        }

        self.state.finish_close();
        let event = if local { "closed" } else { "dropped" };
        SESSION_EVENTS.with_label_values(&[event]).inc();
        log_session_event!(
            info,
            "Relay session closed",
            self.address,
            reason = %reason,
            resolved_calls = resolved
        );
        self.closed.send_replace(true);
    }

    async fn wait_closed(&self) {
        if IN_TEARDOWN.try_with(|_| ()).is_ok() {
            return;
        }
        let mut closed = self.closed.subscribe();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn dispatch_loop(
    session: Arc<Session>,
    mut inbound: mpsc::UnboundedReceiver<Frame>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            frame = inbound.recv() => match frame {
                Some(Frame::Drop { reason }) => {
                    log_session_event!(warn, "Relay dropped session", session.address, reason = %reason);
                    session.begin_teardown(RelayError::Dropped(reason), false);
                    break;
                }
                Some(frame) => session.route(frame).await,
                None => {
                    if session.state.is_active() {
                        log_session_event!(warn, "Relay link lost", session.address);
                        session.begin_teardown(RelayError::Dropped("relay link lost".into()), false);
                    }
                    break;
                }
            },
        }
    }
    debug!(address = %session.address, "Dispatch loop stopped");
}

/// Run `fut`, turning a panic into its message.
async fn catch_panic<F: Future>(fut: F) -> Result<F::Output, String> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
