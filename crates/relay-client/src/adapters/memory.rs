//! In-process relay.
//!
//! Implements [`RelayDialer`] over in-memory channels with the routing a
//! relay performs for the client: requests and tunnel opens go round-robin
//! to one member of their topic, broadcasts fan out to every member, and
//! replies travel back to the session that issued the request under that
//! session's own correlation id. Frames are passed as values; nothing is
//! encoded.

use crate::domain::correlation::{CorrelationId, IdSequence, TunnelId};
use crate::domain::error::TransportError;
use crate::ports::{FrameSink, RelayDialer, RelayLink};
use crate::protocol::Frame;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type PeerId = u64;

/// Where a forwarded request came from.
struct Route {
    origin: PeerId,
    origin_id: CorrelationId,
    /// `None` when the request's timeout is too large to represent
    expires: Option<Instant>,
}

#[derive(Default)]
struct RelayState {
    peers: HashMap<PeerId, mpsc::UnboundedSender<Frame>>,
    membership: HashMap<PeerId, String>,
    topics: HashMap<String, Vec<PeerId>>,
    cursors: HashMap<String, usize>,
    routes: HashMap<CorrelationId, Route>,
    tunnels: HashMap<TunnelId, (PeerId, PeerId)>,
}

impl RelayState {
    /// Next member of `topic`, round-robin.
    fn pick(&mut self, topic: &str) -> Option<PeerId> {
        let members = self.topics.get(topic).filter(|m| !m.is_empty())?;
        let cursor = self.cursors.entry(topic.to_string()).or_insert(0);
        let member = members[*cursor % members.len()];
        *cursor = cursor.wrapping_add(1);
        Some(member)
    }

    fn deliver(&self, peer: PeerId, frame: Frame) -> bool {
        self.peers
            .get(&peer)
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    fn leave(&mut self, peer: PeerId) {
        if let Some(topic) = self.membership.remove(&peer) {
            if let Some(members) = self.topics.get_mut(&topic) {
                members.retain(|m| *m != peer);
            }
        }
    }
}

struct RelayCore {
    state: Mutex<RelayState>,
    next_peer: AtomicU64,
    route_ids: IdSequence,
    next_tunnel: AtomicU64,
    frames_routed: AtomicU64,
}

impl RelayCore {
    fn attach(self: &Arc<Self>) -> RelayLink {
        let peer = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().peers.insert(peer, tx);
        debug!(peer = peer, "Peer attached to in-memory relay");

        RelayLink {
            sink: Arc::new(PeerSink {
                peer,
                core: Arc::clone(self),
                closed: AtomicBool::new(false),
            }),
            inbound: rx,
        }
    }

    fn detach(&self, peer: PeerId) {
        let mut state = self.state.lock();
        if state.peers.remove(&peer).is_none() {
            return;
        }
        state.leave(peer);

        let orphaned: Vec<_> = state
            .tunnels
            .iter()
            .filter(|(_, (a, b))| *a == peer || *b == peer)
            .map(|(id, ends)| (*id, *ends))
            .collect();
        for (tunnel, (a, b)) in orphaned {
            state.tunnels.remove(&tunnel);
            let other = if a == peer { b } else { a };
            state.deliver(other, Frame::TunnelClose { tunnel });
        }
        debug!(peer = peer, "Peer detached from in-memory relay");
    }

    fn route(&self, peer: PeerId, frame: Frame) {
        self.frames_routed.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();

        match frame {
            Frame::Register { topic } => {
                state.leave(peer);
                state.topics.entry(topic.clone()).or_default().push(peer);
                state.membership.insert(peer, topic);
            }
            Frame::Unregister => state.leave(peer),
            Frame::Request {
                id,
                topic,
                payload,
                timeout_ms,
            } => {
                let now = Instant::now();
                state.routes
                    .retain(|_, route| route.expires.map_or(true, |expires| expires > now));

                let Some(member) = state.pick(&topic) else {
                    debug!(topic = %topic, "No members for request topic, dropping");
                    return;
                };
                let relay_id = self.route_ids.next();
                state.routes.insert(
                    relay_id,
                    Route {
                        origin: peer,
                        origin_id: id,
                        expires: now.checked_add(Duration::from_millis(timeout_ms)),
                    },
                );
                let forwarded = Frame::Request {
                    id: relay_id,
                    topic,
                    payload,
                    timeout_ms,
                };
                if !state.deliver(member, forwarded) {
                    state.routes.remove(&relay_id);
                }
            }
            Frame::Reply { id, outcome } => match state.routes.remove(&id) {
                Some(route) => {
                    state.deliver(
                        route.origin,
                        Frame::Reply {
                            id: route.origin_id,
                            outcome,
                        },
                    );
                }
                None => debug!(correlation_id = %id, "Reply for expired route"),
            },
            Frame::Broadcast { topic, payload } => {
                let members = state.topics.get(&topic).cloned().unwrap_or_default();
                for member in members {
                    state.deliver(
                        member,
                        Frame::Broadcast {
                            topic: topic.clone(),
                            payload: payload.clone(),
                        },
                    );
                }
            }
            Frame::TunnelOpen { id, topic } => {
                let Some(member) = state.pick(&topic) else {
                    debug!(topic = %topic, "No members for tunnel topic, dropping");
                    return;
                };
                let tunnel = TunnelId::from_raw(self.next_tunnel.fetch_add(1, Ordering::Relaxed));
                state.tunnels.insert(tunnel, (peer, member));
                // Member first, so it is routing the tunnel before any data arrives
                state.deliver(member, Frame::TunnelIncoming { tunnel });
                state.deliver(peer, Frame::TunnelOpened { id, tunnel });
            }
            Frame::TunnelData { tunnel, payload } => {
                match state.tunnels.get(&tunnel).copied() {
                    Some((a, b)) => {
                        let other = if a == peer { b } else { a };
                        state.deliver(other, Frame::TunnelData { tunnel, payload });
                    }
                    None => debug!(tunnel = %tunnel, "Data for closed tunnel"),
                }
            }
            Frame::TunnelClose { tunnel } => {
                if let Some((a, b)) = state.tunnels.remove(&tunnel) {
                    let other = if a == peer { b } else { a };
                    state.deliver(other, Frame::TunnelClose { tunnel });
                }
            }
            Frame::Close => {
                drop(state);
                self.detach(peer);
            }
            other => warn!(peer = peer, kind = other.kind(), "Client sent a relay-only frame"),
        }
    }
}

/// Sending half handed to one attached session.
struct PeerSink {
    peer: PeerId,
    core: Arc<RelayCore>,
    closed: AtomicBool,
}

#[async_trait]
impl FrameSink for PeerSink {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.core.route(self.peer, frame);
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.core.detach(self.peer);
        }
    }
}

/// Relay living inside the current process, reachable at one address.
#[derive(Clone)]
pub struct InMemoryRelay {
    address: String,
    core: Arc<RelayCore>,
}

impl InMemoryRelay {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            core: Arc::new(RelayCore {
                state: Mutex::new(RelayState::default()),
                next_peer: AtomicU64::new(0),
                route_ids: IdSequence::new(),
                next_tunnel: AtomicU64::new(0),
                frames_routed: AtomicU64::new(0),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sessions currently attached
    pub fn peer_count(&self) -> usize {
        self.core.state.lock().peers.len()
    }

    /// Registered members of `topic`
    pub fn members(&self, topic: &str) -> usize {
        self.core
            .state
            .lock()
            .topics
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Requests forwarded to a member and not yet answered or expired
    pub fn open_routes(&self) -> usize {
        self.core.state.lock().routes.len()
    }

    /// Total frames received from sessions
    pub fn frames_routed(&self) -> u64 {
        self.core.frames_routed.load(Ordering::Relaxed)
    }

    /// Drop every attached session with `reason`.
    pub fn disconnect_all(&self, reason: &str) {
        let mut state = self.core.state.lock();
        for tx in state.peers.values() {
            let _ = tx.send(Frame::Drop {
                reason: reason.to_string(),
            });
        }
        let dropped = state.peers.len();
        *state = RelayState::default();
        warn!(peers = dropped, reason = reason, "In-memory relay dropped all sessions");
    }
}

#[async_trait]
impl RelayDialer for InMemoryRelay {
    async fn dial(&self, address: &str) -> Result<RelayLink, TransportError> {
        if address != self.address {
            return Err(TransportError::Refused(address.to_string()));
        }
        Ok(self.core.attach())
    }
}
