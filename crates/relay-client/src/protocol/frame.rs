//! Typed frames exchanged between a session and the relay.
//!
//! Byte-level encoding belongs to the transport; frames only carry serde
//! derives so a transport can pick its own codec.

use crate::domain::correlation::{CorrelationId, TunnelId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Every message a session sends to, or receives from, the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Frame {
    // ═══════════════════════════════════════════════════════════════════════
    // SERVICE MEMBERSHIP (session → relay)
    // ═══════════════════════════════════════════════════════════════════════
    /// Join the cluster serving `topic`
    Register { topic: String },
    /// Leave the cluster this session registered with
    Unregister,

    // ═══════════════════════════════════════════════════════════════════════
    // REQUEST / REPLY (both directions)
    // ═══════════════════════════════════════════════════════════════════════
    /// A request. Outbound ids are session-local; inbound ids are relay-assigned.
    Request {
        id: CorrelationId,
        topic: String,
        payload: Bytes,
        timeout_ms: u64,
    },
    /// Result of a request, tagged with the id it answers
    Reply {
        id: CorrelationId,
        outcome: ReplyOutcome,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // BROADCAST (both directions)
    // ═══════════════════════════════════════════════════════════════════════
    Broadcast { topic: String, payload: Bytes },

    // ═══════════════════════════════════════════════════════════════════════
    // TUNNELS
    // ═══════════════════════════════════════════════════════════════════════
    /// Ask the relay for a tunnel to one member of `topic`
    TunnelOpen { id: CorrelationId, topic: String },
    /// Relay → initiator: the tunnel requested under `id` is open
    TunnelOpened { id: CorrelationId, tunnel: TunnelId },
    /// Relay → member: a peer opened a tunnel to this service
    TunnelIncoming { tunnel: TunnelId },
    TunnelData { tunnel: TunnelId, payload: Bytes },
    TunnelClose { tunnel: TunnelId },

    // ═══════════════════════════════════════════════════════════════════════
    // SESSION
    // ═══════════════════════════════════════════════════════════════════════
    /// Session → relay: orderly close
    Close,
    /// Relay → session: the relay dropped this session
    Drop { reason: String },
}

/// Outcome carried by a [`Frame::Reply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyOutcome {
    Success(Bytes),
    /// Failure text reported by the remote handler, verbatim
    Failure(String),
}

impl Frame {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Unregister => "unregister",
            Self::Request { .. } => "request",
            Self::Reply { .. } => "reply",
            Self::Broadcast { .. } => "broadcast",
            Self::TunnelOpen { .. } => "tunnel_open",
            Self::TunnelOpened { .. } => "tunnel_opened",
            Self::TunnelIncoming { .. } => "tunnel_incoming",
            Self::TunnelData { .. } => "tunnel_data",
            Self::TunnelClose { .. } => "tunnel_close",
            Self::Close => "close",
            Self::Drop { .. } => "drop",
        }
    }
}
