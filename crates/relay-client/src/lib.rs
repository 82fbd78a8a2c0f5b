//! # Relay Client
//!
//! Client-side request/reply layer for a clustered messaging relay.
//!
//! ## Responsibilities
//!
//! - Correlate replies arriving on one shared link back to the caller that
//!   issued the matching request, under per-call deadlines
//! - Bound the threads and memory that inbound broadcast and request
//!   handlers of a registered service may use, queueing the excess in order
//! - Tear sessions down exactly once, resolving every outstanding call
//!
//! ## Architecture
//!
//! ```text
//! caller ──request──→ Connection ──→ RequestBroker ──Frame::Request──→ relay
//!                         ↑               │ PendingCallTable
//!                         │               ↓
//! relay ──Frame──→ dispatch loop ──Reply──→ resolve(id)
//!                         │
//!                         └──Request/Broadcast──→ AdmissionController ──→ ServiceHandler
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! let relay = InMemoryRelay::new("memory://relay");
//! let client = RelayClient::new(Arc::new(relay.clone()), ClientConfig::default())?;
//!
//! let service = client.register("memory://relay", "echo", Arc::new(Echo), None).await?;
//! let conn = client.connect("memory://relay").await?;
//! let reply = conn.request("echo", "hello", Duration::from_secs(1)).await?;
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod adapters;
pub mod admission;
pub mod broker;
pub mod client;
pub mod domain;
pub mod ports;
pub mod protocol;
pub mod session;

pub use adapters::InMemoryRelay;
pub use admission::{Admission, AdmissionController, GateSnapshot, TrafficClass};
pub use broker::RequestBroker;
pub use client::RelayClient;
pub use domain::{
    AdmissionLimits, ClientConfig, ConfigError, CorrelationId, GateLimits, RelayError,
    RelayResult, ServiceLimits, SessionState, TransportError, TunnelId,
};
pub use ports::{FrameSink, RelayDialer, RelayLink, ServiceHandler};
pub use protocol::{Frame, ReplyOutcome};
pub use session::{Connection, Service, Tunnel, OVERSIZED_REQUEST};
