//! Domain types for the relay client.
//!
//! Configuration, limits, errors, correlation ids, the pending-call table
//! and the session state machine.

pub mod config;
pub mod correlation;
pub mod error;
pub mod limits;
pub mod pending;
pub mod state;

// Re-exports for convenience
pub use config::ClientConfig;
pub use correlation::{CorrelationId, IdSequence, TunnelId};
pub use error::{ConfigError, RelayError, RelayResult, TransportError};
pub use limits::{AdmissionLimits, GateLimits, ServiceLimits, DEFAULT_MEMORY_LIMIT};
pub use pending::{CallOutcome, PendingCallTable, PendingStats};
pub use state::{SessionState, StateCell};
