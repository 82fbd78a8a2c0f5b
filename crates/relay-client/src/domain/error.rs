//! Error types for the relay client.
//!
//! Errors of one request/reply exchange stay local to that call. Only a
//! session teardown resolves calls in bulk (with [`RelayError::ConnectionClosed`]).

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors surfaced to callers of session operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// Transport send or establish failure. Fatal to the call, not the process.
    #[error("connection error: {0}")]
    Connection(String),

    /// The remote handler reported a failure. Displays the message verbatim.
    #[error("{0}")]
    Remote(String),

    /// Deadline elapsed before any reply arrived.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Operation attempted outside the Active session state.
    #[error("not connected")]
    NotConnected,

    /// The call was outstanding when its session was torn down.
    #[error("connection closed")]
    ConnectionClosed,

    /// The relay dropped the session.
    #[error("connection dropped by relay: {0}")]
    Dropped(String),

    /// The service handler refused to initialize.
    #[error("handler initialization failed: {0}")]
    Init(String),

    /// The tunnel was closed by either side.
    #[error("tunnel closed")]
    TunnelClosed,
}

impl RelayError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "transport",
            Self::Remote(_) => "remote_failure",
            Self::Timeout(_) => "timeout",
            Self::NotConnected => "not_connected",
            Self::ConnectionClosed => "closed",
            Self::Dropped(_) => "dropped",
            Self::Init(_) => "init",
            Self::TunnelClosed => "tunnel_closed",
        }
    }
}

/// Errors raised by a transport implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("transport closed")]
    Closed,
    #[error("send failed: {0}")]
    SendFailed(String),
}

impl From<TransportError> for RelayError {
    fn from(err: TransportError) -> Self {
        Self::Connection(err.to_string())
    }
}

/// Invalid client configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    #[error("invalid environment value for {var}: {value}")]
    InvalidEnv { var: String, value: String },
}
