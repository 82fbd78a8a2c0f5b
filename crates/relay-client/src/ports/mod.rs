//! Ports: the seams to the transport and to registrant-supplied handlers.

pub mod handler;
pub mod transport;

pub use handler::ServiceHandler;
pub use transport::{FrameSink, RelayDialer, RelayLink};
