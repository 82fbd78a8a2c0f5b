//! Messages exchanged with the relay.

pub mod frame;

pub use frame::{Frame, ReplyOutcome};
