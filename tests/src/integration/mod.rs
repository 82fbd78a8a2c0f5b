//! End-to-end tests against the in-process relay.

pub mod reqrep;
pub mod teardown;
