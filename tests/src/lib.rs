//! # Relay Client Test Suite
//!
//! Cross-component tests that run real sessions against the in-process
//! relay.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── fixtures.rs       # Shared handlers and setup
//! └── integration/      # End-to-end behaviour
//!     ├── reqrep.rs     # Correlation, failures, timeouts
//!     ├── admission.rs  # Thread and memory limits
//!     ├── teardown.rs   # Close, unregister, relay drop
//!     └── streams.rs    # Broadcasts and tunnels
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p relay-tests
//! cargo test -p relay-tests integration::admission::
//!
//! # Benchmarks
//! cargo bench -p relay-tests
//! ```

#![allow(dead_code)]

pub mod fixtures;
pub mod integration;
