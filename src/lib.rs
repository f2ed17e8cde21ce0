//! Fleet: provisions proxy subscriptions across independently-run nodes and keeps
//! the central ledger consistent with what each node actually serves.
//!
//! The `fleetctl` binary and the integration tests in `tests/` both drive this crate.

pub mod allocator;
pub mod api;
pub mod cli;
pub mod config;
pub mod credential;
pub mod errors;
pub mod jobs;
pub mod lifecycle;
pub mod models;
pub mod provision;
pub mod remote;
pub mod store;
pub mod sync;
