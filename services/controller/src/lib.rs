//! mlplane status controller library.
//!
//! This crate ships the `status-controller` binary; the library surface
//! exists for integration testing and reuse.

pub mod bus;
pub mod cluster_state;
pub mod committer;
pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod manifest;
pub mod retry;
pub mod retry_poller;
pub mod state;
pub mod store;
pub mod worker;
