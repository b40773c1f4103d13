//! Swarmveil daemon library
//!
//! Runs a standalone tunnel node and exposes its read-only status
//! over a small HTTP API.

pub mod api;

pub use api::ApiServer;
