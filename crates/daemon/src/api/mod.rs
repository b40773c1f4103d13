//! Status API
//!
//! Read-only HTTP endpoints for hosts and dashboards: node status,
//! peer directory counts, circuit stats, and the contribution
//! balance. Nothing here mutates the node.

pub mod handlers;
pub mod responses;
pub mod server;

pub use responses::*;
pub use server::ApiServer;
