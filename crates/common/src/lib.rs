pub mod config;
pub mod error;
pub mod types;

pub use config::{health, protocol, routing, ConfigError, TunnelConfig};
pub use error::{Result, TunnelError};
pub use types::{Bandwidth, Reliability, Timestamp};
