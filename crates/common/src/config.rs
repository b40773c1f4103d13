use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Wire protocol constants
pub mod protocol {
    /// Current protocol version
    pub const VERSION: u32 = 1;

    /// Default UDP port for overlay traffic
    pub const DEFAULT_PORT: u16 = 7748;

    /// Maximum datagram size we will encode or accept
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

    /// Per-step handshake timeout
    pub const HANDSHAKE_STEP_TIMEOUT_SECS: u64 = 5;

    /// Peers unseen for this long are evicted from the directory
    pub const PEER_STALE_SECS: u64 = 300;

    pub fn handshake_step_timeout() -> std::time::Duration {
        std::time::Duration::from_secs(HANDSHAKE_STEP_TIMEOUT_SECS)
    }
}

/// Circuit routing constants
pub mod routing {
    /// Default number of hops in a circuit
    pub const DEFAULT_HOPS: usize = 3;

    /// Minimum number of hops
    ///
    /// WARNING: 1-2 hop circuits provide reduced anonymity
    pub const MIN_HOPS: usize = 1;

    /// Maximum number of hops
    pub const MAX_HOPS: usize = 3;

    /// Overall circuit construction deadline
    pub const BUILD_TIMEOUT_SECS: u64 = 30;

    /// Circuit lifetime before rotation
    pub const CIRCUIT_LIFETIME_SECS: u64 = 600;

    /// Idle time after which an unused circuit is closed
    pub const CIRCUIT_IDLE_SECS: u64 = 120;

    /// Default circuit pool size
    pub const DEFAULT_POOL_SIZE: usize = 4;

    /// Default concurrent sessions per circuit
    pub const SESSIONS_PER_CIRCUIT: usize = 8;
}

/// Health probing constants
pub mod health {
    /// Interval between end-to-end probes
    pub const PROBE_INTERVAL_SECS: u64 = 30;

    /// Window to receive a probe response
    pub const PROBE_TIMEOUT_SECS: u64 = 5;

    /// Consecutive missed probes before a circuit is unhealthy
    pub const MAX_PROBE_FAILURES: u32 = 2;

    /// Rolling latency window size
    pub const LATENCY_WINDOW: usize = 10;
}

/// Tunnel engine configuration
///
/// Owned and persisted by the host; the engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Listen address for overlay traffic
    pub listen_addr: String,

    /// Listen port for overlay traffic
    pub listen_port: u16,

    /// Bootstrap peer addresses ("host:port")
    pub bootstrap_peers: Vec<String>,

    /// Number of hops per circuit (1-3)
    pub hop_count: usize,

    /// Circuit construction timeout in seconds
    pub circuit_timeout_secs: u64,

    /// Maximum circuits kept in the pool
    pub pool_size: usize,

    /// Concurrent relay sessions allowed per circuit
    pub max_sessions_per_circuit: usize,

    /// Allow downgrading to a direct connection when no circuit can
    /// be built. The caller is always informed before the downgrade.
    pub allow_plain_fallback: bool,

    /// Track relayed-vs-consumed bandwidth for fairness
    pub track_contribution: bool,

    /// Whether to relay circuit traffic for other peers
    pub accept_relay: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: protocol::DEFAULT_PORT,
            bootstrap_peers: Vec::new(),
            hop_count: routing::DEFAULT_HOPS,
            circuit_timeout_secs: routing::BUILD_TIMEOUT_SECS,
            pool_size: routing::DEFAULT_POOL_SIZE,
            max_sessions_per_circuit: routing::SESSIONS_PER_CIRCUIT,
            allow_plain_fallback: false,
            track_contribution: true,
            accept_relay: true,
        }
    }
}

impl TunnelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_hop_count(mut self, hops: usize) -> Self {
        self.hop_count = hops;
        self
    }

    pub fn with_bootstrap_peers(mut self, peers: Vec<String>) -> Self {
        self.bootstrap_peers = peers;
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn circuit_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_timeout_secs)
    }

    pub fn handshake_step_timeout(&self) -> Duration {
        Duration::from_secs(protocol::HANDSHAKE_STEP_TIMEOUT_SECS)
    }

    /// Clamp out-of-range values to supported bounds.
    ///
    /// Hop counts above MAX_HOPS are clamped rather than rejected:
    /// existing host configs are known to carry values up to 5.
    pub fn sanitize(mut self) -> Self {
        self.hop_count = self.hop_count.clamp(routing::MIN_HOPS, routing::MAX_HOPS);
        if self.pool_size == 0 {
            self.pool_size = routing::DEFAULT_POOL_SIZE;
        }
        if self.max_sessions_per_circuit == 0 {
            self.max_sessions_per_circuit = routing::SESSIONS_PER_CIRCUIT;
        }
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(config.sanitize())
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TunnelConfig::default();
        assert_eq!(config.hop_count, routing::DEFAULT_HOPS);
        assert_eq!(config.listen_port, protocol::DEFAULT_PORT);
        assert!(!config.allow_plain_fallback);
    }

    #[test]
    fn test_config_builder() {
        let config = TunnelConfig::new()
            .with_port(8080)
            .with_hop_count(2)
            .with_bootstrap_peers(vec!["peer1:7748".to_string()]);

        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.hop_count, 2);
        assert_eq!(config.bootstrap_peers.len(), 1);
    }

    #[test]
    fn test_sanitize_clamps_hop_count() {
        let config = TunnelConfig::new().with_hop_count(5).sanitize();
        assert_eq!(config.hop_count, routing::MAX_HOPS);

        let config = TunnelConfig::new().with_hop_count(0).sanitize();
        assert_eq!(config.hop_count, routing::MIN_HOPS);
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = TunnelConfig::new().with_port(9999);
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: TunnelConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.listen_port, 9999);
    }
}
