use thiserror::Error;

/// Common error types for the tunnel engine
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Malformed wire message. Recovered locally: the message is
    /// dropped and dispatch continues.
    #[error("Malformed message: {0}")]
    Format(String),

    /// A handshake step did not complete within its window.
    /// The peer transitions to Lost.
    #[error("Handshake with {peer} timed out during {step}")]
    HandshakeTimeout { peer: String, step: &'static str },

    /// Circuit construction failed; all partial state was discarded.
    #[error("Circuit establishment failed: {0}")]
    CircuitEstablishment(String),

    /// The pool could not produce a circuit within the wait budget.
    /// Caller-visible and retryable.
    #[error("No circuit available: {0}")]
    CircuitUnavailable(String),

    /// A circuit failed its health checks and is being evicted.
    /// Not surfaced to data-plane callers.
    #[error("Circuit {0} is unhealthy")]
    CircuitUnhealthy(u32),

    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Connection timeout")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn establishment(msg: impl Into<String>) -> Self {
        Self::CircuitEstablishment(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::CircuitUnavailable(msg.into())
    }

    /// Whether the caller may usefully retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CircuitUnavailable(_) | Self::CircuitEstablishment(_) | Self::Timeout
        )
    }
}
