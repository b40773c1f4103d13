//! API response types

use serde::{Deserialize, Serialize};

/// Peer directory counts, by handshake state
#[derive(Debug, Serialize, Deserialize)]
pub struct PeersResponse {
    pub total: usize,
    pub discovered: usize,
    pub in_progress: usize,
    pub verified: usize,
    pub lost: usize,
}

/// Circuit counts and traffic totals for circuits we originated
#[derive(Debug, Serialize, Deserialize)]
pub struct CircuitsResponse {
    pub total: usize,
    pub creating: usize,
    pub established: usize,
    pub failed: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,

    /// Circuits this node carries for other peers
    pub relayed: usize,
}

/// Relayed-vs-consumed bandwidth balance
#[derive(Debug, Serialize, Deserialize)]
pub struct ContributionResponse {
    pub relayed_bytes: u64,
    pub consumed_bytes: u64,
    pub ratio: f64,
}

/// Error payload for non-2xx responses
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, status: u16) -> Self {
        Self {
            error: error.into(),
            status,
        }
    }
}
