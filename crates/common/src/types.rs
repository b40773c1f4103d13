use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Timestamp in Unix epoch seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("System time before Unix epoch");
        Self(duration.as_secs())
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn elapsed(&self) -> Duration {
        let now = Self::now();
        Duration::from_secs(now.0.saturating_sub(self.0))
    }
}

/// Bandwidth amount in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bandwidth(pub u64);

impl Bandwidth {
    pub fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn from_mb(mb: u64) -> Self {
        Self(mb * 1024 * 1024)
    }

    pub fn as_bytes(&self) -> u64 {
        self.0
    }

    pub fn as_mb(&self) -> f64 {
        self.0 as f64 / (1024.0 * 1024.0)
    }
}

impl std::fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 < 1024 {
            write!(f, "{} B", self.0)
        } else if self.0 < 1024 * 1024 {
            write!(f, "{:.2} KB", self.0 as f64 / 1024.0)
        } else {
            write!(f, "{:.2} MB", self.as_mb())
        }
    }
}

impl std::ops::Add for Bandwidth {
    type Output = Bandwidth;

    fn add(self, other: Bandwidth) -> Bandwidth {
        Bandwidth(self.0 + other.0)
    }
}

/// Reliability score for a relay peer
///
/// Decremented when a peer fails a handshake step or aborts a circuit
/// build, incremented on successful circuit participation. Used by
/// path selection to prefer dependable relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reliability(pub u32);

impl Reliability {
    pub const MIN: Reliability = Reliability(0);
    pub const MAX: Reliability = Reliability(1000);
    pub const INITIAL: Reliability = Reliability(100);

    pub fn new(score: u32) -> Self {
        Self(score.min(Self::MAX.0))
    }

    pub fn score(&self) -> u32 {
        self.0
    }

    pub fn increase(&mut self, amount: u32) {
        self.0 = self.0.saturating_add(amount).min(Self::MAX.0);
    }

    pub fn decrease(&mut self, amount: u32) {
        self.0 = self.0.saturating_sub(amount);
    }
}

impl std::fmt::Display for Reliability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/1000", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_elapsed() {
        let ts1 = Timestamp::now();
        let ts2 = Timestamp::from_secs(ts1.as_secs() - 10);
        assert!(ts2.elapsed().as_secs() >= 10);
    }

    #[test]
    fn test_bandwidth_conversion() {
        let bw = Bandwidth::from_mb(10);
        assert_eq!(bw.as_bytes(), 10 * 1024 * 1024);
        assert_eq!(bw.as_mb(), 10.0);
    }

    #[test]
    fn test_reliability_bounds() {
        let mut score = Reliability::new(100);
        score.increase(2000);
        assert_eq!(score.score(), Reliability::MAX.0);

        score.decrease(2000);
        assert_eq!(score.score(), 0);
    }
}
