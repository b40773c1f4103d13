//! Contribution accounting
//!
//! The overlay only works if nodes relay roughly as much as they
//! consume. The tracker keeps both counters so the host can surface
//! the balance and nudge configuration.

use std::sync::atomic::{AtomicU64, Ordering};
use swarmveil_common::Bandwidth;

/// Counts bytes relayed for others against bytes consumed through
/// others' relays
///
/// Counters are monotonic for the process lifetime and safe to bump
/// from any task. When disabled the recorders are no-ops.
pub struct ContributionTracker {
    enabled: bool,
    relayed: AtomicU64,
    consumed: AtomicU64,
}

impl ContributionTracker {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            relayed: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
        }
    }

    pub fn record_relayed(&self, bytes: u64) {
        if self.enabled {
            self.relayed.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn record_consumed(&self, bytes: u64) {
        if self.enabled {
            self.consumed.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn relayed(&self) -> Bandwidth {
        Bandwidth::from_bytes(self.relayed.load(Ordering::Relaxed))
    }

    pub fn consumed(&self) -> Bandwidth {
        Bandwidth::from_bytes(self.consumed.load(Ordering::Relaxed))
    }

    /// Relayed-to-consumed ratio. A node that has consumed nothing
    /// reports 1.0, the neutral balance.
    pub fn ratio(&self) -> f64 {
        let consumed = self.consumed.load(Ordering::Relaxed);
        if consumed == 0 {
            return 1.0;
        }
        self.relayed.load(Ordering::Relaxed) as f64 / consumed as f64
    }

    pub fn snapshot(&self) -> ContributionSnapshot {
        ContributionSnapshot {
            relayed: self.relayed(),
            consumed: self.consumed(),
            ratio: self.ratio(),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ContributionSnapshot {
    pub relayed: Bandwidth,
    pub consumed: Bandwidth,
    pub ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let tracker = ContributionTracker::new(true);
        tracker.record_relayed(1024);
        tracker.record_relayed(1024);
        tracker.record_consumed(512);

        assert_eq!(tracker.relayed().as_bytes(), 2048);
        assert_eq!(tracker.consumed().as_bytes(), 512);
        assert_eq!(tracker.ratio(), 4.0);
    }

    #[test]
    fn test_zero_consumption_is_neutral() {
        let tracker = ContributionTracker::new(true);
        tracker.record_relayed(100);
        assert_eq!(tracker.ratio(), 1.0);
    }

    #[test]
    fn test_disabled_tracker_records_nothing() {
        let tracker = ContributionTracker::new(false);
        tracker.record_relayed(100);
        tracker.record_consumed(100);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.relayed.as_bytes(), 0);
        assert_eq!(snapshot.consumed.as_bytes(), 0);
    }
}
