//! Client Metrics
//!
//! Lock-free call counters, read through a point-in-time snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated on every call path
#[derive(Debug, Default)]
pub struct ClientMetrics {
    pub calls_started: AtomicU64,
    pub calls_succeeded: AtomicU64,
    /// Calls that returned any error other than timeout or cancellation
    pub calls_failed: AtomicU64,
    pub calls_timed_out: AtomicU64,
    pub calls_cancelled: AtomicU64,
    /// Successful connect + authenticate sequences
    pub connects: AtomicU64,
    /// Inbound frames with no waiting caller
    pub frames_dropped: AtomicU64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Create a snapshot of current counters
    pub fn snapshot(&self) -> ClientMetricsSnapshot {
        ClientMetricsSnapshot {
            calls_started: self.calls_started.load(Ordering::Relaxed),
            calls_succeeded: self.calls_succeeded.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            calls_timed_out: self.calls_timed_out.load(Ordering::Relaxed),
            calls_cancelled: self.calls_cancelled.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of client metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientMetricsSnapshot {
    pub calls_started: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
    pub calls_timed_out: u64,
    pub calls_cancelled: u64,
    pub connects: u64,
    pub frames_dropped: u64,
}

impl ClientMetricsSnapshot {
    /// Calls that have not finished yet
    pub fn in_flight(&self) -> u64 {
        self.calls_started.saturating_sub(
            self.calls_succeeded + self.calls_failed + self.calls_timed_out + self.calls_cancelled,
        )
    }

    /// Fraction of finished calls that succeeded
    pub fn success_ratio(&self) -> f64 {
        let finished = self.calls_started - self.in_flight();
        if finished == 0 {
            0.0
        } else {
            self.calls_succeeded as f64 / finished as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_ratios() {
        let metrics = ClientMetrics::new();
        for _ in 0..4 {
            ClientMetrics::incr(&metrics.calls_started);
        }
        ClientMetrics::incr(&metrics.calls_succeeded);
        ClientMetrics::incr(&metrics.calls_succeeded);
        ClientMetrics::incr(&metrics.calls_timed_out);

        let snap = metrics.snapshot();
        assert_eq!(snap.in_flight(), 1);
        assert!((snap.success_ratio() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = ClientMetrics::new().snapshot();
        assert_eq!(snap.in_flight(), 0);
        assert_eq!(snap.success_ratio(), 0.0);
    }
}
