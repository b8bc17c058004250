//! Worker latency history for dynamic concurrency.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Bounded ring of round-trip latency samples.
///
/// Populated by the status probe when dynamic concurrency is enabled;
/// the dispatcher reads it to decide whether to spawn more workers.
#[derive(Debug)]
pub struct LatencyHistory {
    samples: Mutex<VecDeque<Duration>>,
    capacity: usize,
}

impl LatencyHistory {
    /// Creates a history retaining at most `capacity` samples.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Records one sample, evicting the oldest past capacity.
    pub fn record(&self, latency: Duration) {
        let mut samples = self
            .samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        samples.push_back(latency);
        while samples.len() > self.capacity {
            samples.pop_front();
        }
    }

    /// Returns the samples, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Duration> {
        self.samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Number of retained samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// True if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_snapshot() {
        let history = LatencyHistory::new(4);
        history.record(Duration::from_millis(10));
        history.record(Duration::from_millis(20));

        assert_eq!(
            history.snapshot(),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }

    #[test]
    fn capacity_evicts_oldest() {
        let history = LatencyHistory::new(2);
        history.record(Duration::from_millis(1));
        history.record(Duration::from_millis(2));
        history.record(Duration::from_millis(3));

        assert_eq!(
            history.snapshot(),
            vec![Duration::from_millis(2), Duration::from_millis(3)]
        );
    }

    #[test]
    fn starts_empty() {
        let history = LatencyHistory::new(8);
        assert!(history.is_empty());
        assert!(history.snapshot().is_empty());
    }
}
