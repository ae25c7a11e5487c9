//! Throughput logging for long-running counting passes.
//!
//! Workers share one [`ProgressTracker`] and add their per-chunk read counts
//! to it; the tracker logs a line with the running rate whenever the total
//! crosses an interval boundary. Purely observational: nothing in the run
//! depends on these messages.

use log::info;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Default number of reads between progress lines.
const DEFAULT_INTERVAL: u64 = 1_000_000;

/// Thread-safe read counter that logs throughput at interval boundaries.
pub struct ProgressTracker {
    message: String,
    interval: u64,
    count: AtomicU64,
    started: Instant,
}

impl ProgressTracker {
    /// Creates a tracker with the given message prefix, starting its clock
    /// immediately.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            interval: DEFAULT_INTERVAL,
            count: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Sets the interval between progress lines.
    #[must_use]
    pub fn with_interval(mut self, interval: u64) -> Self {
        self.interval = interval.max(1);
        self
    }

    /// Adds `additional` processed reads, logging once per interval boundary
    /// crossed. Safe to call from multiple threads.
    pub fn add(&self, additional: u64) {
        if additional == 0 {
            return;
        }
        let previous = self.count.fetch_add(additional, Ordering::Relaxed);
        let current = previous + additional;
        for crossed in (previous / self.interval + 1)..=(current / self.interval) {
            let milestone = crossed * self.interval;
            info!("{} {milestone} ({})", self.message, self.rate(milestone));
        }
    }

    /// Logs the final total and overall rate.
    pub fn log_final(&self) {
        let count = self.count.load(Ordering::Relaxed);
        info!("{} {count} total ({})", self.message, self.rate(count));
    }

    /// Reads counted so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn rate(&self, count: u64) -> String {
        let secs = self.started.elapsed().as_secs_f64();
        if secs < 1e-3 {
            return "-- reads/s".to_string();
        }
        format!("{:.0} reads/s", count as f64 / secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_accumulate() {
        let tracker = ProgressTracker::new("Processed reads").with_interval(10);
        tracker.add(4);
        tracker.add(0);
        tracker.add(21);
        assert_eq!(tracker.count(), 25);
        tracker.log_final();
    }

    #[test]
    fn test_interval_is_never_zero() {
        let tracker = ProgressTracker::new("Processed reads").with_interval(0);
        tracker.add(100);
        assert_eq!(tracker.count(), 100);
    }

    #[test]
    fn test_concurrent_adds() {
        use std::sync::Arc;
        use std::thread;

        let tracker = Arc::new(ProgressTracker::new("Processed reads").with_interval(50));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = Arc::clone(&tracker);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    tracker.add(1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.count(), 800);
    }
}
