//! Time-bucketed rolling window of call outcomes

use std::time::Duration;

use tokio::time::Instant;

/// Aggregated counts over the live part of the window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCounts {
    pub successes: u64,
    pub failures: u64,
}

impl WindowCounts {
    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }

    /// Failure ratio in percent, 0 for an empty window
    pub fn failure_percentage(&self) -> u64 {
        match self.total() {
            0 => 0,
            total => self.failures * 100 / total,
        }
    }

    /// Whether the failure ratio is strictly above `threshold` percent.
    /// Compared in integers without rounding.
    pub fn exceeds(&self, threshold: u32) -> bool {
        self.total() > 0 && self.failures * 100 > threshold as u64 * self.total()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    epoch: u64,
    successes: u64,
    failures: u64,
}

/// Ring of fixed-width buckets; a bucket is recycled when its epoch comes round again
#[derive(Debug)]
pub struct RollingWindow {
    buckets: Vec<Bucket>,
    bucket_width_ms: u64,
    origin: Instant,
}

impl RollingWindow {
    pub fn new(window: Duration, bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        let bucket_width_ms = (window.as_millis() as u64 / bucket_count as u64).max(1);
        Self {
            buckets: vec![Bucket::default(); bucket_count],
            bucket_width_ms,
            origin: Instant::now(),
        }
    }

    fn epoch(&self, now: Instant) -> u64 {
        // Epochs start at 1 so a zeroed bucket is never mistaken for a live one
        now.saturating_duration_since(self.origin).as_millis() as u64 / self.bucket_width_ms + 1
    }

    fn bucket_mut(&mut self, now: Instant) -> &mut Bucket {
        let epoch = self.epoch(now);
        let slot = (epoch % self.buckets.len() as u64) as usize;
        let bucket = &mut self.buckets[slot];
        if bucket.epoch != epoch {
            *bucket = Bucket {
                epoch,
                ..Bucket::default()
            };
        }
        bucket
    }

    pub fn record_success(&mut self, now: Instant) {
        self.bucket_mut(now).successes += 1;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.bucket_mut(now).failures += 1;
    }

    pub fn counts(&self, now: Instant) -> WindowCounts {
        let current = self.epoch(now);
        let span = self.buckets.len() as u64;

        self.buckets
            .iter()
            .filter(|b| b.epoch != 0 && b.epoch <= current && current - b.epoch < span)
            .fold(WindowCounts::default(), |acc, b| WindowCounts {
                successes: acc.successes + b.successes,
                failures: acc.failures + b.failures,
            })
    }

    pub fn reset(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = Bucket::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_percentage() {
        let mut window = RollingWindow::new(Duration::from_secs(10), 10);
        let now = Instant::now();
        window.record_success(now);
        window.record_failure(now);
        window.record_failure(now);

        let counts = window.counts(now);
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.failures, 2);
        assert_eq!(counts.failure_percentage(), 66);
        // 66.7% is above 66 even though the rounded percentage is not
        assert!(counts.exceeds(66));
        assert!(!counts.exceeds(67));

        window.reset();
        assert_eq!(window.counts(now), WindowCounts::default());
        assert_eq!(WindowCounts::default().failure_percentage(), 0);
        assert!(!WindowCounts::default().exceeds(0));
    }

    #[test]
    fn test_old_buckets_expire() {
        let mut window = RollingWindow::new(Duration::from_millis(1000), 10);
        let start = Instant::now();
        window.record_failure(start);
        window.record_failure(start + Duration::from_millis(500));

        assert_eq!(window.counts(start + Duration::from_millis(900)).failures, 2);
        // First sample has rolled out, the second is still live
        assert_eq!(window.counts(start + Duration::from_millis(1300)).failures, 1);
        assert_eq!(window.counts(start + Duration::from_millis(2000)).total(), 0);
    }

    #[test]
    fn test_bucket_recycled_on_wrap() {
        let mut window = RollingWindow::new(Duration::from_millis(100), 2);
        let start = Instant::now();
        window.record_failure(start);
        // Same slot, two windows later
        window.record_success(start + Duration::from_millis(100));
        let counts = window.counts(start + Duration::from_millis(100));
        assert_eq!(counts.failures, 0);
        assert_eq!(counts.successes, 1);
    }
}
