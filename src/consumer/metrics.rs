//! Dispatch metrics collection

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_SAMPLES: usize = 1000;

/// Counters and timing samples shared by every worker of a supervisor
#[derive(Debug, Clone)]
pub struct ConsumerMetrics {
    /// Messages received from the transport
    pub messages_consumed: Arc<AtomicU64>,
    /// Messages a handler accepted
    pub messages_processed: Arc<AtomicU64>,
    /// Messages a handler failed on
    pub messages_failed: Arc<AtomicU64>,
    /// Messages that could not be decoded
    pub messages_undecodable: Arc<AtomicU64>,
    /// Messages forwarded to a dead-letter topic
    pub messages_dead_lettered: Arc<AtomicU64>,
    /// Batches handed to handlers
    pub batches: Arc<AtomicU64>,
    /// Successful commits
    pub commits: Arc<AtomicU64>,
    /// Worker restarts performed by the supervisor
    pub restarts: Arc<AtomicU64>,
    /// Rebalance events observed
    pub rebalances: Arc<AtomicU64>,
    batch_durations: Arc<RwLock<Vec<Duration>>>,
    commit_durations: Arc<RwLock<Vec<Duration>>>,
    error_counts: Arc<RwLock<HashMap<String, u64>>>,
    per_binding: Arc<RwLock<HashMap<String, u64>>>,
    start_time: Instant,
}

impl ConsumerMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            messages_consumed: Arc::new(AtomicU64::new(0)),
            messages_processed: Arc::new(AtomicU64::new(0)),
            messages_failed: Arc::new(AtomicU64::new(0)),
            messages_undecodable: Arc::new(AtomicU64::new(0)),
            messages_dead_lettered: Arc::new(AtomicU64::new(0)),
            batches: Arc::new(AtomicU64::new(0)),
            commits: Arc::new(AtomicU64::new(0)),
            restarts: Arc::new(AtomicU64::new(0)),
            rebalances: Arc::new(AtomicU64::new(0)),
            batch_durations: Arc::new(RwLock::new(Vec::new())),
            commit_durations: Arc::new(RwLock::new(Vec::new())),
            error_counts: Arc::new(RwLock::new(HashMap::new())),
            per_binding: Arc::new(RwLock::new(HashMap::new())),
            start_time: Instant::now(),
        }
    }

    /// Record a message received by `binding`
    pub fn increment_consumed(&self, binding: &str) {
        self.messages_consumed.fetch_add(1, Ordering::Relaxed);
        *self.per_binding.write().entry(binding.to_string()).or_insert(0) += 1;
    }

    /// Record messages a handler accepted
    pub fn add_processed(&self, count: usize) {
        self.messages_processed.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record messages a handler failed on
    pub fn add_failed(&self, count: usize) {
        self.messages_failed.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record an undecodable message
    pub fn increment_undecodable(&self) {
        self.messages_undecodable.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dead-lettered message
    pub fn increment_dead_lettered(&self) {
        self.messages_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch and how long its handler took
    pub fn record_batch(&self, duration: Duration) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        push_sample(&self.batch_durations, duration);
    }

    /// Record a successful commit and its duration
    pub fn record_commit(&self, duration: Duration) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        push_sample(&self.commit_durations, duration);
    }

    /// Record a worker restart
    pub fn increment_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rebalance event
    pub fn increment_rebalance(&self) {
        self.rebalances.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error by kind
    pub fn record_error(&self, kind: &str) {
        *self.error_counts.write().entry(kind.to_string()).or_insert(0) += 1;
    }

    /// Count recorded for an error kind
    pub fn error_count(&self, kind: &str) -> u64 {
        self.error_counts.read().get(kind).copied().unwrap_or(0)
    }

    /// Messages received by one binding
    pub fn consumed_by(&self, binding: &str) -> u64 {
        self.per_binding.read().get(binding).copied().unwrap_or(0)
    }

    /// Handler duration statistics per batch
    pub fn batch_stats(&self) -> Option<ProcessingStats> {
        calculate_stats(&self.batch_durations)
    }

    /// Commit duration statistics
    pub fn commit_stats(&self) -> Option<ProcessingStats> {
        calculate_stats(&self.commit_durations)
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_consumed: self.messages_consumed.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            messages_undecodable: self.messages_undecodable.load(Ordering::Relaxed),
            messages_dead_lettered: self.messages_dead_lettered.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            rebalances: self.rebalances.load(Ordering::Relaxed),
            errors: self.error_counts.read().clone(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for ConsumerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn push_sample(samples: &RwLock<Vec<Duration>>, duration: Duration) {
    let mut samples = samples.write();
    samples.push(duration);
    if samples.len() > MAX_SAMPLES {
        samples.remove(0);
    }
}

fn calculate_stats(samples: &RwLock<Vec<Duration>>) -> Option<ProcessingStats> {
    let mut sorted = samples.read().clone();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort();

    let last = sorted.len() - 1;
    let total: u128 = sorted.iter().map(Duration::as_nanos).sum();

    Some(ProcessingStats {
        count: sorted.len(),
        p50: sorted[sorted.len() / 2],
        p95: sorted[(last as f64 * 0.95) as usize],
        p99: sorted[(last as f64 * 0.99) as usize],
        mean: Duration::from_nanos((total / sorted.len() as u128) as u64),
    })
}

/// Duration percentiles over the retained samples
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingStats {
    /// Number of samples
    pub count: usize,
    /// Median
    pub p50: Duration,
    /// 95th percentile
    pub p95: Duration,
    /// 99th percentile
    pub p99: Duration,
    /// Mean
    pub mean: Duration,
}

/// Serializable counter snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Messages read from the transport
    pub messages_consumed: u64,
    /// Messages handled successfully
    pub messages_processed: u64,
    /// Messages whose handler failed
    pub messages_failed: u64,
    /// Messages that could not be decoded
    pub messages_undecodable: u64,
    /// Messages forwarded to a dead-letter topic
    pub messages_dead_lettered: u64,
    /// Batches dispatched
    pub batches: u64,
    /// Successful commits
    pub commits: u64,
    /// Worker restarts
    pub restarts: u64,
    /// Partition assignments seen
    pub rebalances: u64,
    /// Errors by kind
    pub errors: HashMap<String, u64>,
    /// Seconds since the metrics were created
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_metrics() {
        let metrics = ConsumerMetrics::new();

        metrics.increment_consumed("A::h");
        metrics.increment_consumed("A::h");
        metrics.add_processed(2);
        metrics.record_batch(Duration::from_millis(10));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_consumed, 2);
        assert_eq!(snapshot.batches, 1);
        assert_eq!(metrics.consumed_by("A::h"), 2);
        assert_eq!(metrics.consumed_by("B::h"), 0);
    }

    #[test]
    fn test_error_tracking() {
        let metrics = ConsumerMetrics::new();
        metrics.record_error("transport");
        metrics.record_error("handler");
        metrics.record_error("transport");

        assert_eq!(metrics.error_count("transport"), 2);
        assert_eq!(metrics.error_count("handler"), 1);
        assert_eq!(metrics.snapshot().errors.len(), 2);
    }

    #[test]
    fn test_duration_stats() {
        let metrics = ConsumerMetrics::new();
        assert!(metrics.commit_stats().is_none());

        for ms in [10, 20, 30, 40, 50] {
            metrics.record_commit(Duration::from_millis(ms));
        }

        let stats = metrics.commit_stats().unwrap();
        assert_eq!(stats.count, 5);
        assert_eq!(stats.p50, Duration::from_millis(30));
        assert_eq!(stats.mean, Duration::from_millis(30));
        assert!(stats.p99 <= Duration::from_millis(50));
    }

    #[test]
    fn test_samples_are_bounded() {
        let metrics = ConsumerMetrics::new();
        for _ in 0..(MAX_SAMPLES + 10) {
            metrics.record_batch(Duration::from_millis(1));
        }
        assert_eq!(metrics.batch_stats().unwrap().count, MAX_SAMPLES);
        assert_eq!(metrics.snapshot().batches, (MAX_SAMPLES + 10) as u64);
    }

    #[test]
    fn test_thread_safety() {
        let metrics = Arc::new(ConsumerMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        m.increment_consumed("A::h");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.messages_consumed.load(Ordering::Relaxed), 800);
        assert_eq!(metrics.consumed_by("A::h"), 800);
    }
}
