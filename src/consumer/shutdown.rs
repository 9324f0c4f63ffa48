//! Shutdown bookkeeping shared by the supervisor and its workers

use std::sync::atomic::{AtomicUsize, Ordering};
use parking_lot::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

/// Tracks when shutdown started and how many batches are still in flight
#[derive(Debug, Default)]
pub struct ShutdownState {
    inflight_batches: AtomicUsize,
    shutdown_start: RwLock<Option<Instant>>,
}

impl ShutdownState {
    /// Create a new shutdown state
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark shutdown as started
    pub fn begin_shutdown(&self) {
        *self.shutdown_start.write() = Some(Instant::now());
        info!(inflight = self.inflight_count(), "Shutdown initiated");
    }

    /// Mark shutdown as finished
    pub fn complete_shutdown(&self) {
        if let Some(elapsed) = self.shutdown_duration() {
            info!(elapsed_ms = elapsed.as_millis() as u64, "Shutdown completed");
        }
    }

    /// A batch entered the handler
    pub fn batch_started(&self) {
        let count = self.inflight_batches.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(inflight = count, "batch started");
    }

    /// A batch finished, successfully or not
    pub fn batch_finished(&self) {
        let previous = self
            .inflight_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        debug!(inflight = previous.saturating_sub(1), "batch finished");
    }

    /// Number of batches currently being handled
    pub fn inflight_count(&self) -> usize {
        self.inflight_batches.load(Ordering::SeqCst)
    }

    /// Time since shutdown began
    pub fn shutdown_duration(&self) -> Option<Duration> {
        self.shutdown_start.read().map(|start| start.elapsed())
    }
}

/// Marks a batch in flight for as long as it lives
pub(crate) struct InflightGuard<'a> {
    state: &'a ShutdownState,
}

impl<'a> InflightGuard<'a> {
    pub fn new(state: &'a ShutdownState) -> Self {
        state.batch_started();
        Self { state }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.state.batch_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inflight_guard_counts_batches() {
        let state = ShutdownState::new();
        assert!(state.shutdown_duration().is_none());

        {
            let _first = InflightGuard::new(&state);
            let _second = InflightGuard::new(&state);
            assert_eq!(state.inflight_count(), 2);
        }
        assert_eq!(state.inflight_count(), 0);

        state.batch_finished();
        assert_eq!(state.inflight_count(), 0);
    }

    #[test]
    fn test_shutdown_duration_starts_at_begin() {
        let state = ShutdownState::new();
        state.begin_shutdown();
        assert!(state.shutdown_duration().is_some());
        state.complete_shutdown();
    }
}
