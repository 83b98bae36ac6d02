//! Thread-safe relay counters shared by the listener loop and every relay task

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::Direction;

/// Thread-safe metrics collector that can be updated from async tasks
#[derive(Clone, Default)]
pub struct RelayMetrics {
    inner: Arc<RwLock<MetricsState>>,
}

/// Internal metrics state
struct MetricsState {
    started_at: Instant,

    accepted: u64,
    accept_errors: u64,
    active_pairs: u64,
    completed_pairs: u64,

    dial_failures: u64,
    copy_errors: u64,
    idle_timeouts: u64,

    bytes_remote_to_local: u64,
    bytes_local_to_remote: u64,

    last_error: Option<String>,
}

impl Default for MetricsState {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            accepted: 0,
            accept_errors: 0,
            active_pairs: 0,
            completed_pairs: 0,
            dial_failures: 0,
            copy_errors: 0,
            idle_timeouts: 0,
            bytes_remote_to_local: 0,
            bytes_local_to_remote: 0,
            last_error: None,
        }
    }
}

/// Immutable snapshot of metrics for logging and assertions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime: Duration,
    pub accepted: u64,
    pub accept_errors: u64,
    pub active_pairs: u64,
    pub completed_pairs: u64,
    pub dial_failures: u64,
    pub copy_errors: u64,
    pub idle_timeouts: u64,
    pub bytes_remote_to_local: u64,
    pub bytes_local_to_remote: u64,
    pub last_error: Option<String>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accept(&self) {
        self.inner.write().accepted += 1;
    }

    pub fn record_accept_error(&self, error: impl Into<String>) {
        let mut state = self.inner.write();
        state.accept_errors += 1;
        state.last_error = Some(error.into());
    }

    pub fn record_dial_failure(&self, error: impl Into<String>) {
        let mut state = self.inner.write();
        state.dial_failures += 1;
        state.last_error = Some(error.into());
    }

    pub fn record_copy_error(&self, error: impl Into<String>) {
        let mut state = self.inner.write();
        state.copy_errors += 1;
        state.last_error = Some(error.into());
    }

    pub fn record_idle_timeout(&self) {
        self.inner.write().idle_timeouts += 1;
    }

    pub fn record_bytes(&self, direction: Direction, bytes: u64) {
        let mut state = self.inner.write();
        match direction {
            Direction::RemoteToLocal => state.bytes_remote_to_local += bytes,
            Direction::LocalToRemote => state.bytes_local_to_remote += bytes,
        }
    }

    /// Count a pair as active until the returned guard is dropped
    pub fn track_pair(&self) -> ActivePairGuard {
        self.inner.write().active_pairs += 1;
        ActivePairGuard {
            metrics: self.clone(),
        }
    }

    pub fn active_pairs(&self) -> u64 {
        self.inner.read().active_pairs
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.inner.read();
        MetricsSnapshot {
            uptime: state.started_at.elapsed(),
            accepted: state.accepted,
            accept_errors: state.accept_errors,
            active_pairs: state.active_pairs,
            completed_pairs: state.completed_pairs,
            dial_failures: state.dial_failures,
            copy_errors: state.copy_errors,
            idle_timeouts: state.idle_timeouts,
            bytes_remote_to_local: state.bytes_remote_to_local,
            bytes_local_to_remote: state.bytes_local_to_remote,
            last_error: state.last_error.clone(),
        }
    }
}

/// Decrements the active pair gauge on drop, on every exit path of a relay task
pub struct ActivePairGuard {
    metrics: RelayMetrics,
}

impl Drop for ActivePairGuard {
    fn drop(&mut self) {
        let mut state = self.metrics.inner.write();
        state.active_pairs = state.active_pairs.saturating_sub(1);
        state.completed_pairs += 1;
    }
}
