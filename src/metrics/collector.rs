use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared by the pipeline and the coordinator
#[derive(Debug, Default)]
pub struct AuthMetrics {
    /// Requests handed to the pipeline
    total_requests: AtomicU64,

    /// Refresh exchanges started (at most one per cycle)
    refreshes_started: AtomicU64,
    refreshes_succeeded: AtomicU64,
    refreshes_failed: AtomicU64,

    /// Calls parked behind an in-flight refresh
    calls_queued: AtomicU64,

    /// Waiters resumed with a fresh token
    calls_resumed: AtomicU64,

    /// Waiters failed with SessionExpired
    calls_expired: AtomicU64,

    /// 401s that arrived after the token had already been rotated
    stale_token_retries: AtomicU64,

    /// Errors returned to callers, keyed by kind
    errors_by_kind: DashMap<String, AtomicU64>,
}

/// Point-in-time copy of [`AuthMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub refreshes_started: u64,
    pub refreshes_succeeded: u64,
    pub refreshes_failed: u64,
    pub calls_queued: u64,
    pub calls_resumed: u64,
    pub calls_expired: u64,
    pub stale_token_retries: u64,
    pub total_errors: u64,
}

impl AuthMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_started(&self) {
        self.refreshes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_succeeded(&self) {
        self.refreshes_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_failed(&self) {
        self.refreshes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.calls_queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how a drained waiter was resolved
    pub fn record_resolved(&self, resumed: bool) {
        if resumed {
            self.calls_resumed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.calls_expired.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_stale_token_retry(&self) {
        self.stale_token_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error surfaced to a caller
    pub fn record_error(&self, kind: &str) {
        self.errors_by_kind
            .entry(kind.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Errors by kind, sorted by name
    pub fn errors_by_kind(&self) -> Vec<(String, u64)> {
        let mut errors: Vec<(String, u64)> = self
            .errors_by_kind
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        errors.sort();
        errors
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            refreshes_started: self.refreshes_started.load(Ordering::Relaxed),
            refreshes_succeeded: self.refreshes_succeeded.load(Ordering::Relaxed),
            refreshes_failed: self.refreshes_failed.load(Ordering::Relaxed),
            calls_queued: self.calls_queued.load(Ordering::Relaxed),
            calls_resumed: self.calls_resumed.load(Ordering::Relaxed),
            calls_expired: self.calls_expired.load(Ordering::Relaxed),
            stale_token_retries: self.stale_token_retries.load(Ordering::Relaxed),
            total_errors: self
                .errors_by_kind
                .iter()
                .map(|entry| entry.value().load(Ordering::Relaxed))
                .sum(),
        }
    }
}
