//! Process-local metrics registry.
//!
//! Counters and gauges for cache, upstream API, sync health, and
//! reconciliation drift. Updates are best-effort and never fail the
//! caller; readers take cheap snapshots for health reporting and the
//! trust gate.

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

lazy_static! {
    static ref METRICS: Metrics = Metrics::new();
}

/// Global metrics registry accessor.
pub fn metrics() -> &'static Metrics {
    &METRICS
}

/// Per-dataset sync health tracked across runs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatasetHealth {
    pub total_runs: u64,
    pub total_errors: u64,
    pub consecutive_failures: u32,
    /// Unix seconds of the last successful sync, if any.
    pub last_success: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub struct Metrics {
    // Cache
    cache_hits: RwLock<HashMap<String, u64>>,
    cache_misses: RwLock<HashMap<String, u64>>,

    // Upstream API
    api_requests: AtomicU64,
    api_retries: AtomicU64,
    api_rate_limit_hits: AtomicU64,
    api_errors: AtomicU64,

    // Sync
    datasets: RwLock<HashMap<String, DatasetHealth>>,

    // Reconciliation
    drift_detected: AtomicU64,

    // Gauges
    last_sync_unix: AtomicI64,
    active_positions: AtomicI64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: HashMap<String, u64>,
    pub cache_misses: HashMap<String, u64>,
    pub api_requests: u64,
    pub api_retries: u64,
    pub api_rate_limit_hits: u64,
    pub api_errors: u64,
    pub datasets: HashMap<String, DatasetHealth>,
    pub drift_detected: u64,
    pub last_sync_unix: Option<i64>,
    pub active_positions: i64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            cache_hits: RwLock::new(HashMap::new()),
            cache_misses: RwLock::new(HashMap::new()),
            api_requests: AtomicU64::new(0),
            api_retries: AtomicU64::new(0),
            api_rate_limit_hits: AtomicU64::new(0),
            api_errors: AtomicU64::new(0),
            datasets: RwLock::new(HashMap::new()),
            drift_detected: AtomicU64::new(0),
            last_sync_unix: AtomicI64::new(0),
            active_positions: AtomicI64::new(0),
        }
    }

    pub fn record_cache_hit(&self, key: &str) {
        *self.cache_hits.write().entry(key_class(key)).or_insert(0) += 1;
    }

    pub fn record_cache_miss(&self, key: &str) {
        *self.cache_misses.write().entry(key_class(key)).or_insert(0) += 1;
    }

    pub fn record_api_request(&self) {
        self.api_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_api_retry(&self) {
        self.api_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_api_rate_limited(&self) {
        self.api_rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_api_error(&self) {
        self.api_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_success(&self, dataset: &str, at_unix: i64) {
        let mut map = self.datasets.write();
        let entry = map.entry(dataset.to_string()).or_default();
        entry.total_runs += 1;
        entry.consecutive_failures = 0;
        entry.last_success = Some(at_unix);
        entry.last_error = None;
        self.last_sync_unix.store(at_unix, Ordering::Relaxed);
    }

    pub fn record_sync_failure(&self, dataset: &str, error: &str) {
        let mut map = self.datasets.write();
        let entry = map.entry(dataset.to_string()).or_default();
        entry.total_runs += 1;
        entry.total_errors += 1;
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_error = Some(truncate(error, 200));
    }

    pub fn record_drift_detected(&self, dataset: &str, details: &str) {
        self.drift_detected.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(dataset, details, "drift detected");
    }

    pub fn set_active_positions(&self, count: i64) {
        self.active_positions.store(count, Ordering::Relaxed);
    }

    /// Per-dataset health map, consumed by the trust gate.
    pub fn sync_status(&self) -> HashMap<String, DatasetHealth> {
        self.datasets.read().clone()
    }

    pub fn last_sync_unix(&self) -> Option<i64> {
        match self.last_sync_unix.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    pub fn drift_count(&self) -> u64 {
        self.drift_detected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.read().clone(),
            cache_misses: self.cache_misses.read().clone(),
            api_requests: self.api_requests.load(Ordering::Relaxed),
            api_retries: self.api_retries.load(Ordering::Relaxed),
            api_rate_limit_hits: self.api_rate_limit_hits.load(Ordering::Relaxed),
            api_errors: self.api_errors.load(Ordering::Relaxed),
            datasets: self.datasets.read().clone(),
            drift_detected: self.drift_detected.load(Ordering::Relaxed),
            last_sync_unix: self.last_sync_unix(),
            active_positions: self.active_positions.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub fn reset_for_test(&self) {
        self.cache_hits.write().clear();
        self.cache_misses.write().clear();
        self.datasets.write().clear();
        self.api_requests.store(0, Ordering::Relaxed);
        self.api_retries.store(0, Ordering::Relaxed);
        self.api_rate_limit_hits.store(0, Ordering::Relaxed);
        self.api_errors.store(0, Ordering::Relaxed);
        self.drift_detected.store(0, Ordering::Relaxed);
        self.last_sync_unix.store(0, Ordering::Relaxed);
    }
}

/// Collapse per-entity cache keys into a bounded set of counter labels
/// (e.g. "stake_balance:5Gr..." -> "stake_balance").
fn key_class(key: &str) -> String {
    key.split(':').next().unwrap_or(key).to_string()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_failures_reset_on_success() {
        let m = Metrics::new();
        m.record_sync_failure("positions", "boom");
        m.record_sync_failure("positions", "boom");
        assert_eq!(m.sync_status()["positions"].consecutive_failures, 2);

        m.record_sync_success("positions", 1_700_000_000);
        let health = m.sync_status();
        assert_eq!(health["positions"].consecutive_failures, 0);
        assert_eq!(health["positions"].last_success, Some(1_700_000_000));
    }

    #[test]
    fn cache_keys_collapse_to_class() {
        let m = Metrics::new();
        m.record_cache_hit("pool:1");
        m.record_cache_hit("pool:42");
        m.record_cache_miss("pool:7");
        assert_eq!(m.snapshot().cache_hits["pool"], 2);
        assert_eq!(m.snapshot().cache_misses["pool"], 1);
    }

    #[test]
    fn drift_counter_increments() {
        let m = Metrics::new();
        m.record_drift_detected("positions", "2 failed checks");
        assert_eq!(m.drift_count(), 1);
    }
}
