//! Three-tier sync scheduler.
//!
//! One background task per tier. Overlapping triggers coalesce through a
//! per-tier `try_lock`; a tick arriving while the previous run still
//! holds the lock is dropped, never queued. The refresh tier reschedules
//! itself after rate limits with exponential backoff and restores the
//! normal interval on the first success.

use super::{SyncRunResult, SyncService};
use crate::models::{Config, SyncTier};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Backoff ladder in minutes after consecutive rate-limited refreshes:
/// 5, 10, 20, capped at 30.
const BACKOFF_BASE_MINUTES: u64 = 5;
const BACKOFF_CAP_MINUTES: u64 = 30;

/// Safety margin carved out of each tier's cadence for its job timeout.
const TIMEOUT_MARGIN_SECS: u64 = 30;

/// Delay until the next refresh after a rate-limited run.
///
/// An upstream `retry_after` hint takes precedence over the exponential
/// ladder; either way the result caps at 30 minutes.
pub fn backoff_delay(consecutive_failures: u32, retry_after_secs: Option<u64>) -> Duration {
    let cap = Duration::from_secs(BACKOFF_CAP_MINUTES * 60);
    match retry_after_secs {
        Some(secs) => Duration::from_secs(secs.max(1)).min(cap),
        None => {
            let exp_minutes = BACKOFF_BASE_MINUTES
                .saturating_mul(2u64.saturating_pow(consecutive_failures.saturating_sub(1)))
                .min(BACKOFF_CAP_MINUTES);
            Duration::from_secs(exp_minutes * 60)
        }
    }
}

pub struct SyncScheduler {
    service: Arc<SyncService>,
    config: Arc<Config>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    refresh_lock: Arc<Mutex<()>>,
    full_lock: Arc<Mutex<()>>,
    deep_lock: Arc<Mutex<()>>,
}

impl SyncScheduler {
    pub fn new(service: Arc<SyncService>, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            service,
            config,
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            refresh_lock: Arc::new(Mutex::new(())),
            full_lock: Arc::new(Mutex::new(())),
            deep_lock: Arc::new(Mutex::new(())),
        })
    }

    fn tier_lock(&self, tier: SyncTier) -> Arc<Mutex<()>> {
        match tier {
            SyncTier::Refresh => self.refresh_lock.clone(),
            SyncTier::Full => self.full_lock.clone(),
            SyncTier::Deep => self.deep_lock.clone(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the three tier loops. Idempotent: a second call while
    /// running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            warn!("scheduler already running");
            return;
        }

        let refresh_interval = Duration::from_secs(self.config.wallet_refresh_minutes * 60);
        let full_interval = Duration::from_secs(self.config.full_sync_minutes * 60);
        let deep_interval = Duration::from_secs(self.config.deep_sync_hours * 3600);

        handles.push(tokio::spawn(
            self.clone().refresh_loop(refresh_interval),
        ));
        handles.push(tokio::spawn(
            self.clone().tier_loop(SyncTier::Full, full_interval),
        ));
        handles.push(tokio::spawn(
            self.clone().tier_loop(SyncTier::Deep, deep_interval),
        ));

        info!(
            refresh_minutes = self.config.wallet_refresh_minutes,
            full_minutes = self.config.full_sync_minutes,
            deep_hours = self.config.deep_sync_hours,
            "scheduler started with three sync tiers"
        );
    }

    /// Signal the loops, wait a bounded grace period, then abort.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if timeout(Duration::from_secs(10), handle).await.is_err() {
                warn!("scheduler task did not stop within grace period");
            }
        }
        info!("scheduler stopped");
    }

    /// Refresh tier with dynamic rescheduling on rate limits.
    async fn refresh_loop(self: Arc<Self>, normal_interval: Duration) {
        let lock = self.tier_lock(SyncTier::Refresh);
        let mut consecutive_failures: u32 = 0;
        let mut delay = normal_interval;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }

            let Ok(_guard) = lock.try_lock() else {
                // Previous run still live: coalesce this tick.
                warn!(tier = "refresh", "previous run still executing, tick coalesced");
                delay = normal_interval;
                continue;
            };

            let result = self
                .run_tier(SyncTier::Refresh, normal_interval)
                .await;

            match result {
                Some(result) if result.rate_limited => {
                    consecutive_failures += 1;
                    let retry_after = self.service.current_retry_after();
                    delay = backoff_delay(consecutive_failures, retry_after);
                    info!(
                        consecutive_failures,
                        next_refresh_secs = delay.as_secs(),
                        "rate limited, refresh rescheduled with backoff"
                    );
                }
                Some(result) => {
                    if result.errors.is_empty() {
                        if consecutive_failures > 0 {
                            info!("refresh recovered, normal interval restored");
                        }
                        consecutive_failures = 0;
                    } else {
                        consecutive_failures += 1;
                    }
                    delay = normal_interval;
                }
                // Timed out; keep cadence, count the failure.
                None => {
                    consecutive_failures += 1;
                    delay = normal_interval;
                }
            }
        }
    }

    /// Full and deep tiers run on fixed intervals; their failures are
    /// handled inside the job.
    async fn tier_loop(self: Arc<Self>, tier: SyncTier, interval: Duration) {
        let lock = self.tier_lock(tier);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(interval) => {}
            }
            let Ok(_guard) = lock.try_lock() else {
                warn!(tier = tier.as_str(), "previous run still executing, tick coalesced");
                continue;
            };
            self.run_tier(tier, interval).await;
        }
    }

    async fn run_tier(&self, tier: SyncTier, cadence: Duration) -> Option<SyncRunResult> {
        let job_timeout = cadence
            .checked_sub(Duration::from_secs(TIMEOUT_MARGIN_SECS))
            .unwrap_or(cadence);
        let job = self.service.sync_all(tier, &self.cancel);
        match timeout(job_timeout, job).await {
            Ok(result) => Some(result),
            Err(_) => {
                warn!(tier = tier.as_str(), "sync job exceeded its timeout");
                crate::metrics::metrics()
                    .record_sync_failure(tier.as_str(), "job timeout");
                None
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_hint_beats_cadence() {
        // A 120s hint reschedules the refresh to ~120s, not the normal
        // 5-minute interval or the 5-minute ladder floor.
        let delay = backoff_delay(1, Some(120));
        assert_eq!(delay, Duration::from_secs(120));
    }

    #[test]
    fn ladder_doubles_and_caps() {
        assert_eq!(backoff_delay(1, None), Duration::from_secs(5 * 60));
        assert_eq!(backoff_delay(2, None), Duration::from_secs(10 * 60));
        assert_eq!(backoff_delay(3, None), Duration::from_secs(20 * 60));
        assert_eq!(backoff_delay(4, None), Duration::from_secs(30 * 60));
        assert_eq!(backoff_delay(9, None), Duration::from_secs(30 * 60));
    }

    #[test]
    fn hint_is_capped_at_thirty_minutes() {
        let delay = backoff_delay(1, Some(86_400));
        assert_eq!(delay, Duration::from_secs(30 * 60));
    }
}
