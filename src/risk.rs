//! Risk indicator pass.
//!
//! Runs in the full sync tier: portfolio drawdown against the soft and
//! hard limits, per-position exit-slippage caps, and data staleness.
//! Breaches are persisted as alerts; nothing is ever auto-executed.

use crate::db::{AlertRecord, Datastore};
use crate::metrics::metrics;
use crate::models::Config;
use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

pub struct RiskMonitor {
    config: Arc<Config>,
    store: Datastore,
}

impl RiskMonitor {
    pub fn new(config: Arc<Config>, store: Datastore) -> Self {
        Self { config, store }
    }

    /// Evaluate risk indicators for a wallet. `current_drawdown` is the
    /// executable drawdown from ATH, as a fraction.
    pub async fn run(&self, wallet: &str, current_drawdown: Decimal) -> Result<Vec<AlertRecord>> {
        let now = Utc::now();
        let mut alerts = Vec::new();

        if current_drawdown >= self.config.hard_drawdown_limit {
            alerts.push(AlertRecord {
                ts: now,
                severity: "critical".into(),
                kind: "drawdown_hard".into(),
                wallet_address: Some(wallet.to_string()),
                netuid: None,
                message: format!(
                    "executable drawdown {} breaches hard limit {}, forced risk-off",
                    current_drawdown.round_dp(4),
                    self.config.hard_drawdown_limit
                ),
                snapshot_ref: None,
            });
        } else if current_drawdown >= self.config.soft_drawdown_limit {
            alerts.push(AlertRecord {
                ts: now,
                severity: "warning".into(),
                kind: "drawdown_soft".into(),
                wallet_address: Some(wallet.to_string()),
                netuid: None,
                message: format!(
                    "executable drawdown {} breaches soft limit {}",
                    current_drawdown.round_dp(4),
                    self.config.soft_drawdown_limit
                ),
                snapshot_ref: None,
            });
        }

        for position in self.store.list_active_positions(wallet).await? {
            if position.netuid == 0 {
                continue;
            }
            if position.exit_slippage_50pct > self.config.max_exit_slippage_50pct {
                alerts.push(AlertRecord {
                    ts: now,
                    severity: "warning".into(),
                    kind: "slippage_cap_50pct".into(),
                    wallet_address: Some(wallet.to_string()),
                    netuid: Some(position.netuid),
                    message: format!(
                        "half-exit slippage {} above cap {}",
                        position.exit_slippage_50pct, self.config.max_exit_slippage_50pct
                    ),
                    snapshot_ref: None,
                });
            }
            if position.exit_slippage_100pct > self.config.max_exit_slippage_100pct {
                alerts.push(AlertRecord {
                    ts: now,
                    severity: "warning".into(),
                    kind: "slippage_cap_100pct".into(),
                    wallet_address: Some(wallet.to_string()),
                    netuid: Some(position.netuid),
                    message: format!(
                        "full-exit slippage {} above cap {}",
                        position.exit_slippage_100pct, self.config.max_exit_slippage_100pct
                    ),
                    snapshot_ref: None,
                });
            }
        }

        if let Some(last_sync) = metrics()
            .last_sync_unix()
            .and_then(|s| Utc.timestamp_opt(s, 0).single())
        {
            if now - last_sync > Duration::minutes(self.config.stale_data_threshold_minutes) {
                alerts.push(AlertRecord {
                    ts: now,
                    severity: "warning".into(),
                    kind: "stale_data".into(),
                    wallet_address: Some(wallet.to_string()),
                    netuid: None,
                    message: format!("last sync {last_sync} older than staleness threshold"),
                    snapshot_ref: None,
                });
            }
        }

        for alert in &alerts {
            warn!(kind = %alert.kind, severity = %alert.severity, "risk alert raised");
            self.store.insert_alert(alert).await?;
        }
        if alerts.is_empty() {
            info!(wallet, "risk pass clean");
        }
        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PositionRecord;
    use rust_decimal_macros::dec;

    fn monitor() -> RiskMonitor {
        std::env::set_var("TAOSTATS_API_KEY", "test-key");
        std::env::set_var("WALLET_ADDRESS", "5W");
        RiskMonitor::new(
            Arc::new(Config::from_env().unwrap()),
            Datastore::open_in_memory().unwrap(),
        )
    }

    #[tokio::test]
    async fn hard_drawdown_outranks_soft() {
        let m = monitor();
        let alerts = m.run("5W", dec!(0.25)).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, "drawdown_hard");
        assert_eq!(alerts[0].severity, "critical");
    }

    #[tokio::test]
    async fn soft_drawdown_warns() {
        let m = monitor();
        let alerts = m.run("5W", dec!(0.16)).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, "drawdown_soft");
    }

    #[tokio::test]
    async fn slippage_caps_raise_per_position_alerts() {
        let m = monitor();
        let mut p = PositionRecord::new("5W", 4);
        p.alpha_balance = dec!(10);
        p.tao_value_mid = dec!(50);
        m.store.apply_position_balances("5W", &[p]).await.unwrap();
        m.store
            .update_position_exec_values("5W", 4, dec!(47), dec!(44), dec!(0.06), dec!(0.12))
            .await
            .unwrap();

        let alerts = m.run("5W", dec!(0)).await.unwrap();
        let kinds: Vec<&str> = alerts.iter().map(|a| a.kind.as_str()).collect();
        assert!(kinds.contains(&"slippage_cap_50pct"));
        assert!(kinds.contains(&"slippage_cap_100pct"));

        // Alerts are persisted.
        assert_eq!(m.store.list_recent_alerts(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn clean_portfolio_raises_nothing() {
        let m = monitor();
        let alerts = m.run("5W", dec!(0.01)).await.unwrap();
        assert!(alerts.is_empty());
    }
}
