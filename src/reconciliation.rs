//! Stored-vs-live position reconciliation.
//!
//! Pulls live stake balances from the upstream, diffs them against the
//! stored position rows per netuid, and persists a run with per-check
//! details. A check passes inside either the absolute or the relative
//! tolerance; a position present on only one side fails outright once
//! its value exceeds the absolute tolerance.

use crate::client::TaostatsClient;
use crate::db::{Datastore, ReconciliationRunRecord};
use crate::metrics::metrics;
use crate::models::Config;
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconCheck {
    pub netuid: i64,
    pub passed: bool,
    pub stored_value_tao: Decimal,
    pub live_value_tao: Decimal,
    pub value_diff_tao: Decimal,
    pub value_diff_pct: Decimal,
    pub stored_alpha: Decimal,
    pub live_alpha: Decimal,
    pub within_absolute_tolerance: bool,
    pub within_relative_tolerance: bool,
}

/// Diff one netuid's stored and live values against both tolerances.
pub fn compare_position(
    netuid: i64,
    stored_value: Decimal,
    live_value: Decimal,
    stored_alpha: Decimal,
    live_alpha: Decimal,
    absolute_tolerance: Decimal,
    relative_tolerance_pct: Decimal,
) -> ReconCheck {
    let value_diff = live_value - stored_value;
    let value_diff_abs = value_diff.abs();

    let relative_diff_pct = if stored_value > Decimal::ZERO {
        value_diff_abs / stored_value * dec!(100)
    } else {
        Decimal::ZERO
    };

    let within_absolute = value_diff_abs <= absolute_tolerance;
    // Zero stored value leaves only the absolute check meaningful.
    let within_relative =
        stored_value > Decimal::ZERO && relative_diff_pct <= relative_tolerance_pct;

    let mut passed = within_absolute || within_relative;

    // One-sided positions above the absolute tolerance always fail.
    let one_sided = (stored_value > Decimal::ZERO && live_value == Decimal::ZERO)
        || (stored_value == Decimal::ZERO && live_value > Decimal::ZERO);
    if one_sided && (stored_value > absolute_tolerance || live_value > absolute_tolerance) {
        passed = false;
    }

    ReconCheck {
        netuid,
        passed,
        stored_value_tao: stored_value,
        live_value_tao: live_value,
        value_diff_tao: value_diff,
        value_diff_pct: relative_diff_pct.round_dp(4),
        stored_alpha,
        live_alpha,
        within_absolute_tolerance: within_absolute,
        within_relative_tolerance: within_relative,
    }
}

pub struct ReconciliationService {
    store: Datastore,
    client: Arc<TaostatsClient>,
    config: Arc<Config>,
}

impl ReconciliationService {
    pub fn new(store: Datastore, client: Arc<TaostatsClient>, config: Arc<Config>) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    /// Run a reconciliation pass for one wallet and persist the result.
    /// Read-only against positions; safe to run alongside sync tiers.
    pub async fn run(&self, wallet: &str) -> Result<ReconciliationRunRecord> {
        let run_id = format!(
            "recon_{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let abs_tol = self.config.reconciliation_absolute_tolerance_tao;
        let rel_tol = self.config.reconciliation_relative_tolerance_pct;
        info!(run_id, wallet, "reconciliation run starting");

        let stored: BTreeMap<i64, (Decimal, Decimal)> = self
            .store
            .list_positions(wallet)
            .await?
            .into_iter()
            .map(|p| (p.netuid, (p.tao_value_mid, p.alpha_balance)))
            .collect();

        let live = match self.client.stake_balance_latest(wallet).await {
            Ok(rows) => {
                let mut map: BTreeMap<i64, (Decimal, Decimal)> = BTreeMap::new();
                for row in rows {
                    // First row wins on duplicate netuids.
                    map.entry(row.netuid).or_insert((
                        row.balance_as_tao
                            .as_deref()
                            .and_then(crate::units::rao_str_to_tao)
                            .unwrap_or(Decimal::ZERO),
                        row.balance
                            .as_deref()
                            .and_then(crate::units::rao_str_to_tao)
                            .unwrap_or(Decimal::ZERO),
                    ));
                }
                map
            }
            Err(e) => {
                warn!(run_id, error = %e, "reconciliation fetch failed");
                let failed = ReconciliationRunRecord {
                    run_id: run_id.clone(),
                    created_at: Utc::now(),
                    wallet_address: wallet.to_string(),
                    passed: false,
                    total_checks: 0,
                    passed_checks: 0,
                    failed_checks: 0,
                    total_stored_value_tao: Decimal::ZERO,
                    total_live_value_tao: Decimal::ZERO,
                    total_diff_tao: Decimal::ZERO,
                    total_diff_pct: Decimal::ZERO,
                    checks_json: "[]".into(),
                    error_message: Some(e.to_string()),
                    absolute_tolerance_tao: abs_tol,
                    relative_tolerance_pct: rel_tol,
                };
                self.store.insert_reconciliation_run(&failed).await?;
                return Ok(failed);
            }
        };

        let mut netuids: Vec<i64> = stored.keys().chain(live.keys()).copied().collect();
        netuids.sort_unstable();
        netuids.dedup();

        let mut checks = Vec::new();
        let mut passed_checks = 0i64;
        let mut failed_checks = 0i64;
        let mut total_stored = Decimal::ZERO;
        let mut total_live = Decimal::ZERO;

        for netuid in netuids {
            let (stored_value, stored_alpha) =
                stored.get(&netuid).copied().unwrap_or_default();
            let (live_value, live_alpha) = live.get(&netuid).copied().unwrap_or_default();

            let check = compare_position(
                netuid,
                stored_value,
                live_value,
                stored_alpha,
                live_alpha,
                abs_tol,
                rel_tol,
            );
            if check.passed {
                passed_checks += 1;
            } else {
                failed_checks += 1;
            }
            total_stored += stored_value;
            total_live += live_value;
            checks.push(check);
        }

        let total_diff = total_live - total_stored;
        let total_diff_pct = if total_stored > Decimal::ZERO {
            (total_diff.abs() / total_stored * dec!(100)).round_dp(4)
        } else {
            Decimal::ZERO
        };
        let passed = failed_checks == 0;

        let record = ReconciliationRunRecord {
            run_id: run_id.clone(),
            created_at: Utc::now(),
            wallet_address: wallet.to_string(),
            passed,
            total_checks: checks.len() as i64,
            passed_checks,
            failed_checks,
            total_stored_value_tao: total_stored,
            total_live_value_tao: total_live,
            total_diff_tao: total_diff,
            total_diff_pct,
            checks_json: serde_json::to_string(&checks)?,
            error_message: None,
            absolute_tolerance_tao: abs_tol,
            relative_tolerance_pct: rel_tol,
        };
        self.store.insert_reconciliation_run(&record).await?;

        if !passed {
            metrics().record_drift_detected(
                "positions",
                &format!("reconciliation failed {failed_checks} check(s)"),
            );
        }
        info!(
            run_id,
            passed,
            total = record.total_checks,
            failed = failed_checks,
            "reconciliation run complete"
        );
        Ok(record)
    }
}
