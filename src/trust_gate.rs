//! Trust gate: the single authoritative precondition for advisory output.
//!
//! Aggregates sync staleness, reconciliation state and per-dataset sync
//! health into ok / degraded / blocked. Every advisory surface consults
//! the gate first; a blocked gate collapses confidence to low with a
//! human-readable reason. No other code path may classify trust.

use crate::db::{Datastore, SignalRunRecord};
use crate::metrics::{metrics, DatasetHealth};
use crate::models::{Config, GateState};
use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub const TRUST_GATE_SIGNAL_ID: &str = "data_trust_gate";

/// Closed set of reasons a gate can leave `ok`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum TrustIssue {
    DataStale { last_sync: DateTime<Utc> },
    NeverSynced,
    ReconciliationDrift { failed_checks: i64 },
    ReconciliationStale { last_run: DateTime<Utc> },
    ReconciliationNeverRun,
    DatasetFailing { dataset: String, consecutive_failures: u32 },
    DatasetNeverSucceeded { dataset: String },
}

impl TrustIssue {
    fn severity(&self) -> GateState {
        match self {
            TrustIssue::NeverSynced | TrustIssue::DatasetNeverSucceeded { .. } => {
                GateState::Blocked
            }
            _ => GateState::Degraded,
        }
    }

    fn describe(&self) -> String {
        match self {
            TrustIssue::DataStale { last_sync } => {
                format!("data is stale, last sync {last_sync}")
            }
            TrustIssue::NeverSynced => "no sync has ever completed".into(),
            TrustIssue::ReconciliationDrift { failed_checks } => {
                format!("reconciliation detected drift ({failed_checks} failed checks)")
            }
            TrustIssue::ReconciliationStale { last_run } => {
                format!("last reconciliation run is older than 24h ({last_run})")
            }
            TrustIssue::ReconciliationNeverRun => "reconciliation has never run".into(),
            TrustIssue::DatasetFailing {
                dataset,
                consecutive_failures,
            } => format!("dataset '{dataset}' has {consecutive_failures} consecutive failures"),
            TrustIssue::DatasetNeverSucceeded { dataset } => {
                format!("dataset '{dataset}' has never synced successfully")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrustReport {
    pub state: GateState,
    pub issues: Vec<TrustIssue>,
    pub summary: String,
    pub evaluated_at: DateTime<Utc>,
}

impl TrustReport {
    /// Collapse a caller's confidence label through the gate.
    pub fn gated_confidence<'a>(&self, requested: &'a str) -> (&'a str, Option<String>) {
        match self.state {
            GateState::Ok => (requested, None),
            GateState::Degraded | GateState::Blocked => (
                "low",
                Some(format!(
                    "trust gate {}: {}",
                    self.state.as_str(),
                    self.summary
                )),
            ),
        }
    }
}

pub struct TrustGate {
    store: Datastore,
    config: Arc<Config>,
}

impl TrustGate {
    pub fn new(store: Datastore, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    /// Evaluate the gate for a wallet and persist the run.
    pub async fn evaluate(&self, wallet: &str) -> Result<TrustReport> {
        let now = Utc::now();
        let sync_status = metrics().sync_status();
        let last_sync = metrics()
            .last_sync_unix()
            .and_then(|s| Utc.timestamp_opt(s, 0).single());
        let last_recon = self.store.latest_reconciliation_run(wallet).await?;

        let report = evaluate_inputs(
            now,
            last_sync,
            self.config.stale_data_threshold_minutes,
            last_recon.as_ref().map(|r| (r.created_at, r.passed, r.failed_checks)),
            &sync_status,
        );

        self.store
            .insert_signal_run(&SignalRunRecord {
                signal_id: TRUST_GATE_SIGNAL_ID.into(),
                ts: now,
                status: report.state.as_str().into(),
                confidence: match report.state {
                    GateState::Ok => "high".into(),
                    GateState::Degraded => "medium".into(),
                    GateState::Blocked => "low".into(),
                },
                summary: report.summary.clone(),
                evidence_json: json!({
                    "last_sync": last_sync,
                    "stale_threshold_minutes": self.config.stale_data_threshold_minutes,
                    "reconciliation": last_recon.as_ref().map(|r| json!({
                        "run_id": r.run_id,
                        "passed": r.passed,
                        "failed_checks": r.failed_checks,
                        "created_at": r.created_at,
                    })),
                    "datasets": sync_status,
                })
                .to_string(),
                guardrails_json: serde_json::to_string(&report.issues)?,
            })
            .await?;

        match report.state {
            GateState::Ok => info!("trust gate ok"),
            _ => warn!(state = report.state.as_str(), summary = %report.summary, "trust gate not ok"),
        }
        Ok(report)
    }
}

/// Pure gate evaluation over its three inputs.
pub fn evaluate_inputs(
    now: DateTime<Utc>,
    last_sync: Option<DateTime<Utc>>,
    stale_threshold_minutes: i64,
    last_reconciliation: Option<(DateTime<Utc>, bool, i64)>,
    datasets: &HashMap<String, DatasetHealth>,
) -> TrustReport {
    let mut issues = Vec::new();

    match last_sync {
        None => issues.push(TrustIssue::NeverSynced),
        Some(at) => {
            if now - at > Duration::minutes(stale_threshold_minutes) {
                issues.push(TrustIssue::DataStale { last_sync: at });
            }
        }
    }

    match last_reconciliation {
        None => issues.push(TrustIssue::ReconciliationNeverRun),
        Some((created_at, passed, failed_checks)) => {
            if !passed {
                issues.push(TrustIssue::ReconciliationDrift { failed_checks });
            }
            if now - created_at > Duration::hours(24) {
                issues.push(TrustIssue::ReconciliationStale {
                    last_run: created_at,
                });
            }
        }
    }

    for (dataset, health) in datasets {
        if health.last_success.is_none() {
            issues.push(TrustIssue::DatasetNeverSucceeded {
                dataset: dataset.clone(),
            });
        } else if health.consecutive_failures > 3 {
            issues.push(TrustIssue::DatasetFailing {
                dataset: dataset.clone(),
                consecutive_failures: health.consecutive_failures,
            });
        }
    }

    let state = issues
        .iter()
        .map(|i| i.severity())
        .fold(GateState::Ok, |acc, s| match (acc, s) {
            (GateState::Blocked, _) | (_, GateState::Blocked) => GateState::Blocked,
            (GateState::Degraded, _) | (_, GateState::Degraded) => GateState::Degraded,
            _ => GateState::Ok,
        });

    let summary = if issues.is_empty() {
        "all data trust checks passed".to_string()
    } else {
        issues
            .iter()
            .map(|i| i.describe())
            .collect::<Vec<_>>()
            .join("; ")
    };

    TrustReport {
        state,
        issues,
        summary,
        evaluated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_dataset(last_success: i64) -> DatasetHealth {
        DatasetHealth {
            total_runs: 10,
            total_errors: 0,
            consecutive_failures: 0,
            last_success: Some(last_success),
            last_error: None,
        }
    }

    #[test]
    fn fresh_inputs_pass() {
        let now = Utc::now();
        let mut datasets = HashMap::new();
        datasets.insert("positions".to_string(), healthy_dataset(now.timestamp()));

        let report = evaluate_inputs(
            now,
            Some(now - Duration::minutes(2)),
            30,
            Some((now - Duration::hours(1), true, 0)),
            &datasets,
        );
        assert_eq!(report.state, GateState::Ok);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn never_synced_blocks() {
        let now = Utc::now();
        let report = evaluate_inputs(now, None, 30, Some((now, true, 0)), &HashMap::new());
        assert_eq!(report.state, GateState::Blocked);
        assert!(report.issues.contains(&TrustIssue::NeverSynced));
    }

    #[test]
    fn stale_sync_degrades() {
        let now = Utc::now();
        let report = evaluate_inputs(
            now,
            Some(now - Duration::minutes(45)),
            30,
            Some((now, true, 0)),
            &HashMap::new(),
        );
        assert_eq!(report.state, GateState::Degraded);
    }

    #[test]
    fn reconciliation_paths_degrade() {
        let now = Utc::now();

        let never = evaluate_inputs(now, Some(now), 30, None, &HashMap::new());
        assert_eq!(never.state, GateState::Degraded);

        let drifted = evaluate_inputs(now, Some(now), 30, Some((now, false, 3)), &HashMap::new());
        assert_eq!(drifted.state, GateState::Degraded);
        assert!(drifted.summary.contains("drift"));

        let old = evaluate_inputs(
            now,
            Some(now),
            30,
            Some((now - Duration::hours(30), true, 0)),
            &HashMap::new(),
        );
        assert_eq!(old.state, GateState::Degraded);
    }

    #[test]
    fn dataset_health_rules() {
        let now = Utc::now();
        let recon = Some((now, true, 0));

        let mut failing = HashMap::new();
        failing.insert(
            "transactions".to_string(),
            DatasetHealth {
                total_runs: 8,
                total_errors: 5,
                consecutive_failures: 4,
                last_success: Some(now.timestamp()),
                last_error: Some("timeout".into()),
            },
        );
        let report = evaluate_inputs(now, Some(now), 30, recon, &failing);
        assert_eq!(report.state, GateState::Degraded);

        let mut never = HashMap::new();
        never.insert(
            "slippage".to_string(),
            DatasetHealth {
                total_runs: 3,
                total_errors: 3,
                consecutive_failures: 3,
                last_success: None,
                last_error: Some("500".into()),
            },
        );
        let report = evaluate_inputs(now, Some(now), 30, recon, &never);
        assert_eq!(report.state, GateState::Blocked);
    }

    #[test]
    fn blocked_gate_collapses_confidence() {
        let now = Utc::now();
        let report = evaluate_inputs(now, None, 30, None, &HashMap::new());
        let (confidence, reason) = report.gated_confidence("high");
        assert_eq!(confidence, "low");
        assert!(reason.unwrap().contains("blocked"));

        let ok = evaluate_inputs(
            now,
            Some(now),
            30,
            Some((now, true, 0)),
            &HashMap::new(),
        );
        let (confidence, reason) = ok.gated_confidence("high");
        assert_eq!(confidence, "high");
        assert!(reason.is_none());
    }
}
