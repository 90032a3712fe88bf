use super::{get_dec, get_ts, Datastore};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Persisted result of one reconciliation run. Per-check details are a
/// JSON array (`ReconCheck` in the reconciliation module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationRunRecord {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub wallet_address: String,
    pub passed: bool,
    pub total_checks: i64,
    pub passed_checks: i64,
    pub failed_checks: i64,
    pub total_stored_value_tao: Decimal,
    pub total_live_value_tao: Decimal,
    pub total_diff_tao: Decimal,
    pub total_diff_pct: Decimal,
    pub checks_json: String,
    pub error_message: Option<String>,
    pub absolute_tolerance_tao: Decimal,
    pub relative_tolerance_pct: Decimal,
}

impl Datastore {
    pub async fn insert_reconciliation_run(&self, rec: &ReconciliationRunRecord) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO reconciliation_runs
             (run_id, created_at, wallet_address, passed, total_checks, passed_checks, \
              failed_checks, total_stored_value_tao, total_live_value_tao, total_diff_tao, \
              total_diff_pct, checks_json, error_message, absolute_tolerance_tao, \
              relative_tolerance_pct)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                rec.run_id,
                rec.created_at.timestamp(),
                rec.wallet_address,
                rec.passed as i64,
                rec.total_checks,
                rec.passed_checks,
                rec.failed_checks,
                rec.total_stored_value_tao.to_string(),
                rec.total_live_value_tao.to_string(),
                rec.total_diff_tao.to_string(),
                rec.total_diff_pct.to_string(),
                rec.checks_json,
                rec.error_message,
                rec.absolute_tolerance_tao.to_string(),
                rec.relative_tolerance_pct.to_string(),
            ],
        )?;
        Ok(())
    }

    pub async fn latest_reconciliation_run(
        &self,
        wallet: &str,
    ) -> Result<Option<ReconciliationRunRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT run_id, created_at, wallet_address, passed, total_checks, passed_checks, \
             failed_checks, total_stored_value_tao, total_live_value_tao, total_diff_tao, \
             total_diff_pct, checks_json, error_message, absolute_tolerance_tao, \
             relative_tolerance_pct
             FROM reconciliation_runs WHERE wallet_address = ?1
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![wallet])?;
        match rows.next()? {
            Some(row) => Ok(Some(ReconciliationRunRecord {
                run_id: row.get(0)?,
                created_at: get_ts(row, 1)?,
                wallet_address: row.get(2)?,
                passed: row.get::<_, i64>(3)? != 0,
                total_checks: row.get(4)?,
                passed_checks: row.get(5)?,
                failed_checks: row.get(6)?,
                total_stored_value_tao: get_dec(row, 7)?,
                total_live_value_tao: get_dec(row, 8)?,
                total_diff_tao: get_dec(row, 9)?,
                total_diff_pct: get_dec(row, 10)?,
                checks_json: row.get(11)?,
                error_message: row.get(12)?,
                absolute_tolerance_tao: get_dec(row, 13)?,
                relative_tolerance_pct: get_dec(row, 14)?,
            })),
            None => Ok(None),
        }
    }
}
