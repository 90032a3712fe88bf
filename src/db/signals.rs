use super::{get_ts, Datastore};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

/// Persisted result of a named analytical signal run. The trust gate is
/// the one signal this core evaluates itself; others only read the gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRunRecord {
    pub signal_id: String,
    pub ts: DateTime<Utc>,
    pub status: String,
    pub confidence: String,
    pub summary: String,
    pub evidence_json: String,
    pub guardrails_json: String,
}

impl Datastore {
    pub async fn insert_signal_run(&self, rec: &SignalRunRecord) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO signal_runs
             (signal_id, ts, status, confidence, summary, evidence_json, guardrails_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rec.signal_id,
                rec.ts.timestamp(),
                rec.status,
                rec.confidence,
                rec.summary,
                rec.evidence_json,
                rec.guardrails_json,
            ],
        )?;
        Ok(())
    }

    pub async fn latest_signal_run(&self, signal_id: &str) -> Result<Option<SignalRunRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT signal_id, ts, status, confidence, summary, evidence_json, guardrails_json
             FROM signal_runs WHERE signal_id = ?1 ORDER BY ts DESC, id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![signal_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(SignalRunRecord {
                signal_id: row.get(0)?,
                ts: get_ts(row, 1)?,
                status: row.get(2)?,
                confidence: row.get(3)?,
                summary: row.get(4)?,
                evidence_json: row.get(5)?,
                guardrails_json: row.get(6)?,
            })),
            None => Ok(None),
        }
    }
}
