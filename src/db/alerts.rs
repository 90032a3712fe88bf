use super::{get_dec, get_ts, Datastore};
use crate::models::{GateState, RecommendedAction};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Risk alert raised during the full-tier risk pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub ts: DateTime<Utc>,
    pub severity: String,
    pub kind: String,
    pub wallet_address: Option<String>,
    pub netuid: Option<i64>,
    pub message: String,
    /// Reference to the data snapshot the alert was computed from.
    pub snapshot_ref: Option<String>,
}

/// Audit entry for an emitted rebalance plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionLogRecord {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub wallet_address: String,
    pub trigger: String,
    pub summary: String,
    pub details: Option<String>,
    pub snapshot_ref: Option<String>,
}

/// Advisory trade recommendation. Never auto-executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecommendationRecord {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub wallet_address: String,
    pub netuid: i64,
    pub action: RecommendedAction,
    pub size_tao: Decimal,
    pub reason: String,
    pub confidence: String,
    pub gate_state: GateState,
    pub snapshot_ref: Option<String>,
}

impl Datastore {
    pub async fn insert_alert(&self, rec: &AlertRecord) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO alerts (ts, severity, kind, wallet_address, netuid, message, snapshot_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rec.ts.timestamp(),
                rec.severity,
                rec.kind,
                rec.wallet_address,
                rec.netuid,
                rec.message,
                rec.snapshot_ref,
            ],
        )?;
        Ok(())
    }

    pub async fn list_recent_alerts(&self, limit: usize) -> Result<Vec<AlertRecord>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT ts, severity, kind, wallet_address, netuid, message, snapshot_ref
             FROM alerts ORDER BY ts DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(AlertRecord {
                ts: get_ts(row, 0)?,
                severity: row.get(1)?,
                kind: row.get(2)?,
                wallet_address: row.get(3)?,
                netuid: row.get(4)?,
                message: row.get(5)?,
                snapshot_ref: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn insert_decision(&self, rec: &DecisionLogRecord) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO decision_log
             (id, ts, wallet_address, trigger, summary, details, snapshot_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rec.id,
                rec.ts.timestamp(),
                rec.wallet_address,
                rec.trigger,
                rec.summary,
                rec.details,
                rec.snapshot_ref,
            ],
        )?;
        Ok(())
    }

    pub async fn insert_trade_recommendation(
        &self,
        rec: &TradeRecommendationRecord,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO trade_recommendations
             (id, ts, wallet_address, netuid, action, size_tao, reason, confidence, gate_state, snapshot_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                rec.id,
                rec.ts.timestamp(),
                rec.wallet_address,
                rec.netuid,
                rec.action.as_str(),
                rec.size_tao.to_string(),
                rec.reason,
                rec.confidence,
                rec.gate_state.as_str(),
                rec.snapshot_ref,
            ],
        )?;
        Ok(())
    }

    pub async fn list_trade_recommendations(
        &self,
        wallet: &str,
        limit: usize,
    ) -> Result<Vec<TradeRecommendationRecord>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, ts, wallet_address, netuid, action, size_tao, reason, confidence, \
             gate_state, snapshot_ref
             FROM trade_recommendations WHERE wallet_address = ?1
             ORDER BY ts DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![wallet, limit], |row| {
            let action_raw: String = row.get(4)?;
            let gate_raw: String = row.get(8)?;
            Ok(TradeRecommendationRecord {
                id: row.get(0)?,
                ts: get_ts(row, 1)?,
                wallet_address: row.get(2)?,
                netuid: row.get(3)?,
                action: match action_raw.as_str() {
                    "add" => RecommendedAction::Add,
                    "trim" => RecommendedAction::Trim,
                    "exit" => RecommendedAction::Exit,
                    _ => RecommendedAction::Hold,
                },
                size_tao: get_dec(row, 5)?,
                reason: row.get(6)?,
                confidence: row.get(7)?,
                gate_state: match gate_raw.as_str() {
                    "blocked" => GateState::Blocked,
                    "degraded" => GateState::Degraded,
                    _ => GateState::Ok,
                },
                snapshot_ref: row.get(9)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn alerts_store_and_list_newest_first() {
        let store = Datastore::open_in_memory().unwrap();
        for (i, kind) in ["drawdown_soft", "slippage_cap"].iter().enumerate() {
            store
                .insert_alert(&AlertRecord {
                    ts: Utc::now() + chrono::Duration::seconds(i as i64),
                    severity: "warning".into(),
                    kind: kind.to_string(),
                    wallet_address: Some("5W".into()),
                    netuid: Some(1),
                    message: format!("{kind} breached"),
                    snapshot_ref: None,
                })
                .await
                .unwrap();
        }
        let alerts = store.list_recent_alerts(10).await.unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].kind, "slippage_cap");
    }

    #[tokio::test]
    async fn recommendations_round_trip() {
        let store = Datastore::open_in_memory().unwrap();
        store
            .insert_trade_recommendation(&TradeRecommendationRecord {
                id: "rec-1".into(),
                ts: Utc::now(),
                wallet_address: "5W".into(),
                netuid: 8,
                action: RecommendedAction::Trim,
                size_tao: dec!(12.5),
                reason: "quarantine regime trim".into(),
                confidence: "low".into(),
                gate_state: GateState::Degraded,
                snapshot_ref: Some("snap-77".into()),
            })
            .await
            .unwrap();

        let recs = store.list_trade_recommendations("5W", 10).await.unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].action, RecommendedAction::Trim);
        assert_eq!(recs[0].gate_state, GateState::Degraded);
        assert_eq!(recs[0].size_tao, dec!(12.5));
    }
}
