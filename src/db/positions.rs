use super::{get_dec, get_ts_opt, Datastore};
use crate::models::RecommendedAction;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Live position for one `(wallet, netuid)` pair. At most one row per
/// pair; a drained position keeps its row with unrealized fields zeroed
/// so realized-pnl queries survive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub wallet_address: String,
    pub netuid: i64,
    pub subnet_name: Option<String>,
    pub alpha_balance: Decimal,
    pub alpha_purchased: Decimal,
    pub total_yield_alpha: Decimal,
    pub tao_value_mid: Decimal,
    pub tao_value_exec_50pct: Decimal,
    pub tao_value_exec_100pct: Decimal,
    pub entry_price_tao: Decimal,
    pub entry_date: Option<DateTime<Utc>>,
    pub cost_basis_tao: Decimal,
    pub cost_basis_usd: Decimal,
    pub exit_slippage_50pct: Decimal,
    pub exit_slippage_100pct: Decimal,
    pub unrealized_pnl_tao: Decimal,
    pub unrealized_pnl_pct: Decimal,
    pub unrealized_yield_tao: Decimal,
    pub unrealized_alpha_pnl_tao: Decimal,
    pub total_unrealized_pnl_tao: Decimal,
    pub realized_pnl_tao: Decimal,
    pub realized_yield_tao: Decimal,
    pub realized_alpha_pnl_tao: Decimal,
    pub validator_hotkey: Option<String>,
    pub recommended_action: Option<RecommendedAction>,
    pub action_reason: Option<String>,
}

impl PositionRecord {
    pub fn new(wallet: &str, netuid: i64) -> Self {
        Self {
            wallet_address: wallet.to_string(),
            netuid,
            subnet_name: None,
            alpha_balance: Decimal::ZERO,
            alpha_purchased: Decimal::ZERO,
            total_yield_alpha: Decimal::ZERO,
            tao_value_mid: Decimal::ZERO,
            tao_value_exec_50pct: Decimal::ZERO,
            tao_value_exec_100pct: Decimal::ZERO,
            entry_price_tao: Decimal::ZERO,
            entry_date: None,
            cost_basis_tao: Decimal::ZERO,
            cost_basis_usd: Decimal::ZERO,
            exit_slippage_50pct: Decimal::ZERO,
            exit_slippage_100pct: Decimal::ZERO,
            unrealized_pnl_tao: Decimal::ZERO,
            unrealized_pnl_pct: Decimal::ZERO,
            unrealized_yield_tao: Decimal::ZERO,
            unrealized_alpha_pnl_tao: Decimal::ZERO,
            total_unrealized_pnl_tao: Decimal::ZERO,
            realized_pnl_tao: Decimal::ZERO,
            realized_yield_tao: Decimal::ZERO,
            realized_alpha_pnl_tao: Decimal::ZERO,
            validator_hotkey: None,
            recommended_action: None,
            action_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.alpha_balance > Decimal::ZERO
    }

    /// Current alpha price implied by the mid valuation.
    pub fn current_alpha_price(&self) -> Decimal {
        if self.alpha_balance > Decimal::ZERO && self.tao_value_mid > Decimal::ZERO {
            self.tao_value_mid / self.alpha_balance
        } else {
            Decimal::ZERO
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshotRecord {
    pub wallet_address: String,
    pub netuid: i64,
    pub ts: DateTime<Utc>,
    pub alpha_balance: Decimal,
    pub tao_value_mid: Decimal,
    pub tao_value_exec_50pct: Decimal,
    pub tao_value_exec_100pct: Decimal,
    pub alpha_price_tao: Decimal,
}

const POSITION_COLUMNS: &str = "wallet_address, netuid, subnet_name, alpha_balance, \
     alpha_purchased, total_yield_alpha, tao_value_mid, tao_value_exec_50pct, \
     tao_value_exec_100pct, entry_price_tao, entry_date, cost_basis_tao, cost_basis_usd, \
     exit_slippage_50pct, exit_slippage_100pct, unrealized_pnl_tao, unrealized_pnl_pct, \
     unrealized_yield_tao, unrealized_alpha_pnl_tao, total_unrealized_pnl_tao, \
     realized_pnl_tao, realized_yield_tao, realized_alpha_pnl_tao, validator_hotkey, \
     recommended_action, action_reason";

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<PositionRecord> {
    let action_raw: Option<String> = row.get(24)?;
    Ok(PositionRecord {
        wallet_address: row.get(0)?,
        netuid: row.get(1)?,
        subnet_name: row.get(2)?,
        alpha_balance: get_dec(row, 3)?,
        alpha_purchased: get_dec(row, 4)?,
        total_yield_alpha: get_dec(row, 5)?,
        tao_value_mid: get_dec(row, 6)?,
        tao_value_exec_50pct: get_dec(row, 7)?,
        tao_value_exec_100pct: get_dec(row, 8)?,
        entry_price_tao: get_dec(row, 9)?,
        entry_date: get_ts_opt(row, 10)?,
        cost_basis_tao: get_dec(row, 11)?,
        cost_basis_usd: get_dec(row, 12)?,
        exit_slippage_50pct: get_dec(row, 13)?,
        exit_slippage_100pct: get_dec(row, 14)?,
        unrealized_pnl_tao: get_dec(row, 15)?,
        unrealized_pnl_pct: get_dec(row, 16)?,
        unrealized_yield_tao: get_dec(row, 17)?,
        unrealized_alpha_pnl_tao: get_dec(row, 18)?,
        total_unrealized_pnl_tao: get_dec(row, 19)?,
        realized_pnl_tao: get_dec(row, 20)?,
        realized_yield_tao: get_dec(row, 21)?,
        realized_alpha_pnl_tao: get_dec(row, 22)?,
        validator_hotkey: row.get(23)?,
        recommended_action: action_raw.and_then(|s| match s.as_str() {
            "hold" => Some(RecommendedAction::Hold),
            "add" => Some(RecommendedAction::Add),
            "trim" => Some(RecommendedAction::Trim),
            "exit" => Some(RecommendedAction::Exit),
            _ => None,
        }),
        action_reason: row.get(25)?,
    })
}

impl Datastore {
    /// Replace a wallet's live balances in one transaction.
    ///
    /// Rows in `fresh` are upserted; existing rows absent from `fresh`
    /// are drained (balance and unrealized fields zeroed), never deleted,
    /// so their cost-basis linkage survives.
    pub async fn apply_position_balances(
        &self,
        wallet: &str,
        fresh: &[PositionRecord],
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;

        {
            let mut upsert = tx.prepare_cached(
                "INSERT INTO positions (wallet_address, netuid, subnet_name, alpha_balance, \
                 tao_value_mid, entry_date, validator_hotkey, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(wallet_address, netuid) DO UPDATE SET
                    subnet_name = COALESCE(excluded.subnet_name, positions.subnet_name),
                    alpha_balance = excluded.alpha_balance,
                    tao_value_mid = excluded.tao_value_mid,
                    entry_date = COALESCE(positions.entry_date, excluded.entry_date),
                    validator_hotkey = COALESCE(excluded.validator_hotkey, positions.validator_hotkey),
                    updated_at = excluded.updated_at",
            )?;
            for rec in fresh {
                upsert.execute(params![
                    wallet,
                    rec.netuid,
                    rec.subnet_name,
                    rec.alpha_balance.to_string(),
                    rec.tao_value_mid.to_string(),
                    rec.entry_date.map(|t| t.timestamp()),
                    rec.validator_hotkey,
                    now,
                ])?;
            }

            let netuids: Vec<i64> = fresh.iter().map(|r| r.netuid).collect();
            let mut drain = tx.prepare_cached(
                "UPDATE positions SET
                    alpha_balance = '0', tao_value_mid = '0',
                    tao_value_exec_50pct = '0', tao_value_exec_100pct = '0',
                    unrealized_pnl_tao = '0', unrealized_pnl_pct = '0',
                    unrealized_yield_tao = '0', unrealized_alpha_pnl_tao = '0',
                    total_unrealized_pnl_tao = '0', updated_at = ?2
                 WHERE wallet_address = ?1 AND netuid = ?3",
            )?;
            let mut existing = tx.prepare_cached(
                "SELECT netuid FROM positions WHERE wallet_address = ?1",
            )?;
            let stored: Vec<i64> = existing
                .query_map(params![wallet], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            for netuid in stored {
                if !netuids.contains(&netuid) {
                    drain.execute(params![wallet, now, netuid])?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    pub async fn get_position(&self, wallet: &str, netuid: i64) -> Result<Option<PositionRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions
             WHERE wallet_address = ?1 AND netuid = ?2"
        ))?;
        let mut rows = stmt.query(params![wallet, netuid])?;
        match rows.next()? {
            Some(row) => Ok(Some(position_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// All rows for a wallet, drained ones included.
    pub async fn list_positions(&self, wallet: &str) -> Result<Vec<PositionRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions
             WHERE wallet_address = ?1 ORDER BY netuid ASC"
        ))?;
        let rows = stmt.query_map(params![wallet], |row| position_from_row(row))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Positions with a live alpha balance.
    pub async fn list_active_positions(&self, wallet: &str) -> Result<Vec<PositionRecord>> {
        Ok(self
            .list_positions(wallet)
            .await?
            .into_iter()
            .filter(|p| p.is_active())
            .collect())
    }

    /// Write back the fields the accounting pipeline derives.
    pub async fn update_position_accounting(&self, rec: &PositionRecord) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.lock().await;
        conn.execute(
            "UPDATE positions SET
                alpha_purchased = ?3, total_yield_alpha = ?4,
                entry_price_tao = ?5, cost_basis_tao = ?6, cost_basis_usd = ?7,
                unrealized_pnl_tao = ?8, unrealized_pnl_pct = ?9,
                unrealized_yield_tao = ?10, unrealized_alpha_pnl_tao = ?11,
                total_unrealized_pnl_tao = ?12,
                realized_pnl_tao = ?13, realized_yield_tao = ?14,
                realized_alpha_pnl_tao = ?15,
                updated_at = ?16
             WHERE wallet_address = ?1 AND netuid = ?2",
            params![
                rec.wallet_address,
                rec.netuid,
                rec.alpha_purchased.to_string(),
                rec.total_yield_alpha.to_string(),
                rec.entry_price_tao.to_string(),
                rec.cost_basis_tao.to_string(),
                rec.cost_basis_usd.to_string(),
                rec.unrealized_pnl_tao.to_string(),
                rec.unrealized_pnl_pct.to_string(),
                rec.unrealized_yield_tao.to_string(),
                rec.unrealized_alpha_pnl_tao.to_string(),
                rec.total_unrealized_pnl_tao.to_string(),
                rec.realized_pnl_tao.to_string(),
                rec.realized_yield_tao.to_string(),
                rec.realized_alpha_pnl_tao.to_string(),
                now,
            ],
        )?;
        Ok(())
    }

    /// Write back executable values and exit slippages (deep tier).
    pub async fn update_position_exec_values(
        &self,
        wallet: &str,
        netuid: i64,
        exec_50: Decimal,
        exec_100: Decimal,
        slip_50: Decimal,
        slip_100: Decimal,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.lock().await;
        conn.execute(
            "UPDATE positions SET
                tao_value_exec_50pct = ?3, tao_value_exec_100pct = ?4,
                exit_slippage_50pct = ?5, exit_slippage_100pct = ?6, updated_at = ?7
             WHERE wallet_address = ?1 AND netuid = ?2",
            params![
                wallet,
                netuid,
                exec_50.to_string(),
                exec_100.to_string(),
                slip_50.to_string(),
                slip_100.to_string(),
                now,
            ],
        )?;
        Ok(())
    }

    pub async fn update_position_recommendation(
        &self,
        wallet: &str,
        netuid: i64,
        action: RecommendedAction,
        reason: &str,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.lock().await;
        conn.execute(
            "UPDATE positions SET recommended_action = ?3, action_reason = ?4, updated_at = ?5
             WHERE wallet_address = ?1 AND netuid = ?2",
            params![wallet, netuid, action.as_str(), reason, now],
        )?;
        Ok(())
    }

    pub async fn insert_position_snapshot(&self, snap: &PositionSnapshotRecord) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO position_snapshots (wallet_address, netuid, ts, alpha_balance, \
             tao_value_mid, tao_value_exec_50pct, tao_value_exec_100pct, alpha_price_tao)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                snap.wallet_address,
                snap.netuid,
                snap.ts.timestamp(),
                snap.alpha_balance.to_string(),
                snap.tao_value_mid.to_string(),
                snap.tao_value_exec_50pct.to_string(),
                snap.tao_value_exec_100pct.to_string(),
                snap.alpha_price_tao.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Closest snapshot at or before `at` for one position. Earnings
    /// windows anchor on these.
    pub async fn position_snapshot_on_or_before(
        &self,
        wallet: &str,
        netuid: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<PositionSnapshotRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT wallet_address, netuid, ts, alpha_balance, tao_value_mid, \
             tao_value_exec_50pct, tao_value_exec_100pct, alpha_price_tao
             FROM position_snapshots
             WHERE wallet_address = ?1 AND netuid = ?2 AND ts <= ?3
             ORDER BY ts DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![wallet, netuid, at.timestamp()])?;
        match rows.next()? {
            Some(row) => Ok(Some(PositionSnapshotRecord {
                wallet_address: row.get(0)?,
                netuid: row.get(1)?,
                ts: super::get_ts(row, 2)?,
                alpha_balance: get_dec(row, 3)?,
                tao_value_mid: get_dec(row, 4)?,
                tao_value_exec_50pct: get_dec(row, 5)?,
                tao_value_exec_100pct: get_dec(row, 6)?,
                alpha_price_tao: get_dec(row, 7)?,
            })),
            None => Ok(None),
        }
    }

    /// Distinct netuids with any snapshot for the wallet.
    pub async fn snapshot_netuids(&self, wallet: &str) -> Result<Vec<i64>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT netuid FROM position_snapshots
             WHERE wallet_address = ?1 ORDER BY netuid ASC",
        )?;
        let rows = stmt.query_map(params![wallet], |row| row.get(0))?;
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
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn fresh_position(wallet: &str, netuid: i64, alpha: Decimal, mid: Decimal) -> PositionRecord {
        let mut rec = PositionRecord::new(wallet, netuid);
        rec.alpha_balance = alpha;
        rec.tao_value_mid = mid;
        rec
    }

    #[tokio::test]
    async fn drained_positions_are_zeroed_not_deleted() {
        let store = Datastore::open_in_memory().unwrap();
        let fresh = vec![
            fresh_position("5W", 1, dec!(100), dec!(200)),
            fresh_position("5W", 2, dec!(50), dec!(25)),
        ];
        store.apply_position_balances("5W", &fresh).await.unwrap();

        // Next refresh only sees subnet 1.
        let fresh = vec![fresh_position("5W", 1, dec!(100), dec!(210))];
        store.apply_position_balances("5W", &fresh).await.unwrap();

        let all = store.list_positions("5W").await.unwrap();
        assert_eq!(all.len(), 2);
        let drained = all.iter().find(|p| p.netuid == 2).unwrap();
        assert_eq!(drained.alpha_balance, Decimal::ZERO);
        assert_eq!(drained.tao_value_mid, Decimal::ZERO);
        assert!(!drained.is_active());

        let active = store.list_active_positions("5W").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].tao_value_mid, dec!(210));
    }

    #[tokio::test]
    async fn unique_wallet_netuid_is_upsert_not_duplicate() {
        let store = Datastore::open_in_memory().unwrap();
        for _ in 0..3 {
            let fresh = vec![fresh_position("5W", 4, dec!(10), dec!(20))];
            store.apply_position_balances("5W", &fresh).await.unwrap();
        }
        assert_eq!(store.list_positions("5W").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_on_or_before_picks_closest() {
        let store = Datastore::open_in_memory().unwrap();
        for (day, value) in [(1, dec!(100)), (5, dec!(150)), (9, dec!(130))] {
            let snap = PositionSnapshotRecord {
                wallet_address: "5W".into(),
                netuid: 1,
                ts: Utc.with_ymd_and_hms(2025, 6, day, 0, 0, 0).unwrap(),
                alpha_balance: dec!(1),
                tao_value_mid: value,
                tao_value_exec_50pct: value,
                tao_value_exec_100pct: value,
                alpha_price_tao: dec!(1),
            };
            store.insert_position_snapshot(&snap).await.unwrap();
        }

        let at = Utc.with_ymd_and_hms(2025, 6, 7, 12, 0, 0).unwrap();
        let snap = store
            .position_snapshot_on_or_before("5W", 1, at)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snap.tao_value_mid, dec!(150));

        let too_early = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
        assert!(store
            .position_snapshot_on_or_before("5W", 1, too_early)
            .await
            .unwrap()
            .is_none());
    }
}
