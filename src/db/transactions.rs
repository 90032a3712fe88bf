use super::{get_dec, get_dec_opt, get_ts, get_ts_opt, Datastore};
use crate::models::TxType;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Immutable stake/unstake transaction keyed by extrinsic id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakeTransactionRecord {
    pub wallet_address: String,
    pub extrinsic_id: String,
    pub block_number: i64,
    pub ts: DateTime<Utc>,
    pub tx_hash: Option<String>,
    pub tx_type: TxType,
    pub call_name: String,
    pub netuid: i64,
    pub hotkey: Option<String>,
    pub amount_rao: i64,
    pub amount_tao: Decimal,
    pub alpha_amount: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub usd_value: Option<Decimal>,
    pub fee_tao: Decimal,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Derived FIFO aggregates for one `(wallet, netuid)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostBasisRecord {
    pub wallet_address: String,
    pub netuid: i64,
    pub total_staked_tao: Decimal,
    pub total_unstaked_tao: Decimal,
    pub net_invested_tao: Decimal,
    pub alpha_purchased: Decimal,
    pub weighted_avg_entry_price: Decimal,
    pub realized_pnl_tao: Decimal,
    pub realized_yield_tao: Decimal,
    pub realized_yield_alpha: Decimal,
    pub total_fees_tao: Decimal,
    pub total_staked_usd: Decimal,
    pub total_unstaked_usd: Decimal,
    pub usd_cost_basis: Decimal,
    pub realized_pnl_usd: Decimal,
    pub stake_count: i64,
    pub unstake_count: i64,
    pub first_stake_at: Option<DateTime<Utc>>,
    pub last_transaction_at: Option<DateTime<Utc>>,
    pub computed_at: DateTime<Utc>,
}

/// Delegation event: stake/unstake plus reward credits. Ground truth for
/// yield reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationEventRecord {
    pub wallet_address: String,
    pub event_id: String,
    pub block_number: i64,
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub action: String,
    pub netuid: i64,
    pub hotkey: Option<String>,
    pub amount_tao: Decimal,
    pub alpha_amount: Option<Decimal>,
    pub usd_value: Option<Decimal>,
    pub is_reward: bool,
}

/// Daily yield row per position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YieldHistoryRecord {
    pub wallet_address: String,
    pub netuid: i64,
    /// Day bucket as `YYYY-MM-DD`.
    pub date: String,
    pub alpha_balance_start: Decimal,
    pub alpha_balance_end: Decimal,
    pub tao_value_start: Decimal,
    pub tao_value_end: Decimal,
    pub yield_alpha: Decimal,
    pub yield_tao: Decimal,
    pub net_stake_tao: Decimal,
    pub daily_apy: Decimal,
}

fn tx_from_row(row: &Row<'_>) -> rusqlite::Result<StakeTransactionRecord> {
    let tx_type_raw: String = row.get(5)?;
    Ok(StakeTransactionRecord {
        wallet_address: row.get(0)?,
        extrinsic_id: row.get(1)?,
        block_number: row.get(2)?,
        ts: get_ts(row, 3)?,
        tx_hash: row.get(4)?,
        tx_type: tx_type_raw.parse().unwrap_or(TxType::Stake),
        call_name: row.get(6)?,
        netuid: row.get(7)?,
        hotkey: row.get(8)?,
        amount_rao: row.get(9)?,
        amount_tao: get_dec(row, 10)?,
        alpha_amount: get_dec_opt(row, 11)?,
        limit_price: get_dec_opt(row, 12)?,
        usd_value: get_dec_opt(row, 13)?,
        fee_tao: get_dec(row, 14)?,
        success: row.get::<_, i64>(15)? != 0,
        error_message: row.get(16)?,
    })
}

const TX_COLUMNS: &str = "wallet_address, extrinsic_id, block_number, ts, tx_hash, tx_type, \
     call_name, netuid, hotkey, amount_rao, amount_tao, alpha_amount, limit_price, usd_value, \
     fee_tao, success, error_message";

impl Datastore {
    /// Insert transactions, skipping extrinsic ids already present.
    /// Returns (inserted count, netuids touched by new rows).
    pub async fn insert_stake_transactions(
        &self,
        txs: &[StakeTransactionRecord],
    ) -> Result<(usize, Vec<i64>)> {
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        let mut touched: BTreeSet<i64> = BTreeSet::new();

        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO stake_transactions
                 (wallet_address, extrinsic_id, block_number, ts, tx_hash, tx_type, call_name, \
                  netuid, hotkey, amount_rao, amount_tao, alpha_amount, limit_price, usd_value, \
                  fee_tao, success, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            )?;
            for rec in txs {
                let changed = stmt.execute(params![
                    rec.wallet_address,
                    rec.extrinsic_id,
                    rec.block_number,
                    rec.ts.timestamp(),
                    rec.tx_hash,
                    rec.tx_type.as_str(),
                    rec.call_name,
                    rec.netuid,
                    rec.hotkey,
                    rec.amount_rao,
                    rec.amount_tao.to_string(),
                    rec.alpha_amount.map(|d| d.to_string()),
                    rec.limit_price.map(|d| d.to_string()),
                    rec.usd_value.map(|d| d.to_string()),
                    rec.fee_tao.to_string(),
                    rec.success as i64,
                    rec.error_message,
                ])?;
                if changed > 0 {
                    inserted += 1;
                    touched.insert(rec.netuid);
                }
            }
        }

        tx.commit()?;
        Ok((inserted, touched.into_iter().collect()))
    }

    /// Highest synced block for incremental extrinsic fetches.
    pub async fn max_transaction_block(&self, wallet: &str) -> Result<i64> {
        let conn = self.lock().await;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(block_number) FROM stake_transactions WHERE wallet_address = ?1",
            params![wallet],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    /// Successful transactions for one position in FIFO replay order.
    pub async fn list_position_transactions(
        &self,
        wallet: &str,
        netuid: i64,
    ) -> Result<Vec<StakeTransactionRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {TX_COLUMNS} FROM stake_transactions
             WHERE wallet_address = ?1 AND netuid = ?2 AND success = 1
             ORDER BY block_number ASC, ts ASC"
        ))?;
        let rows = stmt.query_map(params![wallet, netuid], |row| tx_from_row(row))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Successful transactions for a wallet inside a time window.
    pub async fn list_transactions_in_window(
        &self,
        wallet: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StakeTransactionRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {TX_COLUMNS} FROM stake_transactions
             WHERE wallet_address = ?1 AND success = 1 AND ts > ?2 AND ts <= ?3
             ORDER BY block_number ASC, ts ASC"
        ))?;
        let rows = stmt.query_map(
            params![wallet, start.timestamp(), end.timestamp()],
            |row| tx_from_row(row),
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn upsert_cost_basis(&self, rec: &CostBasisRecord) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO position_cost_basis
             (wallet_address, netuid, total_staked_tao, total_unstaked_tao, net_invested_tao, \
              alpha_purchased, weighted_avg_entry_price, realized_pnl_tao, realized_yield_tao, \
              realized_yield_alpha, total_fees_tao, total_staked_usd, total_unstaked_usd, \
              usd_cost_basis, realized_pnl_usd, stake_count, unstake_count, first_stake_at, \
              last_transaction_at, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
             ON CONFLICT(wallet_address, netuid) DO UPDATE SET
                total_staked_tao = excluded.total_staked_tao,
                total_unstaked_tao = excluded.total_unstaked_tao,
                net_invested_tao = excluded.net_invested_tao,
                alpha_purchased = excluded.alpha_purchased,
                weighted_avg_entry_price = excluded.weighted_avg_entry_price,
                realized_pnl_tao = excluded.realized_pnl_tao,
                realized_yield_tao = excluded.realized_yield_tao,
                realized_yield_alpha = excluded.realized_yield_alpha,
                total_fees_tao = excluded.total_fees_tao,
                total_staked_usd = excluded.total_staked_usd,
                total_unstaked_usd = excluded.total_unstaked_usd,
                usd_cost_basis = excluded.usd_cost_basis,
                realized_pnl_usd = excluded.realized_pnl_usd,
                stake_count = excluded.stake_count,
                unstake_count = excluded.unstake_count,
                first_stake_at = excluded.first_stake_at,
                last_transaction_at = excluded.last_transaction_at,
                computed_at = excluded.computed_at",
            params![
                rec.wallet_address,
                rec.netuid,
                rec.total_staked_tao.to_string(),
                rec.total_unstaked_tao.to_string(),
                rec.net_invested_tao.to_string(),
                rec.alpha_purchased.to_string(),
                rec.weighted_avg_entry_price.to_string(),
                rec.realized_pnl_tao.to_string(),
                rec.realized_yield_tao.to_string(),
                rec.realized_yield_alpha.to_string(),
                rec.total_fees_tao.to_string(),
                rec.total_staked_usd.to_string(),
                rec.total_unstaked_usd.to_string(),
                rec.usd_cost_basis.to_string(),
                rec.realized_pnl_usd.to_string(),
                rec.stake_count,
                rec.unstake_count,
                rec.first_stake_at.map(|t| t.timestamp()),
                rec.last_transaction_at.map(|t| t.timestamp()),
                rec.computed_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_cost_basis(&self, wallet: &str, netuid: i64) -> Result<Option<CostBasisRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT wallet_address, netuid, total_staked_tao, total_unstaked_tao, \
             net_invested_tao, alpha_purchased, weighted_avg_entry_price, realized_pnl_tao, \
             realized_yield_tao, realized_yield_alpha, total_fees_tao, total_staked_usd, \
             total_unstaked_usd, usd_cost_basis, realized_pnl_usd, stake_count, unstake_count, \
             first_stake_at, last_transaction_at, computed_at
             FROM position_cost_basis WHERE wallet_address = ?1 AND netuid = ?2",
        )?;
        let mut rows = stmt.query(params![wallet, netuid])?;
        match rows.next()? {
            Some(row) => Ok(Some(CostBasisRecord {
                wallet_address: row.get(0)?,
                netuid: row.get(1)?,
                total_staked_tao: get_dec(row, 2)?,
                total_unstaked_tao: get_dec(row, 3)?,
                net_invested_tao: get_dec(row, 4)?,
                alpha_purchased: get_dec(row, 5)?,
                weighted_avg_entry_price: get_dec(row, 6)?,
                realized_pnl_tao: get_dec(row, 7)?,
                realized_yield_tao: get_dec(row, 8)?,
                realized_yield_alpha: get_dec(row, 9)?,
                total_fees_tao: get_dec(row, 10)?,
                total_staked_usd: get_dec(row, 11)?,
                total_unstaked_usd: get_dec(row, 12)?,
                usd_cost_basis: get_dec(row, 13)?,
                realized_pnl_usd: get_dec(row, 14)?,
                stake_count: row.get(15)?,
                unstake_count: row.get(16)?,
                first_stake_at: get_ts_opt(row, 17)?,
                last_transaction_at: get_ts_opt(row, 18)?,
                computed_at: get_ts(row, 19)?,
            })),
            None => Ok(None),
        }
    }

    pub async fn insert_delegation_events(
        &self,
        events: &[DelegationEventRecord],
    ) -> Result<usize> {
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO delegation_events
                 (wallet_address, event_id, block_number, ts, event_type, action, netuid, \
                  hotkey, amount_tao, alpha_amount, usd_value, is_reward)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for rec in events {
                inserted += stmt.execute(params![
                    rec.wallet_address,
                    rec.event_id,
                    rec.block_number,
                    rec.ts.timestamp(),
                    rec.event_type,
                    rec.action,
                    rec.netuid,
                    rec.hotkey,
                    rec.amount_tao.to_string(),
                    rec.alpha_amount.map(|d| d.to_string()),
                    rec.usd_value.map(|d| d.to_string()),
                    rec.is_reward as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Reward credits (emission alpha) for one position, ascending.
    /// Ground truth for the emission-first attribution on unstakes.
    pub async fn list_reward_credits(
        &self,
        wallet: &str,
        netuid: i64,
    ) -> Result<Vec<(DateTime<Utc>, Decimal)>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT ts, COALESCE(alpha_amount, '0') FROM delegation_events
             WHERE wallet_address = ?1 AND netuid = ?2 AND is_reward = 1
             ORDER BY ts ASC",
        )?;
        let rows = stmt.query_map(params![wallet, netuid], |row| {
            Ok((get_ts(row, 0)?, get_dec(row, 1)?))
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn upsert_yield_history(&self, rec: &YieldHistoryRecord) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO position_yield_history
             (wallet_address, netuid, date, alpha_balance_start, alpha_balance_end, \
              tao_value_start, tao_value_end, yield_alpha, yield_tao, net_stake_tao, daily_apy)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(wallet_address, netuid, date) DO UPDATE SET
                alpha_balance_start = excluded.alpha_balance_start,
                alpha_balance_end = excluded.alpha_balance_end,
                tao_value_start = excluded.tao_value_start,
                tao_value_end = excluded.tao_value_end,
                yield_alpha = excluded.yield_alpha,
                yield_tao = excluded.yield_tao,
                net_stake_tao = excluded.net_stake_tao,
                daily_apy = excluded.daily_apy",
            params![
                rec.wallet_address,
                rec.netuid,
                rec.date,
                rec.alpha_balance_start.to_string(),
                rec.alpha_balance_end.to_string(),
                rec.tao_value_start.to_string(),
                rec.tao_value_end.to_string(),
                rec.yield_alpha.to_string(),
                rec.yield_tao.to_string(),
                rec.net_stake_tao.to_string(),
                rec.daily_apy.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Sum of stored daily TAO yield for a wallet inside a date window
    /// (bounds as `YYYY-MM-DD`, inclusive).
    pub async fn sum_yield_tao(
        &self,
        wallet: &str,
        date_start: &str,
        date_end: &str,
    ) -> Result<Decimal> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT yield_tao FROM position_yield_history
             WHERE wallet_address = ?1 AND date >= ?2 AND date <= ?3",
        )?;
        let rows = stmt.query_map(params![wallet, date_start, date_end], |row| get_dec(row, 0))?;
        let mut total = Decimal::ZERO;
        for r in rows {
            total += r?;
        }
        Ok(total)
    }

    /// Per-netuid yield sums over a date window.
    pub async fn sum_yield_tao_by_netuid(
        &self,
        wallet: &str,
        date_start: &str,
        date_end: &str,
    ) -> Result<Vec<(i64, Decimal)>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT netuid, yield_tao FROM position_yield_history
             WHERE wallet_address = ?1 AND date >= ?2 AND date <= ?3
             ORDER BY netuid ASC",
        )?;
        let rows = stmt.query_map(params![wallet, date_start, date_end], |row| {
            Ok((row.get::<_, i64>(0)?, get_dec(row, 1)?))
        })?;
        let mut sums: Vec<(i64, Decimal)> = Vec::new();
        for r in rows {
            let (netuid, y) = r?;
            match sums.iter_mut().find(|(n, _)| *n == netuid) {
                Some((_, total)) => *total += y,
                None => sums.push((netuid, y)),
            }
        }
        Ok(sums)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    pub(crate) fn tx(
        id: &str,
        block: i64,
        tx_type: TxType,
        netuid: i64,
        amount: Decimal,
        limit_price: Option<Decimal>,
    ) -> StakeTransactionRecord {
        StakeTransactionRecord {
            wallet_address: "5W".into(),
            extrinsic_id: id.into(),
            block_number: block,
            ts: Utc.timestamp_opt(1_700_000_000 + block, 0).unwrap(),
            tx_hash: None,
            tx_type,
            call_name: "SubtensorModule.add_stake_limit".into(),
            netuid,
            hotkey: Some("5Hot".into()),
            amount_rao: crate::units::tao_to_rao(amount),
            amount_tao: amount,
            alpha_amount: None,
            limit_price,
            usd_value: None,
            fee_tao: dec!(0.000125),
            success: true,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn reingest_is_idempotent() {
        let store = Datastore::open_in_memory().unwrap();
        let txs = vec![
            tx("100-1", 100, TxType::Stake, 1, dec!(10), Some(dec!(1))),
            tx("101-1", 101, TxType::Stake, 1, dec!(5), Some(dec!(2))),
        ];
        let (inserted, touched) = store.insert_stake_transactions(&txs).await.unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(touched, vec![1]);

        // Replaying the same stream produces zero new rows.
        let (inserted, touched) = store.insert_stake_transactions(&txs).await.unwrap();
        assert_eq!(inserted, 0);
        assert!(touched.is_empty());

        assert_eq!(store.max_transaction_block("5W").await.unwrap(), 101);
    }

    #[tokio::test]
    async fn replay_order_is_block_then_time() {
        let store = Datastore::open_in_memory().unwrap();
        let txs = vec![
            tx("200-1", 200, TxType::Unstake, 3, dec!(1), None),
            tx("150-1", 150, TxType::Stake, 3, dec!(2), Some(dec!(1))),
        ];
        store.insert_stake_transactions(&txs).await.unwrap();
        let listed = store.list_position_transactions("5W", 3).await.unwrap();
        assert_eq!(listed[0].block_number, 150);
        assert_eq!(listed[1].block_number, 200);
    }

    #[tokio::test]
    async fn yield_history_upserts_by_day() {
        let store = Datastore::open_in_memory().unwrap();
        let mut rec = YieldHistoryRecord {
            wallet_address: "5W".into(),
            netuid: 1,
            date: "2025-06-01".into(),
            alpha_balance_start: dec!(100),
            alpha_balance_end: dec!(101),
            tao_value_start: dec!(200),
            tao_value_end: dec!(203),
            yield_alpha: dec!(1),
            yield_tao: dec!(2),
            net_stake_tao: dec!(0),
            daily_apy: dec!(0.05),
        };
        store.upsert_yield_history(&rec).await.unwrap();
        rec.yield_tao = dec!(3);
        store.upsert_yield_history(&rec).await.unwrap();

        let total = store
            .sum_yield_tao("5W", "2025-06-01", "2025-06-30")
            .await
            .unwrap();
        assert_eq!(total, dec!(3));
    }
}
