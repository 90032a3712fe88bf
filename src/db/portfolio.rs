use super::{get_dec, get_ts, Datastore};
use crate::models::FlowRegime;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Point-in-time portfolio rollup for one wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshotRecord {
    pub wallet_address: String,
    pub ts: DateTime<Utc>,
    pub nav_mid: Decimal,
    pub nav_exec_50pct: Decimal,
    pub nav_exec_100pct: Decimal,
    pub root_allocation_tao: Decimal,
    pub sleeve_allocation_tao: Decimal,
    pub unstaked_buffer_tao: Decimal,
    pub total_unrealized_yield_tao: Decimal,
    pub total_unrealized_alpha_pnl_tao: Decimal,
    pub executable_drawdown: Decimal,
    pub daily_turnover: Decimal,
    pub weekly_turnover: Decimal,
    pub active_positions: i64,
    pub overall_regime: FlowRegime,
    pub regime_reason: Option<String>,
}

/// Daily OHLC NAV row in both mid and executable prices, with running ATH.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavHistoryRecord {
    pub wallet_address: String,
    /// Day bucket as `YYYY-MM-DD` (UTC).
    pub date: String,
    pub nav_mid_open: Decimal,
    pub nav_mid_high: Decimal,
    pub nav_mid_low: Decimal,
    pub nav_mid_close: Decimal,
    pub nav_exec_open: Decimal,
    pub nav_exec_high: Decimal,
    pub nav_exec_low: Decimal,
    pub nav_exec_close: Decimal,
    pub nav_exec_ath: Decimal,
    pub daily_return_tao: Decimal,
    pub daily_return_pct: Decimal,
}

fn nav_from_row(row: &Row<'_>) -> rusqlite::Result<NavHistoryRecord> {
    Ok(NavHistoryRecord {
        wallet_address: row.get(0)?,
        date: row.get(1)?,
        nav_mid_open: get_dec(row, 2)?,
        nav_mid_high: get_dec(row, 3)?,
        nav_mid_low: get_dec(row, 4)?,
        nav_mid_close: get_dec(row, 5)?,
        nav_exec_open: get_dec(row, 6)?,
        nav_exec_high: get_dec(row, 7)?,
        nav_exec_low: get_dec(row, 8)?,
        nav_exec_close: get_dec(row, 9)?,
        nav_exec_ath: get_dec(row, 10)?,
        daily_return_tao: get_dec(row, 11)?,
        daily_return_pct: get_dec(row, 12)?,
    })
}

const NAV_COLUMNS: &str = "wallet_address, date, nav_mid_open, nav_mid_high, nav_mid_low, \
     nav_mid_close, nav_exec_open, nav_exec_high, nav_exec_low, nav_exec_close, nav_exec_ath, \
     daily_return_tao, daily_return_pct";

impl Datastore {
    pub async fn insert_portfolio_snapshot(&self, rec: &PortfolioSnapshotRecord) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO portfolio_snapshots
             (wallet_address, ts, nav_mid, nav_exec_50pct, nav_exec_100pct, \
              root_allocation_tao, sleeve_allocation_tao, unstaked_buffer_tao, \
              total_unrealized_yield_tao, total_unrealized_alpha_pnl_tao, \
              executable_drawdown, daily_turnover, weekly_turnover, active_positions, \
              overall_regime, regime_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                rec.wallet_address,
                rec.ts.timestamp(),
                rec.nav_mid.to_string(),
                rec.nav_exec_50pct.to_string(),
                rec.nav_exec_100pct.to_string(),
                rec.root_allocation_tao.to_string(),
                rec.sleeve_allocation_tao.to_string(),
                rec.unstaked_buffer_tao.to_string(),
                rec.total_unrealized_yield_tao.to_string(),
                rec.total_unrealized_alpha_pnl_tao.to_string(),
                rec.executable_drawdown.to_string(),
                rec.daily_turnover.to_string(),
                rec.weekly_turnover.to_string(),
                rec.active_positions,
                rec.overall_regime.as_str(),
                rec.regime_reason,
            ],
        )?;
        Ok(())
    }

    pub async fn latest_portfolio_snapshot(
        &self,
        wallet: &str,
    ) -> Result<Option<PortfolioSnapshotRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT wallet_address, ts, nav_mid, nav_exec_50pct, nav_exec_100pct, \
             root_allocation_tao, sleeve_allocation_tao, unstaked_buffer_tao, \
             total_unrealized_yield_tao, total_unrealized_alpha_pnl_tao, executable_drawdown, \
             daily_turnover, weekly_turnover, active_positions, overall_regime, regime_reason
             FROM portfolio_snapshots WHERE wallet_address = ?1
             ORDER BY ts DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![wallet])?;
        match rows.next()? {
            Some(row) => {
                let regime_raw: String = row.get(14)?;
                Ok(Some(PortfolioSnapshotRecord {
                    wallet_address: row.get(0)?,
                    ts: get_ts(row, 1)?,
                    nav_mid: get_dec(row, 2)?,
                    nav_exec_50pct: get_dec(row, 3)?,
                    nav_exec_100pct: get_dec(row, 4)?,
                    root_allocation_tao: get_dec(row, 5)?,
                    sleeve_allocation_tao: get_dec(row, 6)?,
                    unstaked_buffer_tao: get_dec(row, 7)?,
                    total_unrealized_yield_tao: get_dec(row, 8)?,
                    total_unrealized_alpha_pnl_tao: get_dec(row, 9)?,
                    executable_drawdown: get_dec(row, 10)?,
                    daily_turnover: get_dec(row, 11)?,
                    weekly_turnover: get_dec(row, 12)?,
                    active_positions: row.get(13)?,
                    overall_regime: regime_raw.parse().unwrap_or(FlowRegime::Neutral),
                    regime_reason: row.get(15)?,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn get_nav_day(&self, wallet: &str, date: &str) -> Result<Option<NavHistoryRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {NAV_COLUMNS} FROM nav_history
             WHERE wallet_address = ?1 AND date = ?2"
        ))?;
        let mut rows = stmt.query(params![wallet, date])?;
        match rows.next()? {
            Some(row) => Ok(Some(nav_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Latest NAV row strictly before `date`; supplies prior close and ATH.
    pub async fn latest_nav_before(
        &self,
        wallet: &str,
        date: &str,
    ) -> Result<Option<NavHistoryRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {NAV_COLUMNS} FROM nav_history
             WHERE wallet_address = ?1 AND date < ?2
             ORDER BY date DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![wallet, date])?;
        match rows.next()? {
            Some(row) => Ok(Some(nav_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn upsert_nav_day(&self, rec: &NavHistoryRecord) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO nav_history
             (wallet_address, date, nav_mid_open, nav_mid_high, nav_mid_low, nav_mid_close, \
              nav_exec_open, nav_exec_high, nav_exec_low, nav_exec_close, nav_exec_ath, \
              daily_return_tao, daily_return_pct)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(wallet_address, date) DO UPDATE SET
                nav_mid_high = excluded.nav_mid_high,
                nav_mid_low = excluded.nav_mid_low,
                nav_mid_close = excluded.nav_mid_close,
                nav_exec_high = excluded.nav_exec_high,
                nav_exec_low = excluded.nav_exec_low,
                nav_exec_close = excluded.nav_exec_close,
                nav_exec_ath = excluded.nav_exec_ath,
                daily_return_tao = excluded.daily_return_tao,
                daily_return_pct = excluded.daily_return_pct",
            params![
                rec.wallet_address,
                rec.date,
                rec.nav_mid_open.to_string(),
                rec.nav_mid_high.to_string(),
                rec.nav_mid_low.to_string(),
                rec.nav_mid_close.to_string(),
                rec.nav_exec_open.to_string(),
                rec.nav_exec_high.to_string(),
                rec.nav_exec_low.to_string(),
                rec.nav_exec_close.to_string(),
                rec.nav_exec_ath.to_string(),
                rec.daily_return_tao.to_string(),
                rec.daily_return_pct.to_string(),
            ],
        )?;
        Ok(())
    }

    pub async fn list_nav_history(
        &self,
        wallet: &str,
        date_start: &str,
    ) -> Result<Vec<NavHistoryRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {NAV_COLUMNS} FROM nav_history
             WHERE wallet_address = ?1 AND date >= ?2 ORDER BY date ASC"
        ))?;
        let rows = stmt.query_map(params![wallet, date_start], |row| nav_from_row(row))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}
