//! SQLite datastore.
//!
//! Single connection behind an async mutex; every multi-row mutation runs
//! inside an explicit transaction. Decimals are stored as TEXT on the rao
//! grid, timestamps as Unix seconds, daily keys as `YYYY-MM-DD` strings.
//! Schema creation is idempotent at open; evolution is handled externally.

mod alerts;
mod portfolio;
mod positions;
mod reconciliation;
mod signals;
mod slippage;
mod subnets;
mod transactions;
mod validators;
mod viability;
mod wallets;

pub use alerts::{AlertRecord, DecisionLogRecord, TradeRecommendationRecord};
pub use portfolio::{NavHistoryRecord, PortfolioSnapshotRecord};
pub use positions::{PositionRecord, PositionSnapshotRecord};
pub use reconciliation::ReconciliationRunRecord;
pub use signals::SignalRunRecord;
pub use slippage::SlippageSurfaceRecord;
pub use subnets::{SubnetRecord, SubnetSnapshotRecord};
pub use transactions::{
    CostBasisRecord, DelegationEventRecord, StakeTransactionRecord, YieldHistoryRecord,
};
pub use validators::ValidatorRecord;
pub use viability::ViabilityConfigRecord;
pub use wallets::WalletRecord;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct Datastore {
    conn: Arc<Mutex<Connection>>,
}

impl Datastore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open treasury db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory db")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Connectivity probe used by startup and health reporting.
    pub async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .context("datastore ping")?;
        Ok(())
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS wallets (
                address TEXT PRIMARY KEY,
                label TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS subnets (
                netuid INTEGER PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                owner_address TEXT,
                owner_take TEXT NOT NULL DEFAULT '0',
                fee_rate TEXT NOT NULL DEFAULT '0',
                incentive_burn TEXT NOT NULL DEFAULT '0',
                registered_at INTEGER,
                age_days INTEGER NOT NULL DEFAULT 0,
                rank INTEGER,
                market_cap_tao TEXT NOT NULL DEFAULT '0',
                emission_share TEXT NOT NULL DEFAULT '0',
                pool_tao_reserve TEXT NOT NULL DEFAULT '0',
                pool_alpha_reserve TEXT NOT NULL DEFAULT '0',
                alpha_price_tao TEXT NOT NULL DEFAULT '0',
                holder_count INTEGER NOT NULL DEFAULT 0,
                taoflow_1d TEXT NOT NULL DEFAULT '0',
                taoflow_3d TEXT NOT NULL DEFAULT '0',
                taoflow_7d TEXT NOT NULL DEFAULT '0',
                taoflow_14d TEXT NOT NULL DEFAULT '0',
                flow_regime TEXT NOT NULL DEFAULT 'neutral',
                flow_regime_since INTEGER,
                regime_candidate TEXT,
                regime_candidate_days INTEGER NOT NULL DEFAULT 0,
                viability_score TEXT,
                viability_tier TEXT,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_subnets_regime ON subnets(flow_regime);

            CREATE TABLE IF NOT EXISTS subnet_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                netuid INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                alpha_price_tao TEXT NOT NULL DEFAULT '0',
                pool_tao_reserve TEXT NOT NULL DEFAULT '0',
                pool_alpha_reserve TEXT NOT NULL DEFAULT '0',
                emission_share TEXT NOT NULL DEFAULT '0',
                taoflow_net TEXT NOT NULL DEFAULT '0',
                holder_count INTEGER NOT NULL DEFAULT 0,
                flow_regime TEXT NOT NULL DEFAULT 'neutral'
            );
            CREATE INDEX IF NOT EXISTS idx_subnet_snapshots_netuid_ts
                ON subnet_snapshots(netuid, ts);

            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                wallet_address TEXT NOT NULL,
                netuid INTEGER NOT NULL,
                subnet_name TEXT,
                alpha_balance TEXT NOT NULL DEFAULT '0',
                alpha_purchased TEXT NOT NULL DEFAULT '0',
                total_yield_alpha TEXT NOT NULL DEFAULT '0',
                tao_value_mid TEXT NOT NULL DEFAULT '0',
                tao_value_exec_50pct TEXT NOT NULL DEFAULT '0',
                tao_value_exec_100pct TEXT NOT NULL DEFAULT '0',
                entry_price_tao TEXT NOT NULL DEFAULT '0',
                entry_date INTEGER,
                cost_basis_tao TEXT NOT NULL DEFAULT '0',
                cost_basis_usd TEXT NOT NULL DEFAULT '0',
                exit_slippage_50pct TEXT NOT NULL DEFAULT '0',
                exit_slippage_100pct TEXT NOT NULL DEFAULT '0',
                unrealized_pnl_tao TEXT NOT NULL DEFAULT '0',
                unrealized_pnl_pct TEXT NOT NULL DEFAULT '0',
                unrealized_yield_tao TEXT NOT NULL DEFAULT '0',
                unrealized_alpha_pnl_tao TEXT NOT NULL DEFAULT '0',
                total_unrealized_pnl_tao TEXT NOT NULL DEFAULT '0',
                realized_pnl_tao TEXT NOT NULL DEFAULT '0',
                realized_yield_tao TEXT NOT NULL DEFAULT '0',
                realized_alpha_pnl_tao TEXT NOT NULL DEFAULT '0',
                validator_hotkey TEXT,
                recommended_action TEXT,
                action_reason TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(wallet_address, netuid)
            );

            CREATE TABLE IF NOT EXISTS position_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                wallet_address TEXT NOT NULL,
                netuid INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                alpha_balance TEXT NOT NULL DEFAULT '0',
                tao_value_mid TEXT NOT NULL DEFAULT '0',
                tao_value_exec_50pct TEXT NOT NULL DEFAULT '0',
                tao_value_exec_100pct TEXT NOT NULL DEFAULT '0',
                alpha_price_tao TEXT NOT NULL DEFAULT '0'
            );
            CREATE INDEX IF NOT EXISTS idx_position_snapshots_wallet_netuid_ts
                ON position_snapshots(wallet_address, netuid, ts);

            CREATE TABLE IF NOT EXISTS stake_transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                wallet_address TEXT NOT NULL,
                extrinsic_id TEXT NOT NULL UNIQUE,
                block_number INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                tx_hash TEXT,
                tx_type TEXT NOT NULL,
                call_name TEXT NOT NULL DEFAULT '',
                netuid INTEGER NOT NULL,
                hotkey TEXT,
                amount_rao INTEGER NOT NULL DEFAULT 0,
                amount_tao TEXT NOT NULL DEFAULT '0',
                alpha_amount TEXT,
                limit_price TEXT,
                usd_value TEXT,
                fee_tao TEXT NOT NULL DEFAULT '0',
                success INTEGER NOT NULL DEFAULT 1,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_stake_tx_wallet_netuid
                ON stake_transactions(wallet_address, netuid);
            CREATE INDEX IF NOT EXISTS idx_stake_tx_ts ON stake_transactions(ts);

            CREATE TABLE IF NOT EXISTS position_cost_basis (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                wallet_address TEXT NOT NULL,
                netuid INTEGER NOT NULL,
                total_staked_tao TEXT NOT NULL DEFAULT '0',
                total_unstaked_tao TEXT NOT NULL DEFAULT '0',
                net_invested_tao TEXT NOT NULL DEFAULT '0',
                alpha_purchased TEXT NOT NULL DEFAULT '0',
                weighted_avg_entry_price TEXT NOT NULL DEFAULT '0',
                realized_pnl_tao TEXT NOT NULL DEFAULT '0',
                realized_yield_tao TEXT NOT NULL DEFAULT '0',
                realized_yield_alpha TEXT NOT NULL DEFAULT '0',
                total_fees_tao TEXT NOT NULL DEFAULT '0',
                total_staked_usd TEXT NOT NULL DEFAULT '0',
                total_unstaked_usd TEXT NOT NULL DEFAULT '0',
                usd_cost_basis TEXT NOT NULL DEFAULT '0',
                realized_pnl_usd TEXT NOT NULL DEFAULT '0',
                stake_count INTEGER NOT NULL DEFAULT 0,
                unstake_count INTEGER NOT NULL DEFAULT 0,
                first_stake_at INTEGER,
                last_transaction_at INTEGER,
                computed_at INTEGER NOT NULL,
                UNIQUE(wallet_address, netuid)
            );

            CREATE TABLE IF NOT EXISTS delegation_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                wallet_address TEXT NOT NULL,
                event_id TEXT NOT NULL UNIQUE,
                block_number INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                action TEXT NOT NULL DEFAULT '',
                netuid INTEGER NOT NULL,
                hotkey TEXT,
                amount_tao TEXT NOT NULL DEFAULT '0',
                alpha_amount TEXT,
                usd_value TEXT,
                is_reward INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_delegation_events_wallet_netuid
                ON delegation_events(wallet_address, netuid);

            CREATE TABLE IF NOT EXISTS position_yield_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                wallet_address TEXT NOT NULL,
                netuid INTEGER NOT NULL,
                date TEXT NOT NULL,
                alpha_balance_start TEXT NOT NULL DEFAULT '0',
                alpha_balance_end TEXT NOT NULL DEFAULT '0',
                tao_value_start TEXT NOT NULL DEFAULT '0',
                tao_value_end TEXT NOT NULL DEFAULT '0',
                yield_alpha TEXT NOT NULL DEFAULT '0',
                yield_tao TEXT NOT NULL DEFAULT '0',
                net_stake_tao TEXT NOT NULL DEFAULT '0',
                daily_apy TEXT NOT NULL DEFAULT '0',
                UNIQUE(wallet_address, netuid, date)
            );

            CREATE TABLE IF NOT EXISTS slippage_surfaces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                netuid INTEGER NOT NULL,
                action TEXT NOT NULL,
                size_tao TEXT NOT NULL,
                slippage_pct TEXT NOT NULL DEFAULT '0',
                expected_output TEXT NOT NULL DEFAULT '0',
                pool_tao_reserve TEXT NOT NULL DEFAULT '0',
                pool_alpha_reserve TEXT NOT NULL DEFAULT '0',
                computed_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                UNIQUE(netuid, action, size_tao)
            );

            CREATE TABLE IF NOT EXISTS portfolio_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                wallet_address TEXT NOT NULL,
                ts INTEGER NOT NULL,
                nav_mid TEXT NOT NULL DEFAULT '0',
                nav_exec_50pct TEXT NOT NULL DEFAULT '0',
                nav_exec_100pct TEXT NOT NULL DEFAULT '0',
                root_allocation_tao TEXT NOT NULL DEFAULT '0',
                sleeve_allocation_tao TEXT NOT NULL DEFAULT '0',
                unstaked_buffer_tao TEXT NOT NULL DEFAULT '0',
                total_unrealized_yield_tao TEXT NOT NULL DEFAULT '0',
                total_unrealized_alpha_pnl_tao TEXT NOT NULL DEFAULT '0',
                executable_drawdown TEXT NOT NULL DEFAULT '0',
                daily_turnover TEXT NOT NULL DEFAULT '0',
                weekly_turnover TEXT NOT NULL DEFAULT '0',
                active_positions INTEGER NOT NULL DEFAULT 0,
                overall_regime TEXT NOT NULL DEFAULT 'neutral',
                regime_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_portfolio_snapshots_wallet_ts
                ON portfolio_snapshots(wallet_address, ts);

            CREATE TABLE IF NOT EXISTS nav_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                wallet_address TEXT NOT NULL,
                date TEXT NOT NULL,
                nav_mid_open TEXT NOT NULL DEFAULT '0',
                nav_mid_high TEXT NOT NULL DEFAULT '0',
                nav_mid_low TEXT NOT NULL DEFAULT '0',
                nav_mid_close TEXT NOT NULL DEFAULT '0',
                nav_exec_open TEXT NOT NULL DEFAULT '0',
                nav_exec_high TEXT NOT NULL DEFAULT '0',
                nav_exec_low TEXT NOT NULL DEFAULT '0',
                nav_exec_close TEXT NOT NULL DEFAULT '0',
                nav_exec_ath TEXT NOT NULL DEFAULT '0',
                daily_return_tao TEXT NOT NULL DEFAULT '0',
                daily_return_pct TEXT NOT NULL DEFAULT '0',
                UNIQUE(wallet_address, date)
            );

            CREATE TABLE IF NOT EXISTS validators (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hotkey TEXT NOT NULL,
                netuid INTEGER NOT NULL,
                name TEXT,
                apy TEXT NOT NULL DEFAULT '0',
                apy_7d TEXT NOT NULL DEFAULT '0',
                apy_30d TEXT NOT NULL DEFAULT '0',
                take_rate TEXT NOT NULL DEFAULT '0',
                stake_tao TEXT NOT NULL DEFAULT '0',
                is_quality INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL,
                UNIQUE(hotkey, netuid)
            );

            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                severity TEXT NOT NULL,
                kind TEXT NOT NULL,
                wallet_address TEXT,
                netuid INTEGER,
                message TEXT NOT NULL,
                snapshot_ref TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_ts ON alerts(ts DESC);

            CREATE TABLE IF NOT EXISTS decision_log (
                id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                wallet_address TEXT NOT NULL,
                trigger TEXT NOT NULL,
                summary TEXT NOT NULL,
                details TEXT,
                snapshot_ref TEXT
            );

            CREATE TABLE IF NOT EXISTS trade_recommendations (
                id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                wallet_address TEXT NOT NULL,
                netuid INTEGER NOT NULL,
                action TEXT NOT NULL,
                size_tao TEXT NOT NULL DEFAULT '0',
                reason TEXT NOT NULL,
                confidence TEXT NOT NULL,
                gate_state TEXT NOT NULL,
                snapshot_ref TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_trade_recs_wallet_ts
                ON trade_recommendations(wallet_address, ts DESC);

            CREATE TABLE IF NOT EXISTS reconciliation_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL,
                wallet_address TEXT NOT NULL,
                passed INTEGER NOT NULL DEFAULT 0,
                total_checks INTEGER NOT NULL DEFAULT 0,
                passed_checks INTEGER NOT NULL DEFAULT 0,
                failed_checks INTEGER NOT NULL DEFAULT 0,
                total_stored_value_tao TEXT NOT NULL DEFAULT '0',
                total_live_value_tao TEXT NOT NULL DEFAULT '0',
                total_diff_tao TEXT NOT NULL DEFAULT '0',
                total_diff_pct TEXT NOT NULL DEFAULT '0',
                checks_json TEXT NOT NULL DEFAULT '[]',
                error_message TEXT,
                absolute_tolerance_tao TEXT NOT NULL DEFAULT '0.0001',
                relative_tolerance_pct TEXT NOT NULL DEFAULT '0.1'
            );
            CREATE INDEX IF NOT EXISTS idx_recon_runs_wallet_created
                ON reconciliation_runs(wallet_address, created_at DESC);

            CREATE TABLE IF NOT EXISTS signal_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signal_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                status TEXT NOT NULL,
                confidence TEXT NOT NULL,
                summary TEXT NOT NULL,
                evidence_json TEXT NOT NULL DEFAULT '{}',
                guardrails_json TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_signal_runs_signal_ts
                ON signal_runs(signal_id, ts DESC);

            CREATE TABLE IF NOT EXISTS viability_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                config_name TEXT NOT NULL DEFAULT 'default',
                is_active INTEGER NOT NULL DEFAULT 1,
                min_tao_reserve TEXT NOT NULL,
                min_emission_share TEXT NOT NULL,
                min_age_days INTEGER NOT NULL,
                min_holders INTEGER NOT NULL,
                max_drawdown_30d TEXT NOT NULL,
                max_negative_flow_ratio TEXT NOT NULL,
                weight_tao_reserve TEXT NOT NULL,
                weight_net_flow_7d TEXT NOT NULL,
                weight_emission_share TEXT NOT NULL,
                weight_price_trend_7d TEXT NOT NULL,
                weight_subnet_age TEXT NOT NULL,
                weight_max_drawdown_30d TEXT NOT NULL,
                tier_1_min INTEGER NOT NULL,
                tier_2_min INTEGER NOT NULL,
                tier_3_min INTEGER NOT NULL,
                age_cap_days INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL
            );
            ",
        )
        .context("create schema")?;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Row conversion helpers shared by the repository modules
// ----------------------------------------------------------------------

pub(crate) fn get_dec(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(DecimalColumnError(e)))
    })
}

pub(crate) fn get_dec_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                Type::Text,
                Box::new(DecimalColumnError(e)),
            )
        }),
    }
}

pub(crate) fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(idx)?;
    Ok(Utc.timestamp_opt(secs, 0).single().unwrap_or_default())
}

pub(crate) fn get_ts_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let secs: Option<i64> = row.get(idx)?;
    Ok(secs.and_then(|s| Utc.timestamp_opt(s, 0).single()))
}

#[derive(Debug)]
struct DecimalColumnError(rust_decimal::Error);

impl std::fmt::Display for DecimalColumnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bad decimal column: {}", self.0)
    }
}

impl std::error::Error for DecimalColumnError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_creates_and_pings() {
        let store = Datastore::open_in_memory().unwrap();
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let store = Datastore::open_in_memory().unwrap();
        let conn = store.lock().await;
        Datastore::init_schema(&conn).unwrap();
    }
}
