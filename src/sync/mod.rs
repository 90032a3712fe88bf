//! Sync orchestration: the tiered pipeline over the upstream API.
//!
//! Each tier runs a fixed step sequence; every step commits its own
//! writes before the next starts. Per-entity failures accumulate into
//! the run's error list instead of aborting the tier, and a minimum-
//! record guard refuses to overwrite a whole dataset from a truncated
//! response.

pub mod scheduler;

pub use scheduler::SyncScheduler;

use crate::accounting::{compute_unrealized_decomposition, CostBasisEngine, YieldTracker};
use crate::client::{ClientError, ExtrinsicRow, TaostatsClient};
use crate::db::{
    Datastore, DelegationEventRecord, PortfolioSnapshotRecord, PositionRecord,
    PositionSnapshotRecord, StakeTransactionRecord, SubnetRecord, SubnetSnapshotRecord,
    ValidatorRecord,
};
use crate::metrics::metrics;
use crate::models::{Config, SyncTier, TxType};
use crate::nav::{NavCalculator, SlippageService};
use crate::regime::RegimeEngine;
use crate::risk::RiskMonitor;
use crate::units::rao_str_to_tao;
use crate::viability::ViabilityScorer;
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Staking call names recognized in the extrinsic stream.
const STAKE_CALLS: &[&str] = &[
    "SubtensorModule.add_stake",
    "SubtensorModule.add_stake_limit",
    "SubtensorModule.add_stake_multiple",
];

const UNSTAKE_CALLS: &[&str] = &[
    "SubtensorModule.remove_stake",
    "SubtensorModule.remove_stake_limit",
    "SubtensorModule.unstake_all",
    "SubtensorModule.unstake_all_alpha",
];

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunResult {
    pub tier: SyncTier,
    pub wallets: usize,
    pub positions: usize,
    pub new_transactions: usize,
    pub errors: Vec<String>,
    pub rate_limited: bool,
}

impl SyncRunResult {
    fn record_error(&mut self, step: &str, error: impl std::fmt::Display) {
        let message = format!("{step}: {error}");
        warn!(step, error = %message, "sync step failed");
        self.errors.push(message);
    }

    fn note_client_error(&mut self, step: &str, error: &ClientError) {
        if error.is_rate_limit() {
            self.rate_limited = true;
        }
        self.record_error(step, error);
    }
}

pub struct SyncService {
    config: Arc<Config>,
    store: Datastore,
    client: Arc<TaostatsClient>,
    cost_basis: CostBasisEngine,
    yield_tracker: YieldTracker,
    slippage: SlippageService,
    regime: RegimeEngine,
    viability: ViabilityScorer,
    risk: RiskMonitor,
}

impl SyncService {
    pub fn new(config: Arc<Config>, store: Datastore, client: Arc<TaostatsClient>) -> Arc<Self> {
        Arc::new(Self {
            cost_basis: CostBasisEngine::new(store.clone()),
            yield_tracker: YieldTracker::new(store.clone(), client.clone()),
            slippage: SlippageService::new(store.clone(), client.clone()),
            regime: RegimeEngine::new(config.clone(), store.clone()),
            viability: ViabilityScorer::new(store.clone()),
            risk: RiskMonitor::new(config.clone(), store.clone()),
            config,
            store,
            client,
        })
    }

    pub fn store(&self) -> &Datastore {
        &self.store
    }

    /// Last Retry-After hint the client observed, for tier backoff.
    pub fn current_retry_after(&self) -> Option<u64> {
        self.client.current_retry_after()
    }

    /// Run one sync pass at the given tier.
    pub async fn sync_all(&self, tier: SyncTier, cancel: &CancellationToken) -> SyncRunResult {
        let started = std::time::Instant::now();
        info!(tier = tier.as_str(), "sync pass starting");
        let mut result = SyncRunResult {
            tier,
            wallets: 0,
            positions: 0,
            new_transactions: 0,
            errors: Vec::new(),
            rate_limited: false,
        };

        // Step 1: active wallet list; the configured wallet seeds it.
        let wallets = match self.resolve_wallets().await {
            Ok(wallets) => wallets,
            Err(e) => {
                result.record_error("wallets", e);
                return result;
            }
        };
        result.wallets = wallets.len();

        self.sync_subnets(&mut result).await;

        for wallet in &wallets {
            if cancel.is_cancelled() {
                result.record_error("run", "cancelled");
                break;
            }
            self.refresh_wallet(wallet, &mut result, cancel).await;

            if matches!(tier, SyncTier::Full | SyncTier::Deep) {
                self.full_wallet(wallet, &mut result, cancel).await;
            }
            if tier == SyncTier::Deep {
                self.deep_wallet(wallet, &mut result, cancel).await;
            }
        }

        if matches!(tier, SyncTier::Full | SyncTier::Deep) && !cancel.is_cancelled() {
            if let Err(e) = self.regime.update_all_regimes().await {
                result.record_error("regime", e);
            }
            if let Err(e) = self.viability.score_all().await {
                result.record_error("viability", e);
            }
        }

        if result.errors.is_empty() {
            metrics().record_sync_success(tier.as_str(), Utc::now().timestamp());
        } else {
            metrics().record_sync_failure(tier.as_str(), &result.errors.join("; "));
        }
        info!(
            tier = tier.as_str(),
            positions = result.positions,
            new_transactions = result.new_transactions,
            errors = result.errors.len(),
            rate_limited = result.rate_limited,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sync pass finished"
        );
        result
    }

    async fn resolve_wallets(&self) -> Result<Vec<String>> {
        let wallets = self.store.list_active_wallets().await?;
        if !wallets.is_empty() {
            return Ok(wallets);
        }
        self.store
            .upsert_wallet(&self.config.wallet_address, Some("default"))
            .await?;
        Ok(vec![self.config.wallet_address.clone()])
    }

    /// Subnet metadata and pool state for the whole universe.
    async fn sync_subnets(&self, result: &mut SyncRunResult) {
        let subnets = match self.client.subnet_latest().await {
            Ok(rows) => rows,
            Err(e) => {
                metrics().record_sync_failure("subnets", &e.to_string());
                result.note_client_error("subnets", &e);
                return;
            }
        };
        let pools = match self.client.pool_latest().await {
            Ok(rows) => rows,
            Err(e) => {
                metrics().record_sync_failure("subnets", &e.to_string());
                result.note_client_error("pools", &e);
                return;
            }
        };

        if subnets.len() < self.config.min_valid_sync_records {
            result.record_error(
                "subnets",
                format!(
                    "only {} record(s) returned, refusing dataset overwrite",
                    subnets.len()
                ),
            );
            return;
        }

        let now = Utc::now();
        for row in subnets {
            let pool = pools.iter().find(|p| p.netuid == row.netuid);
            let tao_reserve = pool
                .and_then(|p| p.total_tao.as_deref())
                .and_then(rao_str_to_tao)
                .unwrap_or(Decimal::ZERO);
            let alpha_reserve = pool
                .and_then(|p| p.total_alpha.as_deref())
                .and_then(rao_str_to_tao)
                .unwrap_or(Decimal::ZERO);
            let alpha_price = if alpha_reserve > Decimal::ZERO {
                tao_reserve / alpha_reserve
            } else {
                Decimal::ZERO
            };

            let age_days = row
                .registered_at
                .map(|r| (now - r).num_days().max(0))
                .unwrap_or(0);
            let record = SubnetRecord {
                netuid: row.netuid,
                name: row.name.unwrap_or_else(|| format!("SN{}", row.netuid)),
                owner_address: row.owner,
                owner_take: row.owner_take.unwrap_or(Decimal::ZERO),
                fee_rate: row.fee_rate.unwrap_or(Decimal::ZERO),
                incentive_burn: row.incentive_burn.unwrap_or(Decimal::ZERO),
                registered_at: row.registered_at,
                age_days,
                rank: row.rank,
                market_cap_tao: row
                    .market_cap
                    .as_deref()
                    .and_then(rao_str_to_tao)
                    .unwrap_or(Decimal::ZERO),
                emission_share: row.emission_share.unwrap_or(Decimal::ZERO),
                pool_tao_reserve: tao_reserve,
                pool_alpha_reserve: alpha_reserve,
                alpha_price_tao: alpha_price,
                holder_count: row.holders.unwrap_or(0),
                taoflow_1d: flow_ratio(&row.net_flow_1d, tao_reserve),
                taoflow_3d: flow_ratio(&row.net_flow_3d, tao_reserve),
                taoflow_7d: flow_ratio(&row.net_flow_7d, tao_reserve),
                taoflow_14d: flow_ratio(&row.net_flow_14d, tao_reserve),
                // Regime and viability columns are not written by this
                // upsert; their engines own them.
                flow_regime: crate::models::FlowRegime::Neutral,
                flow_regime_since: None,
                regime_candidate: None,
                regime_candidate_days: 0,
                viability_score: None,
                viability_tier: None,
            };

            if let Err(e) = self.store.upsert_subnet_market_state(&record).await {
                result.record_error("subnets", e);
                continue;
            }
            let snapshot = SubnetSnapshotRecord {
                netuid: record.netuid,
                ts: now,
                alpha_price_tao: record.alpha_price_tao,
                pool_tao_reserve: record.pool_tao_reserve,
                pool_alpha_reserve: record.pool_alpha_reserve,
                emission_share: record.emission_share,
                taoflow_net: record.taoflow_1d,
                holder_count: record.holder_count,
                flow_regime: record.flow_regime,
            };
            if let Err(e) = self.store.insert_subnet_snapshot(&snapshot).await {
                result.record_error("subnets", e);
            }
        }
        metrics().record_sync_success("subnets", now.timestamp());
    }

    /// Refresh tier for one wallet: balances, validators, decomposition,
    /// snapshots.
    async fn refresh_wallet(
        &self,
        wallet: &str,
        result: &mut SyncRunResult,
        cancel: &CancellationToken,
    ) {
        // Step 2: stake balances -> position rows.
        let balances = match self.client.stake_balance_latest(wallet).await {
            Ok(rows) => rows,
            Err(e) => {
                metrics().record_sync_failure("positions", &e.to_string());
                result.note_client_error("positions", &e);
                return;
            }
        };

        let stored = match self.store.list_active_positions(wallet).await {
            Ok(p) => p,
            Err(e) => {
                result.record_error("positions", e);
                return;
            }
        };
        if balances.len() < self.config.min_valid_sync_records && !stored.is_empty() {
            result.record_error(
                "positions",
                format!(
                    "only {} balance(s) returned for {} stored positions, refusing overwrite",
                    balances.len(),
                    stored.len()
                ),
            );
            metrics().record_sync_failure("positions", "minimum record guard");
            return;
        }

        let mut fresh: Vec<PositionRecord> = Vec::with_capacity(balances.len());
        for row in balances {
            let mut rec = PositionRecord::new(wallet, row.netuid);
            rec.alpha_balance = row
                .balance
                .as_deref()
                .and_then(rao_str_to_tao)
                .unwrap_or(Decimal::ZERO);
            rec.tao_value_mid = row
                .balance_as_tao
                .as_deref()
                .and_then(rao_str_to_tao)
                .unwrap_or(Decimal::ZERO);
            rec.validator_hotkey = row.hotkey;
            rec.entry_date = Some(Utc::now());
            if let Ok(Some(subnet)) = self.store.get_subnet(row.netuid).await {
                rec.subnet_name = Some(subnet.name);
            }
            fresh.push(rec);
        }
        if let Err(e) = self.store.apply_position_balances(wallet, &fresh).await {
            result.record_error("positions", e);
            return;
        }
        result.positions += fresh.len();
        metrics().record_sync_success("positions", Utc::now().timestamp());

        // Step 3: validator APY per distinct (hotkey, netuid).
        let pairs: BTreeSet<(String, i64)> = fresh
            .iter()
            .filter_map(|p| p.validator_hotkey.clone().map(|h| (h, p.netuid)))
            .collect();
        for (hotkey, netuid) in pairs {
            if cancel.is_cancelled() {
                return;
            }
            match self.client.validator_latest(netuid).await {
                Ok(rows) => {
                    for row in rows {
                        if row.hotkey.as_deref() != Some(hotkey.as_str()) {
                            continue;
                        }
                        let rec = ValidatorRecord {
                            hotkey: hotkey.clone(),
                            netuid,
                            name: row.name,
                            apy: row.apy.unwrap_or(Decimal::ZERO),
                            apy_7d: row.apy_7d.unwrap_or(Decimal::ZERO),
                            apy_30d: row.apy_30d.unwrap_or(Decimal::ZERO),
                            take_rate: row.take.unwrap_or(Decimal::ZERO),
                            stake_tao: row
                                .stake
                                .as_deref()
                                .and_then(rao_str_to_tao)
                                .unwrap_or(Decimal::ZERO),
                            is_quality: row.take.map(|t| t < Decimal::ONE).unwrap_or(true),
                        };
                        if let Err(e) = self.store.upsert_validator(&rec).await {
                            result.record_error("validators", e);
                        }
                    }
                    metrics().record_sync_success("validators", Utc::now().timestamp());
                }
                Err(e) => {
                    metrics().record_sync_failure("validators", &e.to_string());
                    result.note_client_error("validators", &e);
                }
            }
        }

        // Step 4: unrealized decomposition, pure math on stored values.
        match self.store.list_positions(wallet).await {
            Ok(positions) => {
                for mut position in positions {
                    compute_unrealized_decomposition(&mut position);
                    if let Err(e) = self.store.update_position_accounting(&position).await {
                        result.record_error("decomposition", e);
                    }
                }
            }
            Err(e) => result.record_error("decomposition", e),
        }

        // Step 5: snapshots.
        if let Err(e) = self.write_snapshots(wallet).await {
            result.record_error("snapshot", e);
        }
    }

    async fn write_snapshots(&self, wallet: &str) -> Result<()> {
        let now = Utc::now();
        let positions = self.store.list_active_positions(wallet).await?;

        let mut nav_mid = Decimal::ZERO;
        let mut nav_exec_50 = Decimal::ZERO;
        let mut nav_exec_100 = Decimal::ZERO;
        let mut root_value = Decimal::ZERO;
        let mut sleeve_value = Decimal::ZERO;
        let mut total_yield = Decimal::ZERO;
        let mut total_alpha_pnl = Decimal::ZERO;

        for position in &positions {
            nav_mid += position.tao_value_mid;
            nav_exec_50 += position.tao_value_exec_50pct;
            nav_exec_100 += position.tao_value_exec_100pct;
            total_yield += position.unrealized_yield_tao;
            total_alpha_pnl += position.unrealized_alpha_pnl_tao;
            if position.netuid == 0 {
                root_value += position.tao_value_mid;
            } else {
                sleeve_value += position.tao_value_mid;
            }

            self.store
                .insert_position_snapshot(&PositionSnapshotRecord {
                    wallet_address: wallet.to_string(),
                    netuid: position.netuid,
                    ts: now,
                    alpha_balance: position.alpha_balance,
                    tao_value_mid: position.tao_value_mid,
                    tao_value_exec_50pct: position.tao_value_exec_50pct,
                    tao_value_exec_100pct: position.tao_value_exec_100pct,
                    alpha_price_tao: position.current_alpha_price(),
                })
                .await?;
        }

        let (overall_regime, regime_reason) = self.regime.portfolio_regime(wallet).await?;
        let nav_calc = NavCalculator::new(self.store.clone(), &self.slippage);
        let drawdown = nav_calc.current_drawdown(wallet, now).await?;

        metrics().set_active_positions(positions.len() as i64);
        self.store
            .insert_portfolio_snapshot(&PortfolioSnapshotRecord {
                wallet_address: wallet.to_string(),
                ts: now,
                nav_mid,
                nav_exec_50pct: nav_exec_50,
                nav_exec_100pct: nav_exec_100,
                root_allocation_tao: root_value,
                sleeve_allocation_tao: sleeve_value,
                unstaked_buffer_tao: Decimal::ZERO,
                total_unrealized_yield_tao: total_yield,
                total_unrealized_alpha_pnl_tao: total_alpha_pnl,
                executable_drawdown: drawdown,
                daily_turnover: Decimal::ZERO,
                weekly_turnover: Decimal::ZERO,
                active_positions: positions.len() as i64,
                overall_regime,
                regime_reason: Some(regime_reason),
            })
            .await?;
        Ok(())
    }

    /// Full tier additions: transactions, delegation events, cost basis,
    /// yield, risk.
    async fn full_wallet(
        &self,
        wallet: &str,
        result: &mut SyncRunResult,
        cancel: &CancellationToken,
    ) {
        // Step 6: new extrinsics since the highest stored block.
        let last_block = match self.store.max_transaction_block(wallet).await {
            Ok(block) => block,
            Err(e) => {
                result.record_error("transactions", e);
                return;
            }
        };
        match self
            .client
            .extrinsics(wallet, self.client.max_pages, cancel)
            .await
        {
            Ok(extrinsics) => {
                let txs: Vec<StakeTransactionRecord> = extrinsics
                    .iter()
                    .filter(|e| e.block_number > last_block)
                    .filter_map(|e| classify_extrinsic(wallet, e))
                    .collect();
                match self.store.insert_stake_transactions(&txs).await {
                    Ok((inserted, touched)) => {
                        result.new_transactions += inserted;
                        metrics().record_sync_success("transactions", Utc::now().timestamp());
                        // Step 7: recompute cost basis for touched pairs.
                        if let Err(e) = self.cost_basis.recompute_positions(wallet, &touched).await
                        {
                            result.record_error("cost_basis", e);
                        }
                    }
                    Err(e) => result.record_error("transactions", e),
                }
            }
            Err(e) => {
                metrics().record_sync_failure("transactions", &e.to_string());
                result.note_client_error("transactions", &e);
            }
        }

        // Delegation events, the reward-credit ground truth.
        match self.client.delegation_events(wallet, cancel).await {
            Ok(events) => {
                let records: Vec<DelegationEventRecord> = events
                    .iter()
                    .map(|e| {
                        let action = e.action.to_lowercase();
                        let is_reward = action.contains("reward");
                        DelegationEventRecord {
                            wallet_address: wallet.to_string(),
                            event_id: e.id.clone(),
                            block_number: e.block_number,
                            ts: e.timestamp,
                            event_type: if is_reward {
                                "reward".into()
                            } else if action.contains("undelegate") || action.contains("unstake") {
                                "unstake".into()
                            } else {
                                "stake".into()
                            },
                            action: e.action.clone(),
                            netuid: e.netuid,
                            hotkey: e.hotkey.clone(),
                            amount_tao: e
                                .amount
                                .as_deref()
                                .and_then(rao_str_to_tao)
                                .unwrap_or(Decimal::ZERO),
                            alpha_amount: e.alpha.as_deref().and_then(rao_str_to_tao),
                            usd_value: e.usd,
                            is_reward,
                        }
                    })
                    .collect();
                if let Err(e) = self.store.insert_delegation_events(&records).await {
                    result.record_error("delegation", e);
                } else {
                    metrics().record_sync_success("delegation", Utc::now().timestamp());
                }
            }
            Err(e) => {
                metrics().record_sync_failure("delegation", &e.to_string());
                result.note_client_error("delegation", &e);
            }
        }

        // Step 8: authoritative yield from the accounting endpoint.
        match self
            .yield_tracker
            .compute_all_position_yields(wallet, cancel)
            .await
        {
            Ok(summary) => {
                if summary.errors.is_empty() {
                    metrics().record_sync_success("yield", Utc::now().timestamp());
                } else {
                    for e in &summary.errors {
                        if e.contains("rate limited") {
                            result.rate_limited = true;
                        }
                    }
                    metrics().record_sync_failure("yield", &summary.errors.join("; "));
                    result.errors.extend(summary.errors);
                }
            }
            Err(e) => result.record_error("yield", e),
        }

        // Daily yield history per position.
        if let Ok(positions) = self.store.list_active_positions(wallet).await {
            for position in positions {
                if cancel.is_cancelled() {
                    return;
                }
                let Some(hotkey) = position.validator_hotkey.clone() else {
                    continue;
                };
                if let Err(e) = self
                    .yield_tracker
                    .record_daily_yield_history(wallet, position.netuid, &hotkey, 8)
                    .await
                {
                    result.record_error("yield_history", e);
                }
            }
        }

        // Step 9: risk indicators.
        let nav_calc = NavCalculator::new(self.store.clone(), &self.slippage);
        match nav_calc.current_drawdown(wallet, Utc::now()).await {
            Ok(drawdown) => {
                if let Err(e) = self.risk.run(wallet, drawdown).await {
                    result.record_error("risk", e);
                }
            }
            Err(e) => result.record_error("risk", e),
        }
    }

    /// Deep tier additions: slippage surfaces, executable NAV, NAV OHLC.
    async fn deep_wallet(
        &self,
        wallet: &str,
        result: &mut SyncRunResult,
        cancel: &CancellationToken,
    ) {
        match self.slippage.sync_surfaces(wallet, cancel).await {
            Ok(summary) => {
                if summary.errors.is_empty() {
                    metrics().record_sync_success("slippage", Utc::now().timestamp());
                } else {
                    metrics().record_sync_failure("slippage", &summary.errors.join("; "));
                    result.errors.extend(summary.errors);
                }
            }
            Err(e) => result.record_error("slippage", e),
        }

        let nav_calc = NavCalculator::new(self.store.clone(), &self.slippage);
        match nav_calc.compute_portfolio_nav(wallet).await {
            Ok(nav) => {
                if let Err(e) = nav_calc
                    .record_nav_day(wallet, nav.nav_mid_tao, nav.nav_exec_100pct_tao, Utc::now())
                    .await
                {
                    result.record_error("nav", e);
                } else {
                    metrics().record_sync_success("nav", Utc::now().timestamp());
                }
            }
            Err(e) => result.record_error("nav", e),
        }

        if let Err(e) = self.write_snapshots(wallet).await {
            result.record_error("snapshot", e);
        }
        debug!(wallet, "deep tier complete");
    }
}

fn flow_ratio(raw: &Option<String>, reserve: Decimal) -> Decimal {
    let flow = raw.as_deref().and_then(rao_str_to_tao).unwrap_or(Decimal::ZERO);
    if reserve > Decimal::ZERO {
        flow / reserve
    } else {
        Decimal::ZERO
    }
}

/// Classify a raw extrinsic into a stake transaction, or None when it is
/// not a staking call or lacks the fields the engine needs.
pub fn classify_extrinsic(wallet: &str, ex: &ExtrinsicRow) -> Option<StakeTransactionRecord> {
    let tx_type = if STAKE_CALLS.contains(&ex.full_name.as_str()) {
        TxType::Stake
    } else if UNSTAKE_CALLS.contains(&ex.full_name.as_str()) {
        if ex.full_name.contains("unstake_all") {
            TxType::UnstakeAll
        } else {
            TxType::Unstake
        }
    } else {
        return None;
    };

    let args = &ex.call_args;
    let netuid = args.get("netuid").and_then(|v| v.as_i64())?;

    let amount_raw = ["amountStaked", "amountUnstaked", "amount"]
        .iter()
        .find_map(|key| args.get(*key))
        .and_then(json_number_string);
    let amount_tao = amount_raw
        .as_deref()
        .and_then(rao_str_to_tao)
        .unwrap_or(Decimal::ZERO);

    let hotkey = match args.get("hotkey") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Object(map)) => map
            .get("value")
            .or_else(|| map.get("ss58"))
            .and_then(|v| v.as_str())
            .map(String::from),
        _ => None,
    };

    let limit_price = args
        .get("limitPrice")
        .and_then(json_number_string)
        .as_deref()
        .and_then(rao_str_to_tao);

    let fee_tao = ex
        .fee
        .as_deref()
        .and_then(rao_str_to_tao)
        .unwrap_or(Decimal::ZERO);

    Some(StakeTransactionRecord {
        wallet_address: wallet.to_string(),
        extrinsic_id: ex.id.clone(),
        block_number: ex.block_number,
        ts: ex.timestamp,
        tx_hash: ex.hash.clone(),
        tx_type,
        call_name: ex.full_name.clone(),
        netuid,
        hotkey,
        amount_rao: amount_raw.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
        amount_tao,
        alpha_amount: None,
        limit_price,
        usd_value: None,
        fee_tao,
        success: ex.success,
        error_message: ex.error.clone(),
    })
}

fn json_number_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn extrinsic(full_name: &str, args: serde_json::Value) -> ExtrinsicRow {
        ExtrinsicRow {
            id: "5001-2".into(),
            block_number: 5001,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            hash: Some("0xabc".into()),
            full_name: full_name.into(),
            call_args: args,
            fee: Some("125000".into()),
            success: true,
            error: None,
        }
    }

    #[test]
    fn stake_extrinsic_classifies() {
        let ex = extrinsic(
            "SubtensorModule.add_stake_limit",
            json!({
                "netuid": 19,
                "amountStaked": "5000000000",
                "hotkey": {"__kind": "Id", "value": "0xhot"},
                "limitPrice": "2000000000"
            }),
        );
        let tx = classify_extrinsic("5W", &ex).unwrap();
        assert_eq!(tx.tx_type, TxType::Stake);
        assert_eq!(tx.netuid, 19);
        assert_eq!(tx.amount_tao, dec!(5));
        assert_eq!(tx.limit_price, Some(dec!(2)));
        assert_eq!(tx.hotkey.as_deref(), Some("0xhot"));
        assert_eq!(tx.fee_tao, dec!(0.000125));
    }

    #[test]
    fn unstake_all_classifies() {
        let ex = extrinsic(
            "SubtensorModule.unstake_all",
            json!({"netuid": 3, "amount": "1000000000", "hotkey": "5Hot"}),
        );
        let tx = classify_extrinsic("5W", &ex).unwrap();
        assert_eq!(tx.tx_type, TxType::UnstakeAll);
        assert_eq!(tx.hotkey.as_deref(), Some("5Hot"));
    }

    #[test]
    fn non_staking_calls_are_skipped() {
        let ex = extrinsic("Balances.transfer", json!({"netuid": 1}));
        assert!(classify_extrinsic("5W", &ex).is_none());
    }

    #[test]
    fn missing_netuid_is_skipped() {
        let ex = extrinsic("SubtensorModule.add_stake", json!({"amount": "100"}));
        assert!(classify_extrinsic("5W", &ex).is_none());
    }

    #[test]
    fn flow_ratio_guards_zero_reserve() {
        assert_eq!(flow_ratio(&Some("1000000000".into()), dec!(0)), dec!(0));
        assert_eq!(flow_ratio(&Some("1000000000".into()), dec!(10)), dec!(0.1));
    }
}
