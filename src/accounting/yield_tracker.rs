//! Yield tracking from the upstream accounting endpoint.
//!
//! `daily_income` from `/accounting/tax` is the authoritative per-day
//! yield stream in alpha. The tracker sums it over a position's lifetime
//! (chunking around the upstream 12-month query window), stores
//! `total_yield_alpha`, and derives the unrealized decomposition. Daily
//! yield history rows come from stake-balance history minus net stake
//! flows, the same identity the earnings engine uses.

use crate::client::{ClientError, TaostatsClient};
use crate::db::{Datastore, PositionRecord, YieldHistoryRecord};
use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DAYS_PER_YEAR: Decimal = dec!(365);
/// Upstream accounting queries reject windows longer than 12 months.
const MAX_WINDOW_DAYS: i64 = 365;

/// Unrealized P&L decomposition, pure math on the fetched values.
///
/// Holds `unrealized_pnl = unrealized_yield + unrealized_alpha_pnl` by
/// construction; a drained position zeroes every unrealized field.
pub fn compute_unrealized_decomposition(position: &mut PositionRecord) {
    if position.alpha_balance <= Decimal::ZERO {
        position.unrealized_pnl_tao = Decimal::ZERO;
        position.unrealized_pnl_pct = Decimal::ZERO;
        position.unrealized_yield_tao = Decimal::ZERO;
        position.unrealized_alpha_pnl_tao = Decimal::ZERO;
        position.total_unrealized_pnl_tao = Decimal::ZERO;
        return;
    }

    let cost_basis = position.cost_basis_tao;
    let current_alpha_price = position.current_alpha_price();

    let pnl = if cost_basis > Decimal::ZERO {
        position.tao_value_mid - cost_basis
    } else {
        Decimal::ZERO
    };
    let pnl_pct = if cost_basis > Decimal::ZERO {
        pnl / cost_basis * dec!(100)
    } else {
        Decimal::ZERO
    };

    let emission_remaining = position.total_yield_alpha.min(position.alpha_balance);
    let unrealized_yield = emission_remaining * current_alpha_price;

    position.unrealized_pnl_tao = pnl;
    position.unrealized_pnl_pct = pnl_pct;
    position.unrealized_yield_tao = unrealized_yield;
    // Residual; negative when the alpha price sits below entry.
    position.unrealized_alpha_pnl_tao = pnl - unrealized_yield;
    position.total_unrealized_pnl_tao = pnl;
}

/// Split `[start, end]` into inclusive windows of at most `max_days`.
pub fn chunk_date_windows(
    start: NaiveDate,
    end: NaiveDate,
    max_days: i64,
) -> Vec<(NaiveDate, NaiveDate)> {
    let mut windows = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let window_end = (cursor + Duration::days(max_days)).min(end);
        windows.push((cursor, window_end));
        cursor = window_end + Duration::days(1);
    }
    windows
}

#[derive(Debug, Default)]
pub struct YieldRunSummary {
    pub positions_processed: usize,
    pub total_yield_alpha: Decimal,
    pub errors: Vec<String>,
}

pub struct YieldTracker {
    store: Datastore,
    client: Arc<TaostatsClient>,
}

impl YieldTracker {
    pub fn new(store: Datastore, client: Arc<TaostatsClient>) -> Self {
        Self { store, client }
    }

    /// Refresh `total_yield_alpha` and the unrealized decomposition for
    /// every active position of a wallet. Per-position failures
    /// accumulate; rate limits abort the pass so the tier can back off.
    pub async fn compute_all_position_yields(
        &self,
        wallet: &str,
        cancel: &CancellationToken,
    ) -> Result<YieldRunSummary> {
        let mut summary = YieldRunSummary::default();
        let positions = self.store.list_positions(wallet).await?;

        for mut position in positions {
            if cancel.is_cancelled() {
                break;
            }
            if !position.is_active() {
                continue;
            }

            match self
                .fetch_total_yield_alpha(wallet, &position, cancel)
                .await
            {
                Ok(total_yield_alpha) => {
                    position.total_yield_alpha = total_yield_alpha;
                    compute_unrealized_decomposition(&mut position);
                    self.store.update_position_accounting(&position).await?;
                    summary.positions_processed += 1;
                    summary.total_yield_alpha += total_yield_alpha;
                    debug!(
                        netuid = position.netuid,
                        yield_alpha = %total_yield_alpha,
                        unrealized_yield = %position.unrealized_yield_tao,
                        "position yield updated"
                    );
                }
                Err(e) if e.is_rate_limit() => {
                    summary.errors.push(format!("SN{}: {e}", position.netuid));
                    return Ok(summary);
                }
                Err(e) => {
                    warn!(netuid = position.netuid, error = %e, "yield fetch failed");
                    summary.errors.push(format!("SN{}: {e}", position.netuid));
                }
            }
        }

        info!(
            wallet,
            positions = summary.positions_processed,
            errors = summary.errors.len(),
            "yield pass completed"
        );
        Ok(summary)
    }

    async fn fetch_total_yield_alpha(
        &self,
        wallet: &str,
        position: &PositionRecord,
        cancel: &CancellationToken,
    ) -> Result<Decimal, ClientError> {
        let token = format!("SN{}", position.netuid);
        let end = Utc::now().date_naive();
        let start = position
            .entry_date
            .map(|d| d.date_naive())
            .unwrap_or_else(|| end - Duration::days(MAX_WINDOW_DAYS));

        let mut total = Decimal::ZERO;
        for (chunk_start, chunk_end) in chunk_date_windows(start, end, MAX_WINDOW_DAYS) {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            let records = self
                .client
                .accounting_tax(
                    wallet,
                    &token,
                    &chunk_start.format("%Y-%m-%d").to_string(),
                    &chunk_end.format("%Y-%m-%d").to_string(),
                    cancel,
                )
                .await?;
            for record in records {
                if let Some(income) = record.daily_income {
                    if income > Decimal::ZERO {
                        total += income;
                    }
                }
            }
        }
        Ok(total)
    }

    /// Rebuild daily yield history for one position over the last `days`
    /// from stake-balance history:
    /// `yield = balance_change - net_stake_flows` per day.
    pub async fn record_daily_yield_history(
        &self,
        wallet: &str,
        netuid: i64,
        hotkey: &str,
        days: i64,
    ) -> Result<usize> {
        let now = Utc::now();
        let start = now - Duration::days(days);
        let mut history = self
            .client
            .stake_balance_history(
                wallet,
                hotkey,
                netuid,
                start.timestamp(),
                now.timestamp(),
                (days + 5) as u32,
            )
            .await?;
        history.sort_by_key(|h| h.timestamp);
        if history.len() < 2 {
            return Ok(0);
        }

        let flows = self
            .store
            .list_transactions_in_window(wallet, start, now)
            .await?;

        let mut written = 0usize;
        for pair in history.windows(2) {
            let prev = &pair[0];
            let curr = &pair[1];

            let alpha_start = parse_rao(&prev.balance);
            let alpha_end = parse_rao(&curr.balance);
            let tao_start = parse_rao(&prev.balance_as_tao);
            let tao_end = parse_rao(&curr.balance_as_tao);

            let net_stake = net_flows_between(&flows, netuid, prev.timestamp, curr.timestamp);
            let yield_tao = tao_end - tao_start - net_stake;
            let yield_alpha = alpha_end - alpha_start;

            let daily_apy = if tao_start > Decimal::ZERO {
                yield_tao / tao_start * DAYS_PER_YEAR
            } else {
                Decimal::ZERO
            };

            self.store
                .upsert_yield_history(&YieldHistoryRecord {
                    wallet_address: wallet.to_string(),
                    netuid,
                    date: curr.timestamp.format("%Y-%m-%d").to_string(),
                    alpha_balance_start: alpha_start,
                    alpha_balance_end: alpha_end,
                    tao_value_start: tao_start,
                    tao_value_end: tao_end,
                    yield_alpha,
                    yield_tao,
                    net_stake_tao: net_stake,
                    daily_apy,
                })
                .await?;
            written += 1;
        }
        Ok(written)
    }
}

fn parse_rao(raw: &Option<String>) -> Decimal {
    raw.as_deref()
        .and_then(crate::units::rao_str_to_tao)
        .unwrap_or(Decimal::ZERO)
}

/// Net stake flows (stakes minus unstake proceeds) for one subnet inside
/// `(start, end]`.
fn net_flows_between(
    flows: &[crate::db::StakeTransactionRecord],
    netuid: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Decimal {
    let mut net = Decimal::ZERO;
    for tx in flows {
        if tx.netuid != netuid || tx.ts <= start || tx.ts > end {
            continue;
        }
        if tx.tx_type.is_unstake() {
            net -= tx.amount_tao;
        } else {
            net += tx.amount_tao;
        }
    }
    net
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn position_with(
        alpha_balance: Decimal,
        cost_basis: Decimal,
        tao_value_mid: Decimal,
        total_yield_alpha: Decimal,
    ) -> PositionRecord {
        let mut p = PositionRecord::new("5W", 1);
        p.alpha_balance = alpha_balance;
        p.cost_basis_tao = cost_basis;
        p.tao_value_mid = tao_value_mid;
        p.total_yield_alpha = total_yield_alpha;
        p
    }

    #[test]
    fn yield_identity_scenario() {
        // alpha_balance 100, purchased 80, cost basis 80, mid value 200,
        // 20 alpha of emission held. Price = 2.0.
        let mut p = position_with(dec!(100), dec!(80), dec!(200), dec!(20));
        p.alpha_purchased = dec!(80);
        p.entry_price_tao = dec!(1);
        compute_unrealized_decomposition(&mut p);

        assert_eq!(p.unrealized_pnl_tao, dec!(120));
        assert_eq!(p.unrealized_yield_tao, dec!(40));
        assert_eq!(p.unrealized_alpha_pnl_tao, dec!(80));
        assert_eq!(
            p.total_unrealized_pnl_tao,
            p.unrealized_yield_tao + p.unrealized_alpha_pnl_tao
        );
    }

    #[test]
    fn drained_position_zeroes_unrealized_fields() {
        let mut p = position_with(dec!(0), dec!(80), dec!(0), dec!(20));
        p.unrealized_yield_tao = dec!(5);
        compute_unrealized_decomposition(&mut p);
        assert_eq!(p.unrealized_pnl_tao, dec!(0));
        assert_eq!(p.unrealized_yield_tao, dec!(0));
        assert_eq!(p.unrealized_alpha_pnl_tao, dec!(0));
    }

    #[test]
    fn unknown_cost_basis_pins_pnl_to_zero() {
        let mut p = position_with(dec!(10), dec!(0), dec!(30), dec!(2));
        compute_unrealized_decomposition(&mut p);
        assert_eq!(p.unrealized_pnl_tao, dec!(0));
        // Yield is still valued; alpha pnl absorbs the negation.
        assert_eq!(p.unrealized_yield_tao, dec!(6));
        assert_eq!(p.unrealized_alpha_pnl_tao, dec!(-6));
    }

    #[test]
    fn emission_remaining_is_capped_by_balance() {
        let mut p = position_with(dec!(5), dec!(5), dec!(10), dec!(50));
        compute_unrealized_decomposition(&mut p);
        // Only 5 alpha held; emission cannot exceed it. Price = 2.
        assert_eq!(p.unrealized_yield_tao, dec!(10));
    }

    #[test]
    fn date_windows_chunk_at_twelve_months() {
        let start = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();
        let windows = chunk_date_windows(start, end, 365);

        assert!(windows.len() >= 3);
        assert_eq!(windows[0].0, start);
        assert_eq!(windows.last().unwrap().1, end);
        for (s, e) in &windows {
            assert!((*e - *s).num_days() <= 365);
        }
        // Windows tile the range without gaps.
        for pair in windows.windows(2) {
            assert_eq!(pair[1].0, pair[0].1 + Duration::days(1));
        }
    }

    #[test]
    fn single_day_window_is_one_chunk() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 3).unwrap();
        let windows = chunk_date_windows(day, day, 365);
        assert_eq!(windows, vec![(day, day)]);
    }
}
