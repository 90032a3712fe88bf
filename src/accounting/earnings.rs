//! Flow-adjusted earnings over arbitrary windows.
//!
//! Identity: `earnings = end_value - start_value - net_flows`, anchored
//! on the closest-on-or-before position snapshots at each side of the
//! window. A wallet with no usable snapshot fails the query instead of
//! silently reading zero.

use crate::db::Datastore;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EarningsError {
    #[error("no position snapshot at or before {at} for wallet {wallet}")]
    MissingSnapshot { wallet: String, at: DateTime<Utc> },

    #[error("start must precede end")]
    InvalidWindow,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct NetuidEarnings {
    pub netuid: i64,
    pub start_value_tao: Decimal,
    pub end_value_tao: Decimal,
    pub net_flows_tao: Decimal,
    pub earnings_tao: Decimal,
    pub earnings_pct: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct EarningsSummary {
    pub wallet_address: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub window_days: Decimal,
    pub total_start_value_tao: Decimal,
    pub total_end_value_tao: Decimal,
    pub total_net_flows_tao: Decimal,
    pub total_earnings_tao: Decimal,
    pub total_earnings_pct: Decimal,
    pub annualized_apy_pct: Decimal,
    pub by_netuid: Vec<NetuidEarnings>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EarningsBucket {
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub earnings_tao: Decimal,
    pub end_value_tao: Decimal,
}

pub struct EarningsEngine {
    store: Datastore,
}

impl EarningsEngine {
    pub fn new(store: Datastore) -> Self {
        Self { store }
    }

    pub async fn earnings_summary(
        &self,
        wallet: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<EarningsSummary, EarningsError> {
        if start >= end {
            return Err(EarningsError::InvalidWindow);
        }

        let netuids = self.store.snapshot_netuids(wallet).await?;
        if netuids.is_empty() {
            return Err(EarningsError::MissingSnapshot {
                wallet: wallet.to_string(),
                at: end,
            });
        }

        let window_txs = self
            .store
            .list_transactions_in_window(wallet, start, end)
            .await?;

        let mut by_netuid = Vec::new();
        let mut total_start = Decimal::ZERO;
        let mut total_end = Decimal::ZERO;
        let mut total_flows = Decimal::ZERO;
        let mut any_end_snapshot = false;

        for netuid in netuids {
            let start_snap = self
                .store
                .position_snapshot_on_or_before(wallet, netuid, start)
                .await?;
            let end_snap = self
                .store
                .position_snapshot_on_or_before(wallet, netuid, end)
                .await?;

            // A position born inside the window has no start snapshot;
            // its stakes show up in net_flows, so zero start is exact.
            let start_value = start_snap.map(|s| s.tao_value_mid).unwrap_or(Decimal::ZERO);
            let Some(end_snap) = end_snap else {
                continue;
            };
            any_end_snapshot = true;
            let end_value = end_snap.tao_value_mid;

            let net_flows: Decimal = window_txs
                .iter()
                .filter(|t| t.netuid == netuid)
                .map(|t| {
                    if t.tx_type.is_unstake() {
                        -t.amount_tao
                    } else {
                        t.amount_tao
                    }
                })
                .sum();

            let earnings = end_value - start_value - net_flows;
            let earnings_pct = if start_value > Decimal::ZERO {
                earnings / start_value * dec!(100)
            } else {
                Decimal::ZERO
            };

            total_start += start_value;
            total_end += end_value;
            total_flows += net_flows;
            by_netuid.push(NetuidEarnings {
                netuid,
                start_value_tao: start_value,
                end_value_tao: end_value,
                net_flows_tao: net_flows,
                earnings_tao: earnings,
                earnings_pct,
            });
        }

        if !any_end_snapshot {
            return Err(EarningsError::MissingSnapshot {
                wallet: wallet.to_string(),
                at: end,
            });
        }

        let total_earnings = total_end - total_start - total_flows;
        let total_pct = if total_start > Decimal::ZERO {
            total_earnings / total_start * dec!(100)
        } else {
            Decimal::ZERO
        };
        let window_days =
            Decimal::from((end - start).num_seconds()) / dec!(86400);
        let annualized = if total_start > Decimal::ZERO && window_days > Decimal::ZERO {
            total_earnings / total_start / window_days * dec!(365) * dec!(100)
        } else {
            Decimal::ZERO
        };

        Ok(EarningsSummary {
            wallet_address: wallet.to_string(),
            start,
            end,
            window_days,
            total_start_value_tao: total_start,
            total_end_value_tao: total_end,
            total_net_flows_tao: total_flows,
            total_earnings_tao: total_earnings,
            total_earnings_pct: total_pct,
            annualized_apy_pct: annualized,
            by_netuid,
        })
    }

    /// Earnings per time bucket for charting. `granularity` is `day` or
    /// `hour`; hourly windows are capped at 7 days.
    pub async fn earnings_timeseries(
        &self,
        wallet: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: &str,
    ) -> Result<Vec<EarningsBucket>, EarningsError> {
        if start >= end {
            return Err(EarningsError::InvalidWindow);
        }
        let step = match granularity {
            "hour" => {
                if end - start > Duration::hours(168) {
                    return Err(EarningsError::InvalidWindow);
                }
                Duration::hours(1)
            }
            _ => Duration::days(1),
        };

        let mut buckets = Vec::new();
        let mut cursor = start;
        while cursor < end {
            let bucket_end = (cursor + step).min(end);
            match self.earnings_summary(wallet, cursor, bucket_end).await {
                Ok(summary) => buckets.push(EarningsBucket {
                    bucket_start: cursor,
                    bucket_end,
                    earnings_tao: summary.total_earnings_tao,
                    end_value_tao: summary.total_end_value_tao,
                }),
                // Buckets preceding the first snapshot are skipped, not fatal.
                Err(EarningsError::MissingSnapshot { .. }) => {}
                Err(e) => return Err(e),
            }
            cursor = bucket_end;
        }
        Ok(buckets)
    }
}
