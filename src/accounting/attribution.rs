//! Performance attribution over a look-back window.
//!
//! Decomposes the flow-adjusted total return into yield income, price
//! effect and fees:
//!   `total_return = yield + price_effect - fees`
//! so `price_effect = total_return - yield + fees` (fees already reduce
//! the ending balance the earnings identity sees).

use super::earnings::{EarningsEngine, EarningsError};
use crate::db::Datastore;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct WaterfallEntry {
    pub label: &'static str,
    pub value_tao: Decimal,
    pub is_total: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionContribution {
    pub netuid: i64,
    pub start_value_tao: Decimal,
    pub return_tao: Decimal,
    pub yield_tao: Decimal,
    pub price_effect_tao: Decimal,
    pub weight_pct: Decimal,
    pub contribution_pct: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttributionReport {
    pub period_days: i64,
    pub nav_start_tao: Decimal,
    pub nav_end_tao: Decimal,
    pub total_return_tao: Decimal,
    pub yield_income_tao: Decimal,
    pub price_effect_tao: Decimal,
    pub fees_tao: Decimal,
    pub net_flows_tao: Decimal,
    pub waterfall: Vec<WaterfallEntry>,
    pub position_contributions: Vec<PositionContribution>,
}

pub struct AttributionEngine {
    store: Datastore,
}

impl AttributionEngine {
    pub fn new(store: Datastore) -> Self {
        Self { store }
    }

    pub async fn compute(
        &self,
        wallet: &str,
        days: i64,
    ) -> Result<AttributionReport, EarningsError> {
        let end = Utc::now();
        let start = end - Duration::days(days);
        let date_start = start.format("%Y-%m-%d").to_string();
        let date_end = end.format("%Y-%m-%d").to_string();

        let earnings = EarningsEngine::new(self.store.clone())
            .earnings_summary(wallet, start, end)
            .await?;

        let yield_tao = self
            .store
            .sum_yield_tao(wallet, &date_start, &date_end)
            .await?;
        let yield_by_netuid = self
            .store
            .sum_yield_tao_by_netuid(wallet, &date_start, &date_end)
            .await?;

        let fees_tao: Decimal = self
            .store
            .list_transactions_in_window(wallet, start, end)
            .await?
            .iter()
            .map(|t| t.fee_tao)
            .sum();

        let total_return = earnings.total_earnings_tao;
        let price_effect = total_return - yield_tao + fees_tao;
        let nav_start = earnings.total_start_value_tao;

        let mut contributions: Vec<PositionContribution> = earnings
            .by_netuid
            .iter()
            .map(|entry| {
                let pos_yield = yield_by_netuid
                    .iter()
                    .find(|(n, _)| *n == entry.netuid)
                    .map(|(_, y)| *y)
                    .unwrap_or(Decimal::ZERO);
                let weight_pct = if nav_start > Decimal::ZERO {
                    entry.start_value_tao / nav_start * dec!(100)
                } else {
                    Decimal::ZERO
                };
                let contribution_pct = if nav_start > Decimal::ZERO {
                    entry.earnings_tao / nav_start * dec!(100)
                } else {
                    Decimal::ZERO
                };
                PositionContribution {
                    netuid: entry.netuid,
                    start_value_tao: entry.start_value_tao,
                    return_tao: entry.earnings_tao,
                    yield_tao: pos_yield,
                    price_effect_tao: entry.earnings_tao - pos_yield,
                    weight_pct,
                    contribution_pct,
                }
            })
            .collect();
        contributions.sort_by(|a, b| {
            b.contribution_pct
                .abs()
                .cmp(&a.contribution_pct.abs())
        });

        let waterfall = vec![
            WaterfallEntry {
                label: "Starting NAV",
                value_tao: nav_start,
                is_total: true,
            },
            WaterfallEntry {
                label: "Yield Income",
                value_tao: yield_tao,
                is_total: false,
            },
            WaterfallEntry {
                label: "Price Effect",
                value_tao: price_effect,
                is_total: false,
            },
            WaterfallEntry {
                label: "Fees & Costs",
                value_tao: -fees_tao,
                is_total: false,
            },
            WaterfallEntry {
                label: "Net Flows",
                value_tao: earnings.total_net_flows_tao,
                is_total: false,
            },
            WaterfallEntry {
                label: "Ending NAV",
                value_tao: earnings.total_end_value_tao,
                is_total: true,
            },
        ];

        Ok(AttributionReport {
            period_days: days,
            nav_start_tao: nav_start,
            nav_end_tao: earnings.total_end_value_tao,
            total_return_tao: total_return,
            yield_income_tao: yield_tao,
            price_effect_tao: price_effect,
            fees_tao,
            net_flows_tao: earnings.total_net_flows_tao,
            waterfall,
            position_contributions: contributions,
        })
    }
}
