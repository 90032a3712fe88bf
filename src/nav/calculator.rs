//! Executable NAV and daily OHLC history.
//!
//! Executable NAV marks every position at what an immediate unstake would
//! actually return, net of estimated slippage. Daily rows keep OHLC in
//! both mid and executable prices plus a running ATH for drawdown.

use super::slippage::SlippageService;
use crate::db::{Datastore, NavHistoryRecord};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize)]
pub struct PositionNav {
    pub netuid: i64,
    pub nav_mid_tao: Decimal,
    pub exit_slippage_50pct: Decimal,
    pub exit_slippage_100pct: Decimal,
    pub nav_exec_50pct: Decimal,
    pub nav_exec_100pct: Decimal,
    pub slippage_defaulted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioNav {
    pub wallet_address: String,
    pub position_count: usize,
    pub nav_mid_tao: Decimal,
    pub nav_exec_50pct_tao: Decimal,
    pub nav_exec_100pct_tao: Decimal,
    pub total_exit_cost_tao: Decimal,
    pub positions: Vec<PositionNav>,
}

pub struct NavCalculator<'a> {
    store: Datastore,
    slippage: &'a SlippageService,
}

impl<'a> NavCalculator<'a> {
    pub fn new(store: Datastore, slippage: &'a SlippageService) -> Self {
        Self { store, slippage }
    }

    /// Compute executable NAV for a wallet and write the per-position
    /// executable values back onto the position rows.
    pub async fn compute_portfolio_nav(&self, wallet: &str) -> Result<PortfolioNav> {
        let positions = self.store.list_active_positions(wallet).await?;

        let mut breakdown = Vec::with_capacity(positions.len());
        let mut nav_mid = Decimal::ZERO;
        let mut nav_exec_50 = Decimal::ZERO;
        let mut nav_exec_100 = Decimal::ZERO;

        for position in &positions {
            let mid = position.tao_value_mid;

            let half = self
                .slippage
                .exit_slippage(position.netuid, mid / dec!(2), true)
                .await?;
            let full = self
                .slippage
                .exit_slippage(position.netuid, mid, true)
                .await?;

            // 50% exit: half the position sold at the half-size slippage,
            // the rest still marked at mid.
            let exec_50 =
                mid / dec!(2) * (dec!(1) - half.fraction) + mid / dec!(2);
            let exec_100 = mid * (dec!(1) - full.fraction);

            self.store
                .update_position_exec_values(
                    wallet,
                    position.netuid,
                    exec_50,
                    exec_100,
                    half.fraction,
                    full.fraction,
                )
                .await?;

            nav_mid += mid;
            nav_exec_50 += exec_50;
            nav_exec_100 += exec_100;
            breakdown.push(PositionNav {
                netuid: position.netuid,
                nav_mid_tao: mid,
                exit_slippage_50pct: half.fraction,
                exit_slippage_100pct: full.fraction,
                nav_exec_50pct: exec_50,
                nav_exec_100pct: exec_100,
                slippage_defaulted: half.default_used || full.default_used,
            });
            debug!(
                netuid = position.netuid,
                mid = %mid,
                exec_100 = %exec_100,
                "position marked at executable price"
            );
        }

        info!(
            wallet,
            nav_mid = %nav_mid,
            nav_exec = %nav_exec_100,
            positions = breakdown.len(),
            "portfolio NAV computed"
        );
        Ok(PortfolioNav {
            wallet_address: wallet.to_string(),
            position_count: breakdown.len(),
            nav_mid_tao: nav_mid,
            nav_exec_50pct_tao: nav_exec_50,
            nav_exec_100pct_tao: nav_exec_100,
            total_exit_cost_tao: nav_mid - nav_exec_100,
            positions: breakdown,
        })
    }

    /// Upsert the OHLC row for the day containing `at`.
    ///
    /// `close` = current values; `open` is first write of the day;
    /// `high`/`low` extend; `ath = max(prior ath, close)`; daily return
    /// is measured against the previous day's executable close.
    pub async fn record_nav_day(
        &self,
        wallet: &str,
        nav_mid: Decimal,
        nav_exec: Decimal,
        at: DateTime<Utc>,
    ) -> Result<NavHistoryRecord> {
        let date = at.format("%Y-%m-%d").to_string();
        let existing = self.store.get_nav_day(wallet, &date).await?;
        let prior = self.store.latest_nav_before(wallet, &date).await?;

        let record = match existing {
            Some(mut day) => {
                day.nav_mid_high = day.nav_mid_high.max(nav_mid);
                day.nav_mid_low = day.nav_mid_low.min(nav_mid);
                day.nav_mid_close = nav_mid;
                day.nav_exec_high = day.nav_exec_high.max(nav_exec);
                day.nav_exec_low = day.nav_exec_low.min(nav_exec);
                day.nav_exec_close = nav_exec;
                day.nav_exec_ath = day.nav_exec_ath.max(nav_exec);
                if let Some(prior) = &prior {
                    day.daily_return_tao = nav_exec - prior.nav_exec_close;
                    day.daily_return_pct = if prior.nav_exec_close > Decimal::ZERO {
                        day.daily_return_tao / prior.nav_exec_close * dec!(100)
                    } else {
                        Decimal::ZERO
                    };
                }
                day
            }
            None => {
                let prior_close = prior.as_ref().map(|p| p.nav_exec_close);
                let prior_ath = prior
                    .as_ref()
                    .map(|p| p.nav_exec_ath)
                    .unwrap_or(Decimal::ZERO);
                let daily_return = prior_close.map(|c| nav_exec - c).unwrap_or(Decimal::ZERO);
                let daily_return_pct = match prior_close {
                    Some(c) if c > Decimal::ZERO => daily_return / c * dec!(100),
                    _ => Decimal::ZERO,
                };
                NavHistoryRecord {
                    wallet_address: wallet.to_string(),
                    date,
                    nav_mid_open: nav_mid,
                    nav_mid_high: nav_mid,
                    nav_mid_low: nav_mid,
                    nav_mid_close: nav_mid,
                    nav_exec_open: nav_exec,
                    nav_exec_high: nav_exec,
                    nav_exec_low: nav_exec,
                    nav_exec_close: nav_exec,
                    nav_exec_ath: prior_ath.max(nav_exec),
                    daily_return_tao: daily_return,
                    daily_return_pct,
                }
            }
        };

        self.store.upsert_nav_day(&record).await?;
        Ok(record)
    }

    /// Current drawdown from the executable ATH: `(ath - close) / ath`.
    pub async fn current_drawdown(&self, wallet: &str, at: DateTime<Utc>) -> Result<Decimal> {
        let date = at.format("%Y-%m-%d").to_string();
        let day = match self.store.get_nav_day(wallet, &date).await? {
            Some(day) => day,
            None => match self.store.latest_nav_before(wallet, &date).await? {
                Some(day) => day,
                None => return Ok(Decimal::ZERO),
            },
        };
        if day.nav_exec_ath <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        Ok((day.nav_exec_ath - day.nav_exec_close) / day.nav_exec_ath)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::client::TaostatsClient;
    use crate::models::Config;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn service(store: &Datastore) -> SlippageService {
        std::env::set_var("TAOSTATS_API_KEY", "test-key");
        std::env::set_var("WALLET_ADDRESS", "5W");
        let config = Config::from_env().unwrap();
        let client = TaostatsClient::new(&config, Cache::disabled()).unwrap();
        SlippageService::new(store.clone(), client)
    }

    fn day(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, d, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn ohlc_invariants_hold_across_writes() {
        let store = Datastore::open_in_memory().unwrap();
        let slippage = service(&store);
        let calc = NavCalculator::new(store.clone(), &slippage);

        calc.record_nav_day("5W", dec!(100), dec!(98), day(1, 9))
            .await
            .unwrap();
        calc.record_nav_day("5W", dec!(110), dec!(107), day(1, 12))
            .await
            .unwrap();
        let rec = calc
            .record_nav_day("5W", dec!(104), dec!(101), day(1, 18))
            .await
            .unwrap();

        assert_eq!(rec.nav_exec_open, dec!(98));
        assert_eq!(rec.nav_exec_high, dec!(107));
        assert_eq!(rec.nav_exec_low, dec!(98));
        assert_eq!(rec.nav_exec_close, dec!(101));
        assert!(rec.nav_exec_high >= rec.nav_exec_close);
        assert!(rec.nav_exec_low <= rec.nav_exec_close);
        assert_eq!(rec.nav_exec_ath, dec!(107));
        assert!(rec.nav_exec_ath >= rec.nav_exec_close);
    }

    #[tokio::test]
    async fn ath_never_decreases_across_days() {
        let store = Datastore::open_in_memory().unwrap();
        let slippage = service(&store);
        let calc = NavCalculator::new(store.clone(), &slippage);

        calc.record_nav_day("5W", dec!(120), dec!(118), day(1, 12))
            .await
            .unwrap();
        let d2 = calc
            .record_nav_day("5W", dec!(100), dec!(96), day(2, 12))
            .await
            .unwrap();

        assert_eq!(d2.nav_exec_ath, dec!(118));
        assert_eq!(d2.daily_return_tao, dec!(-22));

        let drawdown = calc.current_drawdown("5W", day(2, 13)).await.unwrap();
        assert_eq!(drawdown, (dec!(118) - dec!(96)) / dec!(118));
    }

    #[tokio::test]
    async fn executable_nav_uses_default_when_no_surface() {
        use crate::db::PositionRecord;

        let store = Datastore::open_in_memory().unwrap();
        let mut pos = PositionRecord::new("5W", 3);
        pos.alpha_balance = dec!(10);
        pos.tao_value_mid = dec!(100);
        store.apply_position_balances("5W", &[pos]).await.unwrap();

        let slippage = service(&store);
        let calc = NavCalculator::new(store.clone(), &slippage);
        let nav = calc.compute_portfolio_nav("5W").await.unwrap();

        assert_eq!(nav.position_count, 1);
        assert!(nav.positions[0].slippage_defaulted);
        // Conservative 2% default on the full exit.
        assert_eq!(nav.nav_exec_100pct_tao, dec!(98.00));

        let stored = store.get_position("5W", 3).await.unwrap().unwrap();
        assert_eq!(stored.tao_value_exec_100pct, dec!(98.00));
    }

    #[tokio::test]
    async fn root_position_carries_no_slippage() {
        use crate::db::PositionRecord;

        let store = Datastore::open_in_memory().unwrap();
        let mut pos = PositionRecord::new("5W", 0);
        pos.alpha_balance = dec!(500);
        pos.tao_value_mid = dec!(500);
        store.apply_position_balances("5W", &[pos]).await.unwrap();

        let slippage = service(&store);
        let calc = NavCalculator::new(store.clone(), &slippage);
        let nav = calc.compute_portfolio_nav("5W").await.unwrap();
        assert_eq!(nav.nav_exec_100pct_tao, dec!(500));
        assert_eq!(nav.total_exit_cost_tao, dec!(0));
    }
}
