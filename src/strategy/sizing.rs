//! Position sizing caps.
//!
//! A position is capped by the tighter of:
//! - the concentration cap (fraction of executable NAV), and
//! - the exitability cap (largest size whose full-exit slippage stays
//!   inside the configured slippage limit, read off the cached surface).

use crate::db::SlippageSurfaceRecord;
use crate::models::Config;
use crate::nav::interpolate_slippage_pct;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct PositionLimit {
    pub netuid: i64,
    pub max_tao: Decimal,
    pub target_tao: Decimal,
    pub cap_source: &'static str,
}

pub struct PositionSizer {
    config: Arc<Config>,
}

impl PositionSizer {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Largest cached surface size whose slippage stays inside
    /// `max_slippage` (a fraction). None when even the smallest cached
    /// size breaches the limit; unlimited (no cap) when all sizes fit.
    fn exitability_cap(
        surfaces: &[SlippageSurfaceRecord],
        max_slippage: Decimal,
    ) -> Option<Option<Decimal>> {
        if surfaces.is_empty() {
            return Some(None);
        }
        let limit_pct = max_slippage * dec!(100);
        let mut best: Option<Decimal> = None;
        for s in surfaces {
            match interpolate_slippage_pct(surfaces, s.size_tao) {
                Some(pct) if pct <= limit_pct => best = Some(s.size_tao),
                _ => {}
            }
        }
        match best {
            None => None,
            Some(size) if Some(size) == surfaces.last().map(|s| s.size_tao) => {
                // Every cached size fits; the surface does not bind.
                Some(None)
            }
            Some(size) => Some(Some(size)),
        }
    }

    /// Cap and target for one subnet position given executable NAV and
    /// the unstake-side surface.
    pub fn position_limit(
        &self,
        netuid: i64,
        nav_exec: Decimal,
        surfaces: &[SlippageSurfaceRecord],
    ) -> PositionLimit {
        let concentration_cap = nav_exec * self.config.max_position_concentration;
        let target = nav_exec * self.config.default_position_concentration;

        let (max_tao, cap_source) =
            match Self::exitability_cap(surfaces, self.config.max_exit_slippage_100pct) {
                None => (Decimal::ZERO, "exitability"),
                Some(None) => (concentration_cap, "concentration"),
                Some(Some(exit_cap)) => {
                    if exit_cap < concentration_cap {
                        (exit_cap, "exitability")
                    } else {
                        (concentration_cap, "concentration")
                    }
                }
            };

        PositionLimit {
            netuid,
            max_tao,
            target_tao: target.min(max_tao),
            cap_source,
        }
    }

    /// Bounds on the count of sleeve positions.
    pub fn position_count_bounds(&self) -> (usize, usize) {
        (self.config.min_positions, self.config.max_positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SlippageAction;
    use chrono::{Duration, Utc};

    fn sizer() -> PositionSizer {
        std::env::set_var("TAOSTATS_API_KEY", "test-key");
        std::env::set_var("WALLET_ADDRESS", "5W");
        PositionSizer::new(Arc::new(Config::from_env().unwrap()))
    }

    fn surface(size: Decimal, slip_pct: Decimal) -> SlippageSurfaceRecord {
        let now = Utc::now();
        SlippageSurfaceRecord {
            netuid: 1,
            action: SlippageAction::Unstake,
            size_tao: size,
            slippage_pct: slip_pct,
            expected_output: Decimal::ZERO,
            pool_tao_reserve: Decimal::ZERO,
            pool_alpha_reserve: Decimal::ZERO,
            computed_at: now,
            expires_at: now + Duration::minutes(5),
        }
    }

    #[test]
    fn concentration_cap_binds_with_liquid_surface() {
        // All ladder sizes far under the 10% slippage limit.
        let surfaces = vec![surface(dec!(2), dec!(0.1)), surface(dec!(20), dec!(0.8))];
        let limit = sizer().position_limit(1, dec!(1000), &surfaces);
        // 15% of 1000.
        assert_eq!(limit.max_tao, dec!(150.00));
        assert_eq!(limit.cap_source, "concentration");
        // 10% default target.
        assert_eq!(limit.target_tao, dec!(100.00));
    }

    #[test]
    fn exitability_cap_binds_on_thin_pool() {
        // 10 TAO already costs 12% to exit (limit is 10%).
        let surfaces = vec![
            surface(dec!(2), dec!(2)),
            surface(dec!(5), dec!(8)),
            surface(dec!(10), dec!(12)),
        ];
        let limit = sizer().position_limit(1, dec!(1000), &surfaces);
        assert_eq!(limit.max_tao, dec!(5));
        assert_eq!(limit.cap_source, "exitability");
        assert_eq!(limit.target_tao, dec!(5));
    }

    #[test]
    fn untradeable_pool_caps_to_zero() {
        let surfaces = vec![surface(dec!(2), dec!(15))];
        let limit = sizer().position_limit(1, dec!(1000), &surfaces);
        assert_eq!(limit.max_tao, Decimal::ZERO);
    }

    #[test]
    fn no_surface_falls_back_to_concentration() {
        let limit = sizer().position_limit(1, dec!(2000), &[]);
        assert_eq!(limit.max_tao, dec!(300.00));
        assert_eq!(limit.cap_source, "concentration");
    }
}
