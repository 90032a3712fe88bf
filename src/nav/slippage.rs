//! Slippage surface maintenance and interpolation.
//!
//! The deep sync tier quotes the upstream at fixed ladder sizes per
//! subnet and direction; lookups interpolate linearly between the two
//! bracketing sizes and clamp outside the cached range. Root (netuid 0)
//! never has slippage.

use crate::client::TaostatsClient;
use crate::db::{Datastore, SlippageSurfaceRecord};
use crate::models::SlippageAction;
use anyhow::Result;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ladder of trade sizes (TAO) quoted per subnet and direction.
pub fn ladder_sizes() -> [Decimal; 5] {
    [dec!(2), dec!(5), dec!(10), dec!(15), dec!(20)]
}

/// Surfaces expire quickly; pool state moves under them.
const SURFACE_TTL_MINUTES: i64 = 5;

/// Conservative fallback when no surface is available.
pub const DEFAULT_EXIT_SLIPPAGE: Decimal = dec!(0.02);

/// A slippage estimate and how it was produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlippageEstimate {
    /// Fraction (0.02 = 2%), not percent.
    pub fraction: Decimal,
    pub stale: bool,
    pub default_used: bool,
}

impl SlippageEstimate {
    pub fn none() -> Self {
        Self {
            fraction: Decimal::ZERO,
            stale: false,
            default_used: false,
        }
    }
}

/// Clamped linear interpolation over cached surfaces (ascending sizes).
/// Below the smallest size returns the smallest slippage, above the
/// largest the largest. Returns percent, like the stored quotes.
pub fn interpolate_slippage_pct(
    surfaces: &[SlippageSurfaceRecord],
    size_tao: Decimal,
) -> Option<Decimal> {
    if surfaces.is_empty() {
        return None;
    }

    let mut lower: Option<&SlippageSurfaceRecord> = None;
    let mut upper: Option<&SlippageSurfaceRecord> = None;
    for s in surfaces {
        if s.size_tao <= size_tao {
            lower = Some(s);
        }
        if s.size_tao >= size_tao && upper.is_none() {
            upper = Some(s);
        }
    }

    match (lower, upper) {
        (None, _) => Some(surfaces[0].slippage_pct),
        (_, None) => Some(surfaces[surfaces.len() - 1].slippage_pct),
        (Some(lo), Some(hi)) => {
            if lo.size_tao == hi.size_tao {
                return Some(lo.slippage_pct);
            }
            let ratio = (size_tao - lo.size_tao) / (hi.size_tao - lo.size_tao);
            Some(lo.slippage_pct + ratio * (hi.slippage_pct - lo.slippage_pct))
        }
    }
}

#[derive(Debug, Default)]
pub struct SlippageSyncSummary {
    pub positions_processed: usize,
    pub surfaces_updated: usize,
    pub errors: Vec<String>,
}

pub struct SlippageService {
    store: Datastore,
    client: Arc<TaostatsClient>,
}

impl SlippageService {
    pub fn new(store: Datastore, client: Arc<TaostatsClient>) -> Self {
        Self { store, client }
    }

    /// Refresh the surface ladder for every active position of a wallet.
    pub async fn sync_surfaces(
        &self,
        wallet: &str,
        cancel: &CancellationToken,
    ) -> Result<SlippageSyncSummary> {
        let mut summary = SlippageSyncSummary::default();
        let positions = self.store.list_active_positions(wallet).await?;

        for position in positions {
            if cancel.is_cancelled() {
                break;
            }
            if position.netuid == 0 {
                continue;
            }
            match self.sync_subnet_surfaces(position.netuid, cancel).await {
                Ok(count) => {
                    summary.positions_processed += 1;
                    summary.surfaces_updated += count;
                }
                Err(e) => {
                    warn!(netuid = position.netuid, error = %e, "slippage sync failed");
                    summary.errors.push(format!("SN{}: {e}", position.netuid));
                }
            }
        }

        let removed = self.store.cleanup_expired_surfaces(Utc::now()).await?;
        if removed > 0 {
            debug!(removed, "expired slippage surfaces dropped");
        }
        info!(
            wallet,
            surfaces = summary.surfaces_updated,
            errors = summary.errors.len(),
            "slippage sync completed"
        );
        Ok(summary)
    }

    async fn sync_subnet_surfaces(
        &self,
        netuid: i64,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut count = 0usize;
        let now = Utc::now();
        let expires_at = now + Duration::minutes(SURFACE_TTL_MINUTES);

        for action in [SlippageAction::Stake, SlippageAction::Unstake] {
            for size in ladder_sizes() {
                if cancel.is_cancelled() {
                    return Ok(count);
                }
                let Some(quote) = self.client.slippage(netuid, size, action).await? else {
                    continue;
                };
                self.store
                    .upsert_slippage_surface(&SlippageSurfaceRecord {
                        netuid,
                        action,
                        size_tao: size,
                        slippage_pct: quote.slippage_percentage.unwrap_or(Decimal::ZERO),
                        expected_output: quote.expected_output.unwrap_or(Decimal::ZERO),
                        pool_tao_reserve: quote
                            .tao_reserve
                            .as_deref()
                            .and_then(crate::units::rao_str_to_tao)
                            .unwrap_or(Decimal::ZERO),
                        pool_alpha_reserve: quote
                            .alpha_reserve
                            .as_deref()
                            .and_then(crate::units::rao_str_to_tao)
                            .unwrap_or(Decimal::ZERO),
                        computed_at: now,
                        expires_at,
                    })
                    .await?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Exit slippage for unstaking `size_tao` from a subnet, as a
    /// fraction. Stale surfaces are used only when `allow_stale`, and
    /// flagged. With no surface at all the conservative default applies.
    pub async fn exit_slippage(
        &self,
        netuid: i64,
        size_tao: Decimal,
        allow_stale: bool,
    ) -> Result<SlippageEstimate> {
        if netuid == 0 {
            return Ok(SlippageEstimate::none());
        }

        let surfaces = self
            .store
            .list_slippage_surfaces(netuid, SlippageAction::Unstake)
            .await?;
        let now = Utc::now();
        let fresh: Vec<SlippageSurfaceRecord> = surfaces
            .iter()
            .filter(|s| !s.is_expired(now))
            .cloned()
            .collect();

        let (usable, stale) = if !fresh.is_empty() {
            (fresh, false)
        } else if allow_stale && !surfaces.is_empty() {
            (surfaces, true)
        } else {
            return Ok(SlippageEstimate {
                fraction: DEFAULT_EXIT_SLIPPAGE,
                stale: false,
                default_used: true,
            });
        };

        match interpolate_slippage_pct(&usable, size_tao) {
            Some(pct) => Ok(SlippageEstimate {
                fraction: pct / dec!(100),
                stale,
                default_used: false,
            }),
            None => Ok(SlippageEstimate {
                fraction: DEFAULT_EXIT_SLIPPAGE,
                stale: false,
                default_used: true,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface(size: Decimal, slip: Decimal) -> SlippageSurfaceRecord {
        let now = Utc::now();
        SlippageSurfaceRecord {
            netuid: 1,
            action: SlippageAction::Unstake,
            size_tao: size,
            slippage_pct: slip,
            expected_output: Decimal::ZERO,
            pool_tao_reserve: Decimal::ZERO,
            pool_alpha_reserve: Decimal::ZERO,
            computed_at: now,
            expires_at: now + Duration::minutes(5),
        }
    }

    #[test]
    fn interpolation_is_linear_between_points() {
        let surfaces = vec![surface(dec!(2), dec!(0.2)), surface(dec!(10), dec!(1.0))];
        assert_eq!(
            interpolate_slippage_pct(&surfaces, dec!(6)),
            Some(dec!(0.6))
        );
    }

    #[test]
    fn interpolation_clamps_outside_range() {
        let surfaces = vec![surface(dec!(2), dec!(0.2)), surface(dec!(10), dec!(1.0))];
        assert_eq!(
            interpolate_slippage_pct(&surfaces, dec!(1)),
            Some(dec!(0.2))
        );
        assert_eq!(
            interpolate_slippage_pct(&surfaces, dec!(50)),
            Some(dec!(1.0))
        );
    }

    #[test]
    fn interpolation_is_monotone_for_monotone_surfaces() {
        let surfaces = vec![
            surface(dec!(2), dec!(0.2)),
            surface(dec!(5), dec!(0.5)),
            surface(dec!(10), dec!(1.1)),
        ];
        let mut prev = Decimal::ZERO;
        for i in 1..=20 {
            let size = Decimal::from(i);
            let slip = interpolate_slippage_pct(&surfaces, size).unwrap();
            assert!(slip >= prev, "slippage decreased at size {size}");
            assert!(slip >= dec!(0.2) && slip <= dec!(1.1));
            prev = slip;
        }
    }

    #[test]
    fn exact_point_returns_cached_value() {
        let surfaces = vec![surface(dec!(2), dec!(0.2)), surface(dec!(5), dec!(0.5))];
        assert_eq!(
            interpolate_slippage_pct(&surfaces, dec!(5)),
            Some(dec!(0.5))
        );
    }

    #[test]
    fn empty_surface_set_yields_none() {
        assert_eq!(interpolate_slippage_pct(&[], dec!(5)), None);
    }
}
