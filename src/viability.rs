//! Subnet viability scoring.
//!
//! Hard-fail gates first; survivors get a weighted sum of percentile
//! ranks over six metrics, mapped to tiers by configurable cut-points.
//! Configuration resolves from the single active DB row, falling back to
//! static defaults; admin updates validate the weight sum and invalidate
//! the in-memory copy.

use crate::db::{Datastore, SubnetRecord, ViabilityConfigRecord};
use crate::models::ViabilityTier;
use anyhow::Result;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

const WEIGHT_SUM_TOLERANCE: Decimal = dec!(0.001);

#[derive(Debug, Error)]
pub enum ViabilityError {
    #[error("viability weights must sum to 1.0 +/- {tolerance} (got {sum})")]
    WeightsSum { sum: Decimal, tolerance: Decimal },

    #[error("tier cut-points must be strictly descending and positive")]
    TierOrdering,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Static defaults used when no active DB config exists.
pub fn default_config() -> ViabilityConfigRecord {
    ViabilityConfigRecord {
        config_name: "default".into(),
        min_tao_reserve: dec!(1000),
        min_emission_share: dec!(0.001),
        min_age_days: 30,
        min_holders: 50,
        max_drawdown_30d: dec!(0.60),
        max_negative_flow_ratio: dec!(0.20),
        weight_tao_reserve: dec!(0.25),
        weight_net_flow_7d: dec!(0.25),
        weight_emission_share: dec!(0.15),
        weight_price_trend_7d: dec!(0.15),
        weight_subnet_age: dec!(0.10),
        weight_max_drawdown_30d: dec!(0.10),
        tier_1_min: 70,
        tier_2_min: 50,
        tier_3_min: 30,
        age_cap_days: 365,
        enabled: true,
    }
}

fn weight_sum(config: &ViabilityConfigRecord) -> Decimal {
    config.weight_tao_reserve
        + config.weight_net_flow_7d
        + config.weight_emission_share
        + config.weight_price_trend_7d
        + config.weight_subnet_age
        + config.weight_max_drawdown_30d
}

/// Validate an admin-supplied config before it becomes active.
pub fn validate_config(config: &ViabilityConfigRecord) -> Result<(), ViabilityError> {
    let sum = weight_sum(config);
    if (sum - Decimal::ONE).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(ViabilityError::WeightsSum {
            sum,
            tolerance: WEIGHT_SUM_TOLERANCE,
        });
    }
    if !(config.tier_1_min > config.tier_2_min
        && config.tier_2_min > config.tier_3_min
        && config.tier_3_min > 0)
    {
        return Err(ViabilityError::TierOrdering);
    }
    Ok(())
}

/// Per-subnet inputs to the scorer.
#[derive(Debug, Clone)]
pub struct SubnetMetrics {
    pub netuid: i64,
    pub tao_reserve: Decimal,
    pub net_flow_7d: Decimal,
    pub emission_share: Decimal,
    pub price_trend_7d: Decimal,
    pub age_days: i64,
    pub holder_count: i64,
    pub max_drawdown_30d: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredSubnet {
    pub netuid: i64,
    pub score: Option<Decimal>,
    pub tier: ViabilityTier,
    pub hard_fail_reasons: Vec<String>,
}

/// Percentile rank of `value` within `all` (0..=100). Single-element
/// populations rank at 50.
fn percentile_rank(all: &[Decimal], value: Decimal) -> Decimal {
    if all.len() <= 1 {
        return dec!(50);
    }
    let below = all.iter().filter(|v| **v < value).count();
    let equal = all.iter().filter(|v| **v == value).count();
    // Midpoint treatment for ties keeps the rank stable under duplicates.
    let rank = Decimal::from(below) + Decimal::from(equal.saturating_sub(1)) / dec!(2);
    rank / Decimal::from(all.len() - 1) * dec!(100)
}

fn hard_fail_reasons(m: &SubnetMetrics, config: &ViabilityConfigRecord) -> Vec<String> {
    let mut reasons = Vec::new();
    if m.tao_reserve < config.min_tao_reserve {
        reasons.push(format!(
            "tao_reserve {} < min {}",
            m.tao_reserve, config.min_tao_reserve
        ));
    }
    if m.emission_share < config.min_emission_share {
        reasons.push(format!(
            "emission_share {} < min {}",
            m.emission_share, config.min_emission_share
        ));
    }
    if m.age_days < config.min_age_days {
        reasons.push(format!("age_days {} < min {}", m.age_days, config.min_age_days));
    }
    if m.holder_count < config.min_holders {
        reasons.push(format!(
            "holder_count {} < min {}",
            m.holder_count, config.min_holders
        ));
    }
    if m.max_drawdown_30d > config.max_drawdown_30d {
        reasons.push(format!(
            "max_drawdown_30d {} > max {}",
            m.max_drawdown_30d, config.max_drawdown_30d
        ));
    }
    if m.tao_reserve > Decimal::ZERO {
        let flow_ratio = m.net_flow_7d / m.tao_reserve;
        if flow_ratio < -config.max_negative_flow_ratio {
            reasons.push(format!(
                "net_flow_7d/reserve {} < -{}",
                flow_ratio, config.max_negative_flow_ratio
            ));
        }
    }
    reasons
}

/// Score the whole population at once; percentile ranks are relative to
/// the subnets that cleared the hard fails.
pub fn score_population(
    metrics: &[SubnetMetrics],
    config: &ViabilityConfigRecord,
) -> Vec<ScoredSubnet> {
    let mut results: Vec<ScoredSubnet> = Vec::with_capacity(metrics.len());
    let mut passing: Vec<&SubnetMetrics> = Vec::new();

    for m in metrics {
        let reasons = hard_fail_reasons(m, config);
        if reasons.is_empty() {
            passing.push(m);
        }
        results.push(ScoredSubnet {
            netuid: m.netuid,
            score: None,
            tier: ViabilityTier::Unviable,
            hard_fail_reasons: reasons,
        });
    }

    let reserves: Vec<Decimal> = passing.iter().map(|m| m.tao_reserve).collect();
    let flows: Vec<Decimal> = passing.iter().map(|m| m.net_flow_7d).collect();
    let emissions: Vec<Decimal> = passing.iter().map(|m| m.emission_share).collect();
    let trends: Vec<Decimal> = passing.iter().map(|m| m.price_trend_7d).collect();
    let ages: Vec<Decimal> = passing
        .iter()
        .map(|m| Decimal::from(m.age_days.min(config.age_cap_days)))
        .collect();
    // Drawdown is inverted: smaller is better.
    let drawdowns: Vec<Decimal> = passing.iter().map(|m| -m.max_drawdown_30d).collect();

    for m in &passing {
        let score = config.weight_tao_reserve * percentile_rank(&reserves, m.tao_reserve)
            + config.weight_net_flow_7d * percentile_rank(&flows, m.net_flow_7d)
            + config.weight_emission_share * percentile_rank(&emissions, m.emission_share)
            + config.weight_price_trend_7d * percentile_rank(&trends, m.price_trend_7d)
            + config.weight_subnet_age
                * percentile_rank(&ages, Decimal::from(m.age_days.min(config.age_cap_days)))
            + config.weight_max_drawdown_30d
                * percentile_rank(&drawdowns, -m.max_drawdown_30d);

        let tier = if score >= Decimal::from(config.tier_1_min) {
            ViabilityTier::Tier1
        } else if score >= Decimal::from(config.tier_2_min) {
            ViabilityTier::Tier2
        } else if score >= Decimal::from(config.tier_3_min) {
            ViabilityTier::Tier3
        } else {
            ViabilityTier::Unviable
        };

        if let Some(entry) = results.iter_mut().find(|r| r.netuid == m.netuid) {
            entry.score = Some(score.round_dp(2));
            entry.tier = tier;
        }
    }

    results
}

pub struct ViabilityScorer {
    store: Datastore,
    cached_config: RwLock<Option<ViabilityConfigRecord>>,
}

impl ViabilityScorer {
    pub fn new(store: Datastore) -> Self {
        Self {
            store,
            cached_config: RwLock::new(None),
        }
    }

    /// Active config: DB row when present, static defaults otherwise.
    pub async fn active_config(&self) -> Result<ViabilityConfigRecord> {
        if let Some(config) = self.cached_config.read().clone() {
            return Ok(config);
        }
        let config = self
            .store
            .get_active_viability_config()
            .await?
            .unwrap_or_else(default_config);
        *self.cached_config.write() = Some(config.clone());
        Ok(config)
    }

    /// Validate, persist as the single active row, and drop the cached
    /// copy so the next scoring pass sees the update.
    pub async fn update_config(
        &self,
        config: ViabilityConfigRecord,
    ) -> Result<(), ViabilityError> {
        validate_config(&config)?;
        self.store.set_active_viability_config(&config).await?;
        *self.cached_config.write() = None;
        info!(config = %config.config_name, "viability config updated");
        Ok(())
    }

    pub fn invalidate(&self) {
        *self.cached_config.write() = None;
    }

    /// Score every subnet with liquidity and persist score + tier.
    pub async fn score_all(&self) -> Result<Vec<ScoredSubnet>> {
        let config = self.active_config().await?;
        if !config.enabled {
            debug!("viability scoring disabled by config");
            return Ok(Vec::new());
        }

        let subnets = self.store.list_subnets_with_liquidity().await?;
        let mut metrics = Vec::with_capacity(subnets.len());
        for subnet in &subnets {
            metrics.push(self.metrics_for(subnet).await?);
        }

        let scored = score_population(&metrics, &config);
        for entry in &scored {
            self.store
                .update_subnet_viability(entry.netuid, entry.score, entry.tier.as_str())
                .await?;
        }
        info!(subnets = scored.len(), "viability scoring completed");
        Ok(scored)
    }

    async fn metrics_for(&self, subnet: &SubnetRecord) -> Result<SubnetMetrics> {
        let now = Utc::now();
        let prices_7d = self
            .store
            .subnet_price_history(subnet.netuid, now - Duration::days(7))
            .await?;
        let prices_30d = self
            .store
            .subnet_price_history(subnet.netuid, now - Duration::days(30))
            .await?;

        let price_trend_7d = match (prices_7d.first(), prices_7d.last()) {
            (Some((_, first)), Some((_, last))) if *first > Decimal::ZERO => {
                (*last - *first) / *first
            }
            _ => Decimal::ZERO,
        };

        // Max peak-to-trough over the 30d price path.
        let mut peak = Decimal::ZERO;
        let mut max_drawdown = Decimal::ZERO;
        for (_, price) in &prices_30d {
            if *price > peak {
                peak = *price;
            } else if peak > Decimal::ZERO {
                max_drawdown = max_drawdown.max((peak - *price) / peak);
            }
        }

        Ok(SubnetMetrics {
            netuid: subnet.netuid,
            tao_reserve: subnet.pool_tao_reserve,
            net_flow_7d: subnet.taoflow_7d * subnet.pool_tao_reserve,
            emission_share: subnet.emission_share,
            price_trend_7d,
            age_days: subnet.age_days,
            holder_count: subnet.holder_count,
            max_drawdown_30d: max_drawdown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(netuid: i64, reserve: Decimal, flow: Decimal) -> SubnetMetrics {
        SubnetMetrics {
            netuid,
            tao_reserve: reserve,
            net_flow_7d: flow,
            emission_share: dec!(0.02),
            price_trend_7d: dec!(0.01),
            age_days: 200,
            holder_count: 300,
            max_drawdown_30d: dec!(0.1),
        }
    }

    #[test]
    fn weights_must_sum_to_one() {
        let mut config = default_config();
        assert!(validate_config(&config).is_ok());

        config.weight_tao_reserve = dec!(0.30);
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ViabilityError::WeightsSum { .. }));

        // Inside the 0.001 tolerance passes.
        let mut config = default_config();
        config.weight_tao_reserve = dec!(0.2505);
        config.weight_net_flow_7d = dec!(0.2500);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn tier_cutpoints_must_descend() {
        let mut config = default_config();
        config.tier_2_min = 80;
        assert!(matches!(
            validate_config(&config).unwrap_err(),
            ViabilityError::TierOrdering
        ));
    }

    #[test]
    fn hard_fail_yields_unviable_with_no_score() {
        let config = default_config();
        let mut weak = metrics(1, dec!(100), dec!(0));
        weak.holder_count = 10;
        let strong = metrics(2, dec!(50000), dec!(500));

        let scored = score_population(&[weak, strong], &config);
        let weak_result = scored.iter().find(|s| s.netuid == 1).unwrap();
        assert_eq!(weak_result.tier, ViabilityTier::Unviable);
        assert!(weak_result.score.is_none());
        assert!(weak_result.hard_fail_reasons.len() >= 2);

        let strong_result = scored.iter().find(|s| s.netuid == 2).unwrap();
        assert!(strong_result.score.is_some());
    }

    #[test]
    fn negative_flow_ratio_hard_fails() {
        let config = default_config();
        let mut m = metrics(1, dec!(10000), dec!(-3000));
        let reasons = hard_fail_reasons(&m, &config);
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("net_flow_7d"));

        m.net_flow_7d = dec!(-1000);
        assert!(hard_fail_reasons(&m, &config).is_empty());
    }

    #[test]
    fn better_metrics_rank_higher() {
        let config = default_config();
        let population: Vec<SubnetMetrics> = (1..=5)
            .map(|i| {
                let mut m = metrics(i, Decimal::from(i * 10_000), Decimal::from(i * 100));
                m.emission_share = Decimal::from(i) / dec!(100);
                m.price_trend_7d = Decimal::from(i) / dec!(50);
                m
            })
            .collect();

        let scored = score_population(&population, &config);
        let best = scored.iter().find(|s| s.netuid == 5).unwrap();
        let worst = scored.iter().find(|s| s.netuid == 1).unwrap();
        assert!(best.score.unwrap() > worst.score.unwrap());
        assert_eq!(best.tier, ViabilityTier::Tier1);
    }

    #[test]
    fn percentile_rank_midpoints_ties() {
        let all = vec![dec!(1), dec!(2), dec!(2), dec!(3)];
        let rank_low = percentile_rank(&all, dec!(1));
        let rank_mid = percentile_rank(&all, dec!(2));
        let rank_high = percentile_rank(&all, dec!(3));
        assert!(rank_low < rank_mid && rank_mid < rank_high);
        assert_eq!(rank_low, dec!(0));
        assert_eq!(rank_high, dec!(100));
    }

    #[tokio::test]
    async fn config_resolution_prefers_db_row() {
        let store = Datastore::open_in_memory().unwrap();
        let scorer = ViabilityScorer::new(store.clone());

        // No DB row: defaults.
        let config = scorer.active_config().await.unwrap();
        assert_eq!(config.config_name, "default");

        let mut custom = default_config();
        custom.config_name = "tuned".into();
        custom.tier_1_min = 80;
        scorer.update_config(custom).await.unwrap();

        let config = scorer.active_config().await.unwrap();
        assert_eq!(config.config_name, "tuned");
        assert_eq!(config.tier_1_min, 80);
    }

    #[tokio::test]
    async fn invalid_update_is_rejected_and_not_persisted() {
        let store = Datastore::open_in_memory().unwrap();
        let scorer = ViabilityScorer::new(store.clone());

        let mut bad = default_config();
        bad.weight_subnet_age = dec!(0.5);
        assert!(scorer.update_config(bad).await.is_err());
        assert!(store.get_active_viability_config().await.unwrap().is_none());
    }
}
