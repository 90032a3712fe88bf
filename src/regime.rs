//! Flow regime state machine.
//!
//! Classifies each subnet's capital-flow dynamics into
//! risk_on / neutral / risk_off / quarantine / dead from multi-horizon
//! flows, then filters transitions through an anti-whipsaw persistence
//! counter: a change commits only after the same candidate has been
//! proposed on N consecutive passes (N depends on the target regime).

use crate::db::{Datastore, SubnetRecord};
use crate::models::{Config, FlowRegime};
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Trading policy carried by each regime, consumed by the rebalancer.
#[derive(Debug, Clone, Serialize)]
pub struct RegimePolicy {
    pub new_buys_allowed: bool,
    pub adds_allowed: bool,
    pub sleeve_can_expand: bool,
    pub trim_pct: Option<Decimal>,
    pub mandatory_exit: bool,
    pub description: &'static str,
}

pub fn policy_for(regime: FlowRegime) -> RegimePolicy {
    match regime {
        FlowRegime::RiskOn => RegimePolicy {
            new_buys_allowed: true,
            adds_allowed: true,
            sleeve_can_expand: true,
            trim_pct: None,
            mandatory_exit: false,
            description: "New buys allowed if eligibility passes; sleeve can expand to upper bound.",
        },
        FlowRegime::Neutral => RegimePolicy {
            new_buys_allowed: true,
            adds_allowed: true,
            sleeve_can_expand: false,
            trim_pct: None,
            mandatory_exit: false,
            description: "Higher bar for new buys; prefer adds to existing winners.",
        },
        FlowRegime::RiskOff => RegimePolicy {
            new_buys_allowed: false,
            adds_allowed: false,
            sleeve_can_expand: false,
            trim_pct: None,
            mandatory_exit: false,
            description: "No new buys; sleeve shrinks toward lower bound; prefer Root.",
        },
        FlowRegime::Quarantine => RegimePolicy {
            new_buys_allowed: false,
            adds_allowed: false,
            sleeve_can_expand: false,
            trim_pct: Some(dec!(0.25)),
            mandatory_exit: false,
            description: "No adds; trim 25-50% and monitor 48-72h.",
        },
        FlowRegime::Dead => RegimePolicy {
            new_buys_allowed: false,
            adds_allowed: false,
            sleeve_can_expand: false,
            trim_pct: None,
            mandatory_exit: true,
            description: "Mandatory exit ladder, accelerated even if it crystallizes a loss.",
        },
    }
}

/// Outcome of one persistence-filtered pass for a subnet.
#[derive(Debug, Clone)]
pub struct PersistenceOutcome {
    pub regime: FlowRegime,
    pub candidate: Option<FlowRegime>,
    pub candidate_days: u32,
    pub transitioned: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegimeChange {
    pub netuid: i64,
    pub from: FlowRegime,
    pub to: FlowRegime,
    pub reason: String,
}

#[derive(Debug, Default, Serialize)]
pub struct RegimeUpdateSummary {
    pub subnets_updated: usize,
    pub changes: Vec<RegimeChange>,
    pub counts: HashMap<String, usize>,
}

pub struct RegimeEngine {
    config: Arc<Config>,
    store: Datastore,
}

impl RegimeEngine {
    pub fn new(config: Arc<Config>, store: Datastore) -> Self {
        Self { config, store }
    }

    /// Candidate regime from multi-horizon flows and, when available,
    /// the most recent daily flow values (newest first).
    pub fn classify_candidate(
        &self,
        subnet: &SubnetRecord,
        daily_flows: Option<&[Decimal]>,
    ) -> (FlowRegime, String) {
        let q = self.config.quarantine_flow_threshold;
        let r = self.config.risk_off_flow_threshold;
        let f_1d = subnet.taoflow_1d;
        let f_3d = subnet.taoflow_3d;
        let f_7d = subnet.taoflow_7d;
        let f_14d = subnet.taoflow_14d;

        if f_7d < q && f_14d < q {
            return (
                FlowRegime::Dead,
                format!("severe sustained outflow: 7d={f_7d}, 14d={f_14d}"),
            );
        }
        if f_7d < r && f_14d < r {
            return (
                FlowRegime::Quarantine,
                format!("sustained negative flow: 7d={f_7d}, 14d={f_14d}"),
            );
        }
        if let Some(history) = daily_flows {
            if history.len() >= 4 {
                let negative_days = history[..4].iter().filter(|f| **f < Decimal::ZERO).count();
                if negative_days >= 3 && f_7d < Decimal::ZERO {
                    return (
                        FlowRegime::Quarantine,
                        format!("{negative_days} of last 4 days negative with 7d={f_7d}"),
                    );
                }
            }
        }
        if f_7d < r || (f_3d < Decimal::ZERO && f_7d < Decimal::ZERO) {
            return (
                FlowRegime::RiskOff,
                format!("negative flow trend: 3d={f_3d}, 7d={f_7d}"),
            );
        }
        if f_7d > r.abs() && f_14d > Decimal::ZERO {
            return (
                FlowRegime::RiskOn,
                format!("positive flow momentum: 7d={f_7d}, 14d={f_14d}"),
            );
        }
        (
            FlowRegime::Neutral,
            format!("mixed or flat flow: 1d={f_1d}, 7d={f_7d}"),
        )
    }

    /// Filter a candidate through the anti-whipsaw persistence counter.
    pub fn apply_persistence(
        &self,
        current: FlowRegime,
        stored_candidate: Option<FlowRegime>,
        stored_days: u32,
        candidate: FlowRegime,
        reason: String,
    ) -> PersistenceOutcome {
        if !self.config.enable_regime_persistence {
            return PersistenceOutcome {
                regime: candidate,
                candidate: None,
                candidate_days: 0,
                transitioned: candidate != current,
                reason,
            };
        }

        if candidate == current {
            return PersistenceOutcome {
                regime: current,
                candidate: None,
                candidate_days: 0,
                transitioned: false,
                reason,
            };
        }

        let required = self.config.persistence_requirement(candidate);
        let days = if stored_candidate == Some(candidate) {
            stored_days + 1
        } else {
            1
        };

        if days >= required {
            PersistenceOutcome {
                regime: candidate,
                candidate: None,
                candidate_days: 0,
                transitioned: true,
                reason: format!("{reason} (persistence {days}/{required} met)"),
            }
        } else {
            PersistenceOutcome {
                regime: current,
                candidate: Some(candidate),
                candidate_days: days,
                transitioned: false,
                reason: format!("{reason} (persistence {days}/{required})"),
            }
        }
    }

    /// One regime pass over every subnet with pool liquidity.
    pub async fn update_all_regimes(&self) -> Result<RegimeUpdateSummary> {
        let subnets = self.store.list_subnets_with_liquidity().await?;
        let mut summary = RegimeUpdateSummary::default();
        let now = Utc::now();

        for subnet in subnets {
            let daily = self.store.recent_daily_flows(subnet.netuid, 4).await?;
            let history = if daily.is_empty() {
                None
            } else {
                Some(daily.as_slice())
            };
            let (candidate, reason) = self.classify_candidate(&subnet, history);
            let outcome = self.apply_persistence(
                subnet.flow_regime,
                subnet.regime_candidate,
                subnet.regime_candidate_days,
                candidate,
                reason,
            );

            let regime_since = if outcome.transitioned {
                Some(now)
            } else {
                subnet.flow_regime_since
            };
            self.store
                .update_subnet_regime(
                    subnet.netuid,
                    outcome.regime,
                    regime_since,
                    outcome.candidate,
                    outcome.candidate_days,
                )
                .await?;

            if outcome.transitioned {
                info!(
                    netuid = subnet.netuid,
                    from = subnet.flow_regime.as_str(),
                    to = outcome.regime.as_str(),
                    reason = %outcome.reason,
                    "regime transition"
                );
                summary.changes.push(RegimeChange {
                    netuid: subnet.netuid,
                    from: subnet.flow_regime,
                    to: outcome.regime,
                    reason: outcome.reason.clone(),
                });
            } else {
                debug!(
                    netuid = subnet.netuid,
                    regime = outcome.regime.as_str(),
                    candidate = ?outcome.candidate.map(|c| c.as_str()),
                    "regime unchanged"
                );
            }

            *summary
                .counts
                .entry(outcome.regime.as_str().to_string())
                .or_insert(0) += 1;
            summary.subnets_updated += 1;
        }

        Ok(summary)
    }

    /// Portfolio rollup weighted by position TAO value. Any dead or
    /// quarantine exposure forces risk_off with a reason.
    pub async fn portfolio_regime(&self, wallet: &str) -> Result<(FlowRegime, String)> {
        let positions = self.store.list_active_positions(wallet).await?;
        if positions.is_empty() {
            return Ok((FlowRegime::Neutral, "no active positions".into()));
        }

        let mut value_by_regime: HashMap<FlowRegime, Decimal> = HashMap::new();
        let mut count_by_regime: HashMap<FlowRegime, usize> = HashMap::new();
        let mut total_value = Decimal::ZERO;

        for position in &positions {
            let regime = match self.store.get_subnet(position.netuid).await? {
                Some(subnet) => subnet.flow_regime,
                None => FlowRegime::Neutral,
            };
            *value_by_regime.entry(regime).or_insert(Decimal::ZERO) += position.tao_value_mid;
            *count_by_regime.entry(regime).or_insert(0) += 1;
            total_value += position.tao_value_mid;
        }

        if total_value.is_zero() {
            return Ok((FlowRegime::Neutral, "no position value".into()));
        }

        for fatal in [FlowRegime::Dead, FlowRegime::Quarantine] {
            if let Some(count) = count_by_regime.get(&fatal) {
                let pct = value_by_regime[&fatal] / total_value * dec!(100);
                return Ok((
                    FlowRegime::RiskOff,
                    format!(
                        "{count} position(s) in {} ({pct:.1}% of value)",
                        fatal.as_str()
                    ),
                ));
            }
        }

        let risk_off_share = value_by_regime
            .get(&FlowRegime::RiskOff)
            .copied()
            .unwrap_or(Decimal::ZERO)
            / total_value;
        let risk_on_share = value_by_regime
            .get(&FlowRegime::RiskOn)
            .copied()
            .unwrap_or(Decimal::ZERO)
            / total_value;

        if risk_off_share > dec!(0.40) {
            Ok((
                FlowRegime::RiskOff,
                format!("risk-off positions dominate ({risk_off_share:.2} of value)"),
            ))
        } else if risk_on_share > dec!(0.50) {
            Ok((
                FlowRegime::RiskOn,
                format!("risk-on positions dominate ({risk_on_share:.2} of value)"),
            ))
        } else {
            Ok((FlowRegime::Neutral, "mixed regime across positions".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PositionRecord;

    fn engine_with(persistence: bool) -> RegimeEngine {
        std::env::set_var("TAOSTATS_API_KEY", "test-key");
        std::env::set_var("WALLET_ADDRESS", "5W");
        let mut config = Config::from_env().unwrap();
        config.enable_regime_persistence = persistence;
        RegimeEngine::new(Arc::new(config), Datastore::open_in_memory().unwrap())
    }

    fn subnet_with_flows(
        f_3d: Decimal,
        f_7d: Decimal,
        f_14d: Decimal,
    ) -> SubnetRecord {
        let mut s = crate::db::SubnetRecord {
            netuid: 1,
            name: "SN1".into(),
            owner_address: None,
            owner_take: Decimal::ZERO,
            fee_rate: Decimal::ZERO,
            incentive_burn: Decimal::ZERO,
            registered_at: None,
            age_days: 100,
            rank: None,
            market_cap_tao: Decimal::ZERO,
            emission_share: Decimal::ZERO,
            pool_tao_reserve: dec!(1000),
            pool_alpha_reserve: dec!(500),
            alpha_price_tao: dec!(2),
            holder_count: 100,
            taoflow_1d: Decimal::ZERO,
            taoflow_3d: f_3d,
            taoflow_7d: f_7d,
            taoflow_14d: f_14d,
            flow_regime: FlowRegime::Neutral,
            flow_regime_since: None,
            regime_candidate: None,
            regime_candidate_days: 0,
            viability_score: None,
            viability_tier: None,
        };
        s.taoflow_1d = f_3d;
        s
    }

    #[test]
    fn classification_ladder() {
        let engine = engine_with(true);

        // Both deep horizons below quarantine threshold: dead.
        let (r, _) = engine.classify_candidate(&subnet_with_flows(dec!(0), dec!(-0.2), dec!(-0.18)), None);
        assert_eq!(r, FlowRegime::Dead);

        // Both below risk-off threshold: quarantine.
        let (r, _) = engine.classify_candidate(&subnet_with_flows(dec!(0), dec!(-0.08), dec!(-0.06)), None);
        assert_eq!(r, FlowRegime::Quarantine);

        // 3 of 4 recent days negative with 7d negative: quarantine.
        let daily = [dec!(-1), dec!(-2), dec!(1), dec!(-3)];
        let (r, _) = engine.classify_candidate(
            &subnet_with_flows(dec!(0.01), dec!(-0.01), dec!(0.02)),
            Some(&daily),
        );
        assert_eq!(r, FlowRegime::Quarantine);

        // Moderate negative: risk_off.
        let (r, _) = engine.classify_candidate(&subnet_with_flows(dec!(-0.01), dec!(-0.02), dec!(0.01)), None);
        assert_eq!(r, FlowRegime::RiskOff);

        // Strong positive with positive 14d: risk_on.
        let (r, _) = engine.classify_candidate(&subnet_with_flows(dec!(0.02), dec!(0.08), dec!(0.03)), None);
        assert_eq!(r, FlowRegime::RiskOn);

        // Flat: neutral.
        let (r, _) = engine.classify_candidate(&subnet_with_flows(dec!(0.001), dec!(0.002), dec!(0.001)), None);
        assert_eq!(r, FlowRegime::Neutral);
    }

    #[test]
    fn whipsaw_sequence_never_transitions() {
        // Persistence risk_off = risk_on = 2. Three alternating candidate
        // days produce zero transitions.
        let engine = engine_with(true);
        let mut current = FlowRegime::Neutral;
        let mut candidate = None;
        let mut days = 0;

        for target in [FlowRegime::RiskOff, FlowRegime::RiskOn, FlowRegime::RiskOff] {
            let outcome =
                engine.apply_persistence(current, candidate, days, target, "flip".into());
            assert!(!outcome.transitioned);
            assert_eq!(outcome.regime, FlowRegime::Neutral);
            assert_eq!(outcome.candidate, Some(target));
            assert_eq!(outcome.candidate_days, 1);
            current = outcome.regime;
            candidate = outcome.candidate;
            days = outcome.candidate_days;
        }
    }

    #[test]
    fn consistent_candidate_commits_at_requirement() {
        let engine = engine_with(true);

        let day1 = engine.apply_persistence(
            FlowRegime::Neutral,
            None,
            0,
            FlowRegime::RiskOff,
            "neg flow".into(),
        );
        assert!(!day1.transitioned);
        assert_eq!(day1.candidate_days, 1);

        let day2 = engine.apply_persistence(
            FlowRegime::Neutral,
            day1.candidate,
            day1.candidate_days,
            FlowRegime::RiskOff,
            "neg flow".into(),
        );
        assert!(day2.transitioned);
        assert_eq!(day2.regime, FlowRegime::RiskOff);
        assert_eq!(day2.candidate, None);
        assert_eq!(day2.candidate_days, 0);
    }

    #[test]
    fn quarantine_needs_three_passes() {
        let engine = engine_with(true);
        let outcome = engine.apply_persistence(
            FlowRegime::RiskOff,
            Some(FlowRegime::Quarantine),
            1,
            FlowRegime::Quarantine,
            "outflow".into(),
        );
        assert!(!outcome.transitioned);
        assert_eq!(outcome.candidate_days, 2);

        let outcome = engine.apply_persistence(
            FlowRegime::RiskOff,
            Some(FlowRegime::Quarantine),
            2,
            FlowRegime::Quarantine,
            "outflow".into(),
        );
        assert!(outcome.transitioned);
    }

    #[test]
    fn matching_candidate_clears_counter() {
        let engine = engine_with(true);
        let outcome = engine.apply_persistence(
            FlowRegime::RiskOff,
            Some(FlowRegime::Quarantine),
            2,
            FlowRegime::RiskOff,
            "recovered".into(),
        );
        assert!(!outcome.transitioned);
        assert_eq!(outcome.regime, FlowRegime::RiskOff);
        assert_eq!(outcome.candidate, None);
        assert_eq!(outcome.candidate_days, 0);
    }

    #[test]
    fn disabled_persistence_commits_immediately() {
        let engine = engine_with(false);
        let outcome = engine.apply_persistence(
            FlowRegime::Neutral,
            None,
            0,
            FlowRegime::Dead,
            "cliff".into(),
        );
        assert!(outcome.transitioned);
        assert_eq!(outcome.regime, FlowRegime::Dead);
    }

    #[tokio::test]
    async fn dead_exposure_forces_portfolio_risk_off() {
        let engine = engine_with(true);
        let store = engine.store.clone();

        let mut subnet = subnet_with_flows(dec!(0), dec!(0), dec!(0));
        subnet.netuid = 5;
        store.upsert_subnet_market_state(&subnet).await.unwrap();
        store
            .update_subnet_regime(5, FlowRegime::Dead, None, None, 0)
            .await
            .unwrap();

        let mut pos = PositionRecord::new("5W", 5);
        pos.alpha_balance = dec!(10);
        pos.tao_value_mid = dec!(100);
        store.apply_position_balances("5W", &[pos]).await.unwrap();

        let (regime, reason) = engine.portfolio_regime("5W").await.unwrap();
        assert_eq!(regime, FlowRegime::RiskOff);
        assert!(reason.contains("dead"));
    }

    #[test]
    fn policies_match_regime_severity() {
        assert!(policy_for(FlowRegime::RiskOn).new_buys_allowed);
        assert!(!policy_for(FlowRegime::RiskOff).new_buys_allowed);
        assert!(policy_for(FlowRegime::Quarantine).trim_pct.is_some());
        assert!(policy_for(FlowRegime::Dead).mandatory_exit);
    }
}
