//! Advisory rebalance engine.
//!
//! Produces weekly and event-driven rebalance plans: per-position
//! actions from regime policy and sizing caps, filtered through
//! constraint checks (turnover, allocation bands) and stamped with the
//! trust gate state. Output is advisory only; nothing executes.

use super::eligibility::EligibilityGate;
use super::sizing::PositionSizer;
use crate::db::{
    Datastore, DecisionLogRecord, PositionRecord, SubnetRecord, TradeRecommendationRecord,
};
use crate::models::{Config, FlowRegime, RecommendedAction, SlippageAction};
use crate::regime::policy_for;
use crate::trust_gate::TrustReport;
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Weekly,
    RegimeChange,
    DrawdownBreach,
    EligibilityLoss,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Weekly => "weekly",
            TriggerType::RegimeChange => "regime_change",
            TriggerType::DrawdownBreach => "drawdown_breach",
            TriggerType::EligibilityLoss => "eligibility_loss",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConstraintViolation {
    pub constraint: &'static str,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub struct RebalancePlan {
    pub trigger: TriggerType,
    pub wallet_address: String,
    pub nav_exec_tao: Decimal,
    pub recommendations: Vec<TradeRecommendationRecord>,
    pub violations: Vec<ConstraintViolation>,
    pub gate_summary: String,
}

pub struct Rebalancer {
    config: Arc<Config>,
    store: Datastore,
    eligibility: EligibilityGate,
    sizer: PositionSizer,
}

impl Rebalancer {
    pub fn new(config: Arc<Config>, store: Datastore) -> Self {
        Self {
            eligibility: EligibilityGate::new(config.clone()),
            sizer: PositionSizer::new(config.clone()),
            config,
            store,
        }
    }

    /// Build and persist an advisory plan for one wallet.
    pub async fn build_plan(
        &self,
        wallet: &str,
        trigger: TriggerType,
        trust: &TrustReport,
    ) -> Result<RebalancePlan> {
        let now = Utc::now();
        let positions = self.store.list_active_positions(wallet).await?;
        let snapshot = self.store.latest_portfolio_snapshot(wallet).await?;
        let snapshot_ref = snapshot.as_ref().map(|s| format!("portfolio@{}", s.ts));
        let nav_exec: Decimal = positions.iter().map(|p| p.tao_value_exec_100pct).sum();
        let nav_for_caps = if nav_exec > Decimal::ZERO {
            nav_exec
        } else {
            positions.iter().map(|p| p.tao_value_mid).sum()
        };

        let mut recommendations = Vec::new();
        for position in &positions {
            let subnet = self.store.get_subnet(position.netuid).await?;
            if let Some(action) = self
                .position_action(position, subnet.as_ref(), nav_for_caps)
                .await?
            {
                let (confidence, gate_reason) = trust.gated_confidence("high");
                let mut reason = action.1;
                if let Some(gate_reason) = gate_reason {
                    reason = format!("{reason}; {gate_reason}");
                }
                recommendations.push(TradeRecommendationRecord {
                    id: Uuid::new_v4().to_string(),
                    ts: now,
                    wallet_address: wallet.to_string(),
                    netuid: position.netuid,
                    action: action.0,
                    size_tao: action.2,
                    reason,
                    confidence: confidence.to_string(),
                    gate_state: trust.state,
                    snapshot_ref: snapshot_ref.clone(),
                });
            }
        }

        let violations = self.check_constraints(&positions, &recommendations, nav_for_caps, &snapshot);

        for rec in &recommendations {
            self.store.insert_trade_recommendation(rec).await?;
            self.store
                .update_position_recommendation(wallet, rec.netuid, rec.action, &rec.reason)
                .await?;
        }
        self.store
            .insert_decision(&DecisionLogRecord {
                id: Uuid::new_v4().to_string(),
                ts: now,
                wallet_address: wallet.to_string(),
                trigger: trigger.as_str().to_string(),
                summary: format!(
                    "{} recommendation(s), {} constraint violation(s), gate {}",
                    recommendations.len(),
                    violations.len(),
                    trust.state.as_str()
                ),
                details: Some(serde_json::to_string(&violations)?),
                snapshot_ref,
            })
            .await?;

        info!(
            wallet,
            trigger = trigger.as_str(),
            recommendations = recommendations.len(),
            violations = violations.len(),
            "rebalance plan built"
        );
        Ok(RebalancePlan {
            trigger,
            wallet_address: wallet.to_string(),
            nav_exec_tao: nav_exec,
            recommendations,
            violations,
            gate_summary: trust.summary.clone(),
        })
    }

    /// Action for one position from regime policy, eligibility and caps.
    async fn position_action(
        &self,
        position: &PositionRecord,
        subnet: Option<&SubnetRecord>,
        nav: Decimal,
    ) -> Result<Option<(RecommendedAction, String, Decimal)>> {
        // Root is the base allocation; the rebalancer never trades it
        // directly.
        if position.netuid == 0 {
            return Ok(None);
        }
        let Some(subnet) = subnet else {
            return Ok(Some((
                RecommendedAction::Exit,
                "subnet no longer tracked".to_string(),
                position.tao_value_mid,
            )));
        };

        let policy = policy_for(subnet.flow_regime);
        if policy.mandatory_exit {
            return Ok(Some((
                RecommendedAction::Exit,
                format!("regime {}: {}", subnet.flow_regime.as_str(), policy.description),
                position.tao_value_mid,
            )));
        }
        if let Some(trim_pct) = policy.trim_pct {
            return Ok(Some((
                RecommendedAction::Trim,
                format!("regime {}: {}", subnet.flow_regime.as_str(), policy.description),
                position.tao_value_mid * trim_pct,
            )));
        }

        let surfaces = self
            .store
            .list_slippage_surfaces(position.netuid, SlippageAction::Unstake)
            .await?;
        let limit = self.sizer.position_limit(position.netuid, nav, &surfaces);

        // Oversized positions trim back to the cap regardless of regime.
        if nav > Decimal::ZERO && position.tao_value_mid > limit.max_tao {
            return Ok(Some((
                RecommendedAction::Trim,
                format!(
                    "position {} above cap {} ({})",
                    position.tao_value_mid, limit.max_tao, limit.cap_source
                ),
                position.tao_value_mid - limit.max_tao,
            )));
        }

        let eligibility = self.eligibility.check(subnet);
        if !eligibility.eligible {
            return Ok(Some((
                RecommendedAction::Exit,
                format!("eligibility lost: {}", eligibility.reasons.join("; ")),
                position.tao_value_mid,
            )));
        }

        if policy.adds_allowed
            && subnet.flow_regime == FlowRegime::RiskOn
            && position.tao_value_mid < limit.target_tao
        {
            let add = limit.target_tao - position.tao_value_mid;
            return Ok(Some((
                RecommendedAction::Add,
                format!(
                    "risk_on and below target {} (cap {})",
                    limit.target_tao, limit.max_tao
                ),
                add,
            )));
        }

        Ok(None)
    }

    fn check_constraints(
        &self,
        positions: &[PositionRecord],
        recommendations: &[TradeRecommendationRecord],
        nav: Decimal,
        snapshot: &Option<crate::db::PortfolioSnapshotRecord>,
    ) -> Vec<ConstraintViolation> {
        let mut violations = Vec::new();
        if nav <= Decimal::ZERO {
            return violations;
        }

        let planned_turnover: Decimal = recommendations.iter().map(|r| r.size_tao).sum();
        let turnover_ratio = planned_turnover / nav;
        if turnover_ratio > self.config.max_daily_turnover {
            violations.push(ConstraintViolation {
                constraint: "daily_turnover",
                detail: format!(
                    "planned turnover {} exceeds cap {} of NAV",
                    turnover_ratio.round_dp(4),
                    self.config.max_daily_turnover
                ),
            });
        }
        if let Some(snapshot) = snapshot {
            let weekly = snapshot.weekly_turnover + turnover_ratio;
            if weekly > self.config.max_weekly_turnover {
                violations.push(ConstraintViolation {
                    constraint: "weekly_turnover",
                    detail: format!(
                        "weekly turnover {} exceeds cap {}",
                        weekly.round_dp(4),
                        self.config.max_weekly_turnover
                    ),
                });
            }
        }

        let root_value: Decimal = positions
            .iter()
            .filter(|p| p.netuid == 0)
            .map(|p| p.tao_value_mid)
            .sum();
        let root_share = root_value / nav;
        if root_share < self.config.root_allocation_min {
            violations.push(ConstraintViolation {
                constraint: "root_allocation",
                detail: format!(
                    "root share {} below band [{}, {}]",
                    root_share.round_dp(4),
                    self.config.root_allocation_min,
                    self.config.root_allocation_max
                ),
            });
        } else if root_share > self.config.root_allocation_max {
            violations.push(ConstraintViolation {
                constraint: "root_allocation",
                detail: format!(
                    "root share {} above band [{}, {}]",
                    root_share.round_dp(4),
                    self.config.root_allocation_min,
                    self.config.root_allocation_max
                ),
            });
        }

        let sleeve_count = positions.iter().filter(|p| p.netuid != 0).count();
        let (min_positions, max_positions) = self.sizer.position_count_bounds();
        if sleeve_count > max_positions {
            violations.push(ConstraintViolation {
                constraint: "position_count",
                detail: format!("{sleeve_count} sleeve positions above maximum {max_positions}"),
            });
        } else if sleeve_count > 0 && sleeve_count < min_positions {
            violations.push(ConstraintViolation {
                constraint: "position_count",
                detail: format!("{sleeve_count} sleeve positions below minimum {min_positions}"),
            });
        }

        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GateState;
    use crate::trust_gate::evaluate_inputs;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn test_env() -> (Arc<Config>, Datastore) {
        std::env::set_var("TAOSTATS_API_KEY", "test-key");
        std::env::set_var("WALLET_ADDRESS", "5W");
        (
            Arc::new(Config::from_env().unwrap()),
            Datastore::open_in_memory().unwrap(),
        )
    }

    fn ok_trust() -> TrustReport {
        let now = Utc::now();
        evaluate_inputs(now, Some(now), 30, Some((now, true, 0)), &HashMap::new())
    }

    fn blocked_trust() -> TrustReport {
        evaluate_inputs(Utc::now(), None, 30, None, &HashMap::new())
    }

    async fn seed_subnet(store: &Datastore, netuid: i64, regime: FlowRegime) {
        let mut s = SubnetRecord {
            netuid,
            name: format!("SN{netuid}"),
            owner_address: None,
            owner_take: dec!(0.1),
            fee_rate: dec!(0),
            incentive_burn: dec!(0),
            registered_at: None,
            age_days: 120,
            rank: None,
            market_cap_tao: dec!(0),
            emission_share: dec!(0.01),
            pool_tao_reserve: dec!(8000),
            pool_alpha_reserve: dec!(4000),
            alpha_price_tao: dec!(2),
            holder_count: 300,
            taoflow_1d: dec!(0),
            taoflow_3d: dec!(0),
            taoflow_7d: dec!(0),
            taoflow_14d: dec!(0),
            flow_regime: FlowRegime::Neutral,
            flow_regime_since: None,
            regime_candidate: None,
            regime_candidate_days: 0,
            viability_score: Some(dec!(60)),
            viability_tier: Some("tier_2".into()),
        };
        s.flow_regime = regime;
        store.upsert_subnet_market_state(&s).await.unwrap();
        store
            .update_subnet_regime(netuid, regime, None, None, 0)
            .await
            .unwrap();
    }

    async fn seed_positions(store: &Datastore, values: &[(i64, Decimal)]) {
        let fresh: Vec<PositionRecord> = values
            .iter()
            .map(|(netuid, value)| {
                let mut p = PositionRecord::new("5W", *netuid);
                p.alpha_balance = *value / dec!(2);
                p.tao_value_mid = *value;
                p
            })
            .collect();
        store.apply_position_balances("5W", &fresh).await.unwrap();
        for (netuid, value) in values {
            store
                .update_position_exec_values("5W", *netuid, *value, *value, dec!(0), dec!(0))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn dead_position_gets_exit_recommendation() {
        let (config, store) = test_env();
        seed_subnet(&store, 7, FlowRegime::Dead).await;
        seed_positions(&store, &[(7, dec!(100))]).await;

        let plan = Rebalancer::new(config, store)
            .build_plan("5W", TriggerType::RegimeChange, &ok_trust())
            .await
            .unwrap();

        let rec = plan
            .recommendations
            .iter()
            .find(|r| r.netuid == 7)
            .unwrap();
        assert_eq!(rec.action, RecommendedAction::Exit);
        assert_eq!(rec.size_tao, dec!(100));
        assert_eq!(rec.confidence, "high");
    }

    #[tokio::test]
    async fn quarantine_position_gets_trim() {
        let (config, store) = test_env();
        seed_subnet(&store, 9, FlowRegime::Quarantine).await;
        seed_positions(&store, &[(9, dec!(100))]).await;

        let plan = Rebalancer::new(config, store)
            .build_plan("5W", TriggerType::Weekly, &ok_trust())
            .await
            .unwrap();

        let rec = plan.recommendations.iter().find(|r| r.netuid == 9).unwrap();
        assert_eq!(rec.action, RecommendedAction::Trim);
        assert_eq!(rec.size_tao, dec!(25.00));
    }

    #[tokio::test]
    async fn blocked_gate_collapses_recommendation_confidence() {
        let (config, store) = test_env();
        seed_subnet(&store, 7, FlowRegime::Dead).await;
        seed_positions(&store, &[(7, dec!(100))]).await;

        let plan = Rebalancer::new(config, store.clone())
            .build_plan("5W", TriggerType::Weekly, &blocked_trust())
            .await
            .unwrap();

        let rec = &plan.recommendations[0];
        assert_eq!(rec.confidence, "low");
        assert_eq!(rec.gate_state, GateState::Blocked);
        assert!(rec.reason.contains("trust gate blocked"));

        // Persisted for audit.
        let stored = store.list_trade_recommendations("5W", 10).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn oversized_position_trims_to_cap() {
        let (config, store) = test_env();
        seed_subnet(&store, 3, FlowRegime::Neutral).await;
        // 400 of a 1000 NAV portfolio: cap is 15%.
        seed_positions(&store, &[(0, dec!(600)), (3, dec!(400))]).await;

        let plan = Rebalancer::new(config, store)
            .build_plan("5W", TriggerType::Weekly, &ok_trust())
            .await
            .unwrap();

        let rec = plan.recommendations.iter().find(|r| r.netuid == 3).unwrap();
        assert_eq!(rec.action, RecommendedAction::Trim);
        // Trim down to 150 (15% of 1000).
        assert_eq!(rec.size_tao, dec!(250.00));
    }

    #[tokio::test]
    async fn turnover_and_allocation_violations_are_reported() {
        let (config, store) = test_env();
        seed_subnet(&store, 7, FlowRegime::Dead).await;
        // Whole portfolio in one dead subnet: exit breaches the daily
        // turnover cap and the root band sits at zero.
        seed_positions(&store, &[(7, dec!(1000))]).await;

        let plan = Rebalancer::new(config, store)
            .build_plan("5W", TriggerType::RegimeChange, &ok_trust())
            .await
            .unwrap();

        assert!(plan
            .violations
            .iter()
            .any(|v| v.constraint == "daily_turnover"));
        assert!(plan
            .violations
            .iter()
            .any(|v| v.constraint == "root_allocation"));
    }
}
