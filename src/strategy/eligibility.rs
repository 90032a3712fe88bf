//! Eligibility gate: hard excludes for the investable universe.

use crate::db::SubnetRecord;
use crate::models::{Config, FlowRegime};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct EligibilityResult {
    pub netuid: i64,
    pub eligible: bool,
    pub reasons: Vec<String>,
}

pub struct EligibilityGate {
    config: Arc<Config>,
}

impl EligibilityGate {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Hard excludes only. Root (netuid 0) is always eligible; it is the
    /// base allocation, not a sleeve candidate.
    pub fn check(&self, subnet: &SubnetRecord) -> EligibilityResult {
        if subnet.netuid == 0 {
            return EligibilityResult {
                netuid: 0,
                eligible: true,
                reasons: Vec::new(),
            };
        }

        let mut reasons = Vec::new();
        let c = &self.config;

        if subnet.pool_alpha_reserve.is_zero() {
            reasons.push("alpha reserve empty, price undefined".to_string());
        }
        if subnet.pool_tao_reserve < c.min_liquidity_tao {
            reasons.push(format!(
                "liquidity {} below minimum {}",
                subnet.pool_tao_reserve, c.min_liquidity_tao
            ));
        }
        if subnet.holder_count < c.min_holder_count {
            reasons.push(format!(
                "holder count {} below minimum {}",
                subnet.holder_count, c.min_holder_count
            ));
        }
        if subnet.age_days < c.min_subnet_age_days {
            reasons.push(format!(
                "age {}d below minimum {}d",
                subnet.age_days, c.min_subnet_age_days
            ));
        }
        if subnet.owner_take > c.max_owner_take {
            reasons.push(format!(
                "owner take {} above maximum {}",
                subnet.owner_take, c.max_owner_take
            ));
        }
        if subnet.emission_share < c.min_emission_share {
            reasons.push(format!(
                "emission share {} below minimum {}",
                subnet.emission_share, c.min_emission_share
            ));
        }
        if matches!(
            subnet.flow_regime,
            FlowRegime::Quarantine | FlowRegime::Dead
        ) {
            reasons.push(format!("flow regime {}", subnet.flow_regime.as_str()));
        }
        if subnet.viability_tier.as_deref() == Some("unviable") {
            reasons.push("viability tier unviable".to_string());
        }

        EligibilityResult {
            netuid: subnet.netuid,
            eligible: reasons.is_empty(),
            reasons,
        }
    }

    /// Convenience predicate used by the rebalancer for adds.
    pub fn allows_new_exposure(&self, subnet: &SubnetRecord) -> bool {
        self.check(subnet).eligible && subnet.alpha_price_tao > Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn gate() -> EligibilityGate {
        std::env::set_var("TAOSTATS_API_KEY", "test-key");
        std::env::set_var("WALLET_ADDRESS", "5W");
        EligibilityGate::new(Arc::new(Config::from_env().unwrap()))
    }

    fn healthy_subnet(netuid: i64) -> SubnetRecord {
        SubnetRecord {
            netuid,
            name: format!("SN{netuid}"),
            owner_address: None,
            owner_take: dec!(0.15),
            fee_rate: dec!(0),
            incentive_burn: dec!(0),
            registered_at: None,
            age_days: 90,
            rank: None,
            market_cap_tao: dec!(0),
            emission_share: dec!(0.01),
            pool_tao_reserve: dec!(5000),
            pool_alpha_reserve: dec!(2500),
            alpha_price_tao: dec!(2),
            holder_count: 200,
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
        }
    }

    #[test]
    fn healthy_subnet_is_eligible() {
        let result = gate().check(&healthy_subnet(4));
        assert!(result.eligible, "reasons: {:?}", result.reasons);
    }

    #[test]
    fn each_hard_exclude_fires() {
        let gate = gate();

        let mut s = healthy_subnet(1);
        s.pool_tao_reserve = dec!(500);
        assert!(!gate.check(&s).eligible);

        let mut s = healthy_subnet(1);
        s.holder_count = 10;
        assert!(!gate.check(&s).eligible);

        let mut s = healthy_subnet(1);
        s.age_days = 5;
        assert!(!gate.check(&s).eligible);

        let mut s = healthy_subnet(1);
        s.owner_take = dec!(0.5);
        assert!(!gate.check(&s).eligible);

        let mut s = healthy_subnet(1);
        s.emission_share = dec!(0.0001);
        assert!(!gate.check(&s).eligible);

        let mut s = healthy_subnet(1);
        s.flow_regime = FlowRegime::Quarantine;
        assert!(!gate.check(&s).eligible);

        let mut s = healthy_subnet(1);
        s.viability_tier = Some("unviable".into());
        assert!(!gate.check(&s).eligible);
    }

    #[test]
    fn root_is_always_eligible() {
        let mut root = healthy_subnet(0);
        root.pool_tao_reserve = dec!(0);
        root.pool_alpha_reserve = dec!(0);
        root.holder_count = 0;
        assert!(gate().check(&root).eligible);
    }

    #[test]
    fn reasons_accumulate() {
        let mut s = healthy_subnet(2);
        s.holder_count = 1;
        s.age_days = 1;
        s.flow_regime = FlowRegime::Dead;
        let result = gate().check(&s);
        assert_eq!(result.reasons.len(), 3);
    }
}
