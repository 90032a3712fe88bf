//! Strategy core: eligibility, sizing and advisory rebalancing.
//!
//! All outputs are advisory; nothing here signs or submits anything.

pub mod eligibility;
pub mod rebalancer;
pub mod sizing;

pub use eligibility::{EligibilityGate, EligibilityResult};
pub use rebalancer::{RebalancePlan, Rebalancer, TriggerType};
pub use sizing::{PositionLimit, PositionSizer};
