//! Shared domain types and application configuration.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// Stake transaction types recognized by the accounting engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Stake,
    Unstake,
    UnstakeAll,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Stake => "stake",
            TxType::Unstake => "unstake",
            TxType::UnstakeAll => "unstake_all",
        }
    }

    pub fn is_unstake(&self) -> bool {
        matches!(self, TxType::Unstake | TxType::UnstakeAll)
    }
}

impl FromStr for TxType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stake" => Ok(TxType::Stake),
            "unstake" => Ok(TxType::Unstake),
            "unstake_all" => Ok(TxType::UnstakeAll),
            other => Err(format!("unknown tx type: {other}")),
        }
    }
}

/// Flow regime states for a subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowRegime {
    RiskOn,
    Neutral,
    RiskOff,
    Quarantine,
    Dead,
}

impl FlowRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowRegime::RiskOn => "risk_on",
            FlowRegime::Neutral => "neutral",
            FlowRegime::RiskOff => "risk_off",
            FlowRegime::Quarantine => "quarantine",
            FlowRegime::Dead => "dead",
        }
    }

    pub const ALL: [FlowRegime; 5] = [
        FlowRegime::RiskOn,
        FlowRegime::Neutral,
        FlowRegime::RiskOff,
        FlowRegime::Quarantine,
        FlowRegime::Dead,
    ];
}

impl FromStr for FlowRegime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "risk_on" => Ok(FlowRegime::RiskOn),
            "neutral" => Ok(FlowRegime::Neutral),
            "risk_off" => Ok(FlowRegime::RiskOff),
            "quarantine" => Ok(FlowRegime::Quarantine),
            "dead" => Ok(FlowRegime::Dead),
            other => Err(format!("unknown flow regime: {other}")),
        }
    }
}

/// Slippage quote direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlippageAction {
    Stake,
    Unstake,
}

impl SlippageAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlippageAction::Stake => "stake",
            SlippageAction::Unstake => "unstake",
        }
    }
}

impl FromStr for SlippageAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stake" => Ok(SlippageAction::Stake),
            "unstake" => Ok(SlippageAction::Unstake),
            other => Err(format!("unknown slippage action: {other}")),
        }
    }
}

/// Sync tiers driven by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTier {
    Refresh,
    Full,
    Deep,
}

impl SyncTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTier::Refresh => "refresh",
            SyncTier::Full => "full",
            SyncTier::Deep => "deep",
        }
    }
}

/// Trust gate state consumed by advisory surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Ok,
    Degraded,
    Blocked,
}

impl GateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::Ok => "ok",
            GateState::Degraded => "degraded",
            GateState::Blocked => "blocked",
        }
    }
}

/// Viability tiers assigned by the scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViabilityTier {
    Tier1,
    Tier2,
    Tier3,
    Unviable,
}

impl ViabilityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViabilityTier::Tier1 => "tier_1",
            ViabilityTier::Tier2 => "tier_2",
            ViabilityTier::Tier3 => "tier_3",
            ViabilityTier::Unviable => "unviable",
        }
    }
}

/// Advisory action attached to a position by the strategy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Hold,
    Add,
    Trim,
    Exit,
}

impl RecommendedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendedAction::Hold => "hold",
            RecommendedAction::Add => "add",
            RecommendedAction::Trim => "trim",
            RecommendedAction::Exit => "exit",
        }
    }
}

/// A point-in-time health summary for the process.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub database: String,
    pub cache: String,
    pub upstream_api: String,
    pub last_sync: Option<DateTime<Utc>>,
    pub data_stale: bool,
}

fn env_str(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_decimal(var: &str, default: Decimal) -> Decimal {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<Decimal>().ok())
        .unwrap_or(default)
}

fn env_flag(var: &str, default: bool) -> bool {
    env::var(var)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

/// Application configuration.
///
/// Loaded once from the environment; the API key never appears in logs.
/// Missing required settings abort startup with exit code 2.
#[derive(Debug, Clone)]
pub struct Config {
    // Upstream API
    pub taostats_api_key: String,
    pub taostats_base_url: String,
    pub taostats_rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_cap_secs: u64,
    pub max_pages: u32,

    // Wallet and stores
    pub wallet_address: String,
    pub database_path: String,
    pub redis_url: String,

    // Scheduler
    pub wallet_refresh_minutes: u64,
    pub full_sync_minutes: u64,
    pub deep_sync_hours: u64,
    pub stale_data_threshold_minutes: i64,
    pub min_valid_sync_records: usize,

    // Reconciliation tolerances
    pub reconciliation_absolute_tolerance_tao: Decimal,
    pub reconciliation_relative_tolerance_pct: Decimal,

    // Flow regime thresholds
    pub risk_off_flow_threshold: Decimal,
    pub quarantine_flow_threshold: Decimal,
    pub enable_regime_persistence: bool,
    pub persistence_days_risk_on: u32,
    pub persistence_days_risk_off: u32,
    pub persistence_days_quarantine: u32,
    pub persistence_days_dead: u32,

    // Risk limits
    pub soft_drawdown_limit: Decimal,
    pub hard_drawdown_limit: Decimal,
    pub max_exit_slippage_50pct: Decimal,
    pub max_exit_slippage_100pct: Decimal,

    // Position constraints
    pub max_position_concentration: Decimal,
    pub default_position_concentration: Decimal,
    pub min_positions: usize,
    pub max_positions: usize,

    // Portfolio allocation bands
    pub root_allocation_min: Decimal,
    pub root_allocation_max: Decimal,
    pub sleeve_allocation_min: Decimal,
    pub sleeve_allocation_max: Decimal,
    pub buffer_allocation_min: Decimal,
    pub buffer_allocation_max: Decimal,

    // Turnover caps
    pub max_daily_turnover: Decimal,
    pub max_weekly_turnover: Decimal,

    // Universe filters
    pub min_liquidity_tao: Decimal,
    pub min_holder_count: i64,
    pub min_subnet_age_days: i64,
    pub max_owner_take: Decimal,
    pub min_emission_share: Decimal,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let taostats_api_key = env::var("TAOSTATS_API_KEY")
            .map_err(|_| anyhow::anyhow!("TAOSTATS_API_KEY is required"))?;
        let wallet_address = env::var("WALLET_ADDRESS")
            .map_err(|_| anyhow::anyhow!("WALLET_ADDRESS is required"))?;

        Ok(Self {
            taostats_api_key,
            taostats_base_url: env_str("TAOSTATS_BASE_URL", "https://api.taostats.io"),
            taostats_rate_limit_per_minute: env_parse("TAOSTATS_RATE_LIMIT_PER_MINUTE", 60),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS", 30),
            max_retries: env_parse("MAX_RETRIES", 3),
            retry_base_ms: env_parse("RETRY_BASE_MS", 500),
            retry_cap_secs: env_parse("RETRY_CAP_SECS", 60),
            max_pages: env_parse("MAX_PAGES", 50),

            wallet_address,
            database_path: env_str("DATABASE_PATH", "./tao_treasury.db"),
            redis_url: env_str("REDIS_URL", "redis://localhost:6379/0"),

            wallet_refresh_minutes: env_parse("WALLET_REFRESH_MINUTES", 5),
            full_sync_minutes: env_parse("FULL_SYNC_MINUTES", 60),
            deep_sync_hours: env_parse("DEEP_SYNC_HOURS", 24),
            stale_data_threshold_minutes: env_parse("STALE_DATA_THRESHOLD_MINUTES", 30),
            min_valid_sync_records: env_parse("MIN_VALID_SYNC_RECORDS", 1),

            reconciliation_absolute_tolerance_tao: env_decimal(
                "RECON_ABSOLUTE_TOLERANCE_TAO",
                dec!(0.0001),
            ),
            reconciliation_relative_tolerance_pct: env_decimal(
                "RECON_RELATIVE_TOLERANCE_PCT",
                dec!(0.1),
            ),

            risk_off_flow_threshold: env_decimal("RISK_OFF_FLOW_THRESHOLD", dec!(-0.05)),
            quarantine_flow_threshold: env_decimal("QUARANTINE_FLOW_THRESHOLD", dec!(-0.15)),
            enable_regime_persistence: env_flag("ENABLE_REGIME_PERSISTENCE", true),
            persistence_days_risk_on: env_parse("PERSISTENCE_DAYS_RISK_ON", 2),
            persistence_days_risk_off: env_parse("PERSISTENCE_DAYS_RISK_OFF", 2),
            persistence_days_quarantine: env_parse("PERSISTENCE_DAYS_QUARANTINE", 3),
            persistence_days_dead: env_parse("PERSISTENCE_DAYS_DEAD", 2),

            soft_drawdown_limit: env_decimal("SOFT_DRAWDOWN_LIMIT", dec!(0.15)),
            hard_drawdown_limit: env_decimal("HARD_DRAWDOWN_LIMIT", dec!(0.20)),
            max_exit_slippage_50pct: env_decimal("MAX_EXIT_SLIPPAGE_50PCT", dec!(0.05)),
            max_exit_slippage_100pct: env_decimal("MAX_EXIT_SLIPPAGE_100PCT", dec!(0.10)),

            max_position_concentration: env_decimal("MAX_POSITION_CONCENTRATION", dec!(0.15)),
            default_position_concentration: env_decimal(
                "DEFAULT_POSITION_CONCENTRATION",
                dec!(0.10),
            ),
            min_positions: env_parse("MIN_POSITIONS", 8),
            max_positions: env_parse("MAX_POSITIONS", 15),

            root_allocation_min: env_decimal("ROOT_ALLOCATION_MIN", dec!(0.55)),
            root_allocation_max: env_decimal("ROOT_ALLOCATION_MAX", dec!(0.75)),
            sleeve_allocation_min: env_decimal("SLEEVE_ALLOCATION_MIN", dec!(0.20)),
            sleeve_allocation_max: env_decimal("SLEEVE_ALLOCATION_MAX", dec!(0.40)),
            buffer_allocation_min: env_decimal("BUFFER_ALLOCATION_MIN", dec!(0.05)),
            buffer_allocation_max: env_decimal("BUFFER_ALLOCATION_MAX", dec!(0.10)),

            max_daily_turnover: env_decimal("MAX_DAILY_TURNOVER", dec!(0.10)),
            max_weekly_turnover: env_decimal("MAX_WEEKLY_TURNOVER", dec!(0.40)),

            min_liquidity_tao: env_decimal("MIN_LIQUIDITY_TAO", dec!(1000)),
            min_holder_count: env_parse("MIN_HOLDER_COUNT", 50),
            min_subnet_age_days: env_parse("MIN_SUBNET_AGE_DAYS", 30),
            max_owner_take: env_decimal("MAX_OWNER_TAKE", dec!(0.20)),
            min_emission_share: env_decimal("MIN_EMISSION_SHARE", dec!(0.001)),
        })
    }

    /// Persistence requirement (consecutive passes) for committing a
    /// transition into `target`.
    pub fn persistence_requirement(&self, target: FlowRegime) -> u32 {
        match target {
            FlowRegime::RiskOn => self.persistence_days_risk_on,
            FlowRegime::RiskOff => self.persistence_days_risk_off,
            FlowRegime::Quarantine => self.persistence_days_quarantine,
            FlowRegime::Dead => self.persistence_days_dead,
            FlowRegime::Neutral => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_type_round_trips() {
        for t in [TxType::Stake, TxType::Unstake, TxType::UnstakeAll] {
            assert_eq!(t.as_str().parse::<TxType>().unwrap(), t);
        }
    }

    #[test]
    fn flow_regime_round_trips() {
        for r in FlowRegime::ALL {
            assert_eq!(r.as_str().parse::<FlowRegime>().unwrap(), r);
        }
    }

    #[test]
    fn unknown_regime_is_rejected() {
        assert!("sideways".parse::<FlowRegime>().is_err());
    }
}
