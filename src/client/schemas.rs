//! Typed response schemas for the TaoStats API.
//!
//! Unknown fields are ignored everywhere. Timestamps arrive in several
//! shapes (ISO-8601 with `Z` or offset, with or without millis, or Unix
//! seconds as int or decimal string); all are normalized to UTC and an
//! unparseable timestamp fails the decode rather than becoming a null.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::de::{self, Deserializer};
use serde::Deserialize;

/// Paginated response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiPage<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub pagination: Option<PageInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageInfo {
    #[serde(default)]
    pub current_page: Option<u32>,
    #[serde(default)]
    pub total_pages: Option<u32>,
    #[serde(default)]
    pub next_page: Option<u32>,
}

impl PageInfo {
    pub fn has_next(&self) -> bool {
        if let Some(next) = self.next_page {
            return next > self.current_page.unwrap_or(0);
        }
        match (self.current_page, self.total_pages) {
            (Some(cur), Some(total)) => cur < total,
            _ => false,
        }
    }
}

/// Current stake balance row from `/stake_balance/latest`.
#[derive(Debug, Clone, Deserialize)]
pub struct StakeBalanceRow {
    pub netuid: i64,
    #[serde(default, deserialize_with = "de_hotkey")]
    pub hotkey: Option<String>,
    /// Alpha balance in rao, as a decimal string.
    #[serde(default)]
    pub balance: Option<String>,
    /// TAO value of the balance in rao, as a decimal string.
    #[serde(default)]
    pub balance_as_tao: Option<String>,
    #[serde(default, deserialize_with = "de_timestamp_opt")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Historical stake balance row from `/stake_balance/history`.
#[derive(Debug, Clone, Deserialize)]
pub struct StakeBalanceHistoryRow {
    pub netuid: i64,
    #[serde(default)]
    pub balance: Option<String>,
    #[serde(default)]
    pub balance_as_tao: Option<String>,
    #[serde(deserialize_with = "de_timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// Wallet extrinsic from `/extrinsics`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtrinsicRow {
    pub id: String,
    pub block_number: i64,
    #[serde(deserialize_with = "de_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub hash: Option<String>,
    /// Fully-qualified call name, e.g. `SubtensorModule.add_stake_limit`.
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub call_args: serde_json::Value,
    #[serde(default)]
    pub fee: Option<String>,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Delegation event from `/delegation` — stake/unstake plus reward credits.
#[derive(Debug, Clone, Deserialize)]
pub struct DelegationEventRow {
    pub id: String,
    pub block_number: i64,
    #[serde(deserialize_with = "de_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub netuid: i64,
    #[serde(default, deserialize_with = "de_hotkey")]
    pub hotkey: Option<String>,
    /// Action name, e.g. `DELEGATE`, `UNDELEGATE`, `REWARD`.
    #[serde(default)]
    pub action: String,
    /// Amount in rao, as a decimal string.
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub alpha: Option<String>,
    #[serde(default)]
    pub usd: Option<Decimal>,
}

/// Daily accounting row from `/accounting/tax`.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountingRow {
    #[serde(default)]
    pub date: Option<String>,
    /// Yield earned that day, in alpha tokens.
    #[serde(default)]
    pub daily_income: Option<Decimal>,
    #[serde(default)]
    pub token_swap: Option<Decimal>,
    #[serde(default)]
    pub token_price_in_tao: Option<Decimal>,
}

/// Pool state row from `/pool/latest` and `/pool/history`.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolRow {
    pub netuid: i64,
    /// TAO-side reserve in rao, as a decimal string.
    #[serde(default)]
    pub total_tao: Option<String>,
    /// Alpha-side reserve in rao, as a decimal string.
    #[serde(default)]
    pub total_alpha: Option<String>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default, deserialize_with = "de_timestamp_opt")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Subnet metadata row from `/subnet/latest`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubnetRow {
    pub netuid: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub owner_take: Option<Decimal>,
    #[serde(default)]
    pub emission_share: Option<Decimal>,
    #[serde(default)]
    pub fee_rate: Option<Decimal>,
    #[serde(default)]
    pub incentive_burn: Option<Decimal>,
    #[serde(default)]
    pub holders: Option<i64>,
    #[serde(default)]
    pub rank: Option<i64>,
    #[serde(default)]
    pub market_cap: Option<String>,
    #[serde(default, deserialize_with = "de_timestamp_opt")]
    pub registered_at: Option<DateTime<Utc>>,
    /// Net flows in rao over 1/3/7/14 day horizons, as decimal strings.
    #[serde(default)]
    pub net_flow_1d: Option<String>,
    #[serde(default)]
    pub net_flow_3d: Option<String>,
    #[serde(default)]
    pub net_flow_7d: Option<String>,
    #[serde(default)]
    pub net_flow_14d: Option<String>,
}

/// Per-size slippage quote from `/slippage`.
#[derive(Debug, Clone, Deserialize)]
pub struct SlippageQuote {
    #[serde(default)]
    pub slippage_percentage: Option<Decimal>,
    #[serde(default)]
    pub expected_output: Option<Decimal>,
    #[serde(default)]
    pub tao_reserve: Option<String>,
    #[serde(default)]
    pub alpha_reserve: Option<String>,
}

/// Validator performance row from `/validator/latest`.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorRow {
    #[serde(default, deserialize_with = "de_hotkey")]
    pub hotkey: Option<String>,
    pub netuid: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub apy: Option<Decimal>,
    #[serde(default)]
    pub apy_7d: Option<Decimal>,
    #[serde(default)]
    pub apy_30d: Option<Decimal>,
    #[serde(default)]
    pub take: Option<Decimal>,
    #[serde(default)]
    pub stake: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Hotkeys arrive either as a bare SS58 string or nested as
/// `{"ss58": "..."}`.
fn de_hotkey<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Plain(String),
        Nested { ss58: Option<String> },
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => None,
        Some(Raw::Plain(s)) => Some(s),
        Some(Raw::Nested { ss58 }) => ss58,
    })
}

/// Parse a timestamp in any of the accepted upstream shapes into UTC.
pub fn parse_timestamp(raw: &serde_json::Value) -> Option<DateTime<Utc>> {
    match raw {
        serde_json::Value::Number(n) => {
            let secs = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_opt(secs, 0).single()
        }
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            // ISO without offset is taken as UTC.
            if let Ok(dt) = DateTime::parse_from_rfc3339(&format!("{s}Z")) {
                return Some(dt.with_timezone(&Utc));
            }
            // Unix seconds as an integer or decimal string.
            if let Ok(secs) = s.parse::<f64>() {
                return Utc.timestamp_opt(secs as i64, 0).single();
            }
            None
        }
        _ => None,
    }
}

fn de_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_json::Value::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| de::Error::custom(format!("unparseable timestamp: {raw}")))
}

fn de_timestamp_opt<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    match raw {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => parse_timestamp(&v)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("unparseable timestamp: {v}"))),
    }
}
