//! TAO denomination helpers.
//!
//! 1 TAO = 10^9 rao. Conversions are exact: rao is the integer on-chain
//! unit, TAO the human-facing decimal. All monetary math uses `Decimal`;
//! floats never touch balances.

use rust_decimal::Decimal;

/// Rao per TAO (10^9).
pub const RAO_PER_TAO: i64 = 1_000_000_000;

/// Convert an integer rao amount to TAO.
pub fn rao_to_tao(rao: i64) -> Decimal {
    Decimal::new(rao, 9)
}

/// Convert a rao amount carried as a decimal string (the upstream API
/// returns balances as strings) to TAO. Returns None for unparseable input.
pub fn rao_str_to_tao(raw: &str) -> Option<Decimal> {
    let rao: Decimal = raw.trim().parse().ok()?;
    Some(rao / Decimal::from(RAO_PER_TAO))
}

/// Convert TAO back to whole rao, truncating sub-rao dust.
pub fn tao_to_rao(tao: Decimal) -> i64 {
    let rao = tao * Decimal::from(RAO_PER_TAO);
    rao.trunc().try_into().unwrap_or(0)
}

/// Quantize a TAO amount to 9 fractional digits (the rao grid).
pub fn quantize_tao(value: Decimal) -> Decimal {
    value.round_dp(9)
}

/// Quantize a USD amount to cents.
pub fn quantize_usd(value: Decimal) -> Decimal {
    value.round_dp(2)
}

/// Quantize a percentage / ratio field to 6 fractional digits.
pub fn quantize_pct(value: Decimal) -> Decimal {
    value.round_dp(6)
}
