use super::{get_dec, Datastore};
use anyhow::Result;
use chrono::Utc;
use rusqlite::params;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Single-active-row viability scoring configuration. When no active row
/// exists, the scorer falls back to static defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViabilityConfigRecord {
    pub config_name: String,
    pub min_tao_reserve: Decimal,
    pub min_emission_share: Decimal,
    pub min_age_days: i64,
    pub min_holders: i64,
    pub max_drawdown_30d: Decimal,
    pub max_negative_flow_ratio: Decimal,
    pub weight_tao_reserve: Decimal,
    pub weight_net_flow_7d: Decimal,
    pub weight_emission_share: Decimal,
    pub weight_price_trend_7d: Decimal,
    pub weight_subnet_age: Decimal,
    pub weight_max_drawdown_30d: Decimal,
    pub tier_1_min: i64,
    pub tier_2_min: i64,
    pub tier_3_min: i64,
    pub age_cap_days: i64,
    pub enabled: bool,
}

impl Datastore {
    /// Replace the active viability config. Exactly one row stays active.
    pub async fn set_active_viability_config(&self, rec: &ViabilityConfigRecord) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;
        tx.execute("UPDATE viability_configs SET is_active = 0", [])?;
        tx.execute(
            "INSERT INTO viability_configs
             (config_name, is_active, min_tao_reserve, min_emission_share, min_age_days, \
              min_holders, max_drawdown_30d, max_negative_flow_ratio, weight_tao_reserve, \
              weight_net_flow_7d, weight_emission_share, weight_price_trend_7d, \
              weight_subnet_age, weight_max_drawdown_30d, tier_1_min, tier_2_min, tier_3_min, \
              age_cap_days, enabled, updated_at)
             VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                rec.config_name,
                rec.min_tao_reserve.to_string(),
                rec.min_emission_share.to_string(),
                rec.min_age_days,
                rec.min_holders,
                rec.max_drawdown_30d.to_string(),
                rec.max_negative_flow_ratio.to_string(),
                rec.weight_tao_reserve.to_string(),
                rec.weight_net_flow_7d.to_string(),
                rec.weight_emission_share.to_string(),
                rec.weight_price_trend_7d.to_string(),
                rec.weight_subnet_age.to_string(),
                rec.weight_max_drawdown_30d.to_string(),
                rec.tier_1_min,
                rec.tier_2_min,
                rec.tier_3_min,
                rec.age_cap_days,
                rec.enabled as i64,
                now,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn get_active_viability_config(&self) -> Result<Option<ViabilityConfigRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT config_name, min_tao_reserve, min_emission_share, min_age_days, min_holders, \
             max_drawdown_30d, max_negative_flow_ratio, weight_tao_reserve, weight_net_flow_7d, \
             weight_emission_share, weight_price_trend_7d, weight_subnet_age, \
             weight_max_drawdown_30d, tier_1_min, tier_2_min, tier_3_min, age_cap_days, enabled
             FROM viability_configs WHERE is_active = 1
             ORDER BY updated_at DESC, id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(ViabilityConfigRecord {
                config_name: row.get(0)?,
                min_tao_reserve: get_dec(row, 1)?,
                min_emission_share: get_dec(row, 2)?,
                min_age_days: row.get(3)?,
                min_holders: row.get(4)?,
                max_drawdown_30d: get_dec(row, 5)?,
                max_negative_flow_ratio: get_dec(row, 6)?,
                weight_tao_reserve: get_dec(row, 7)?,
                weight_net_flow_7d: get_dec(row, 8)?,
                weight_emission_share: get_dec(row, 9)?,
                weight_price_trend_7d: get_dec(row, 10)?,
                weight_subnet_age: get_dec(row, 11)?,
                weight_max_drawdown_30d: get_dec(row, 12)?,
                tier_1_min: row.get(13)?,
                tier_2_min: row.get(14)?,
                tier_3_min: row.get(15)?,
                age_cap_days: row.get(16)?,
                enabled: row.get::<_, i64>(17)? != 0,
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub(crate) fn sample_config(name: &str) -> ViabilityConfigRecord {
        ViabilityConfigRecord {
            config_name: name.into(),
            min_tao_reserve: dec!(1000),
            min_emission_share: dec!(0.001),
            min_age_days: 30,
            min_holders: 50,
            max_drawdown_30d: dec!(0.6),
            max_negative_flow_ratio: dec!(0.2),
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

    #[tokio::test]
    async fn only_one_config_is_active() {
        let store = Datastore::open_in_memory().unwrap();
        assert!(store.get_active_viability_config().await.unwrap().is_none());

        store
            .set_active_viability_config(&sample_config("first"))
            .await
            .unwrap();
        store
            .set_active_viability_config(&sample_config("second"))
            .await
            .unwrap();

        let active = store.get_active_viability_config().await.unwrap().unwrap();
        assert_eq!(active.config_name, "second");
    }
}
