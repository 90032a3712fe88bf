use super::{get_dec, Datastore};
use anyhow::Result;
use chrono::Utc;
use rusqlite::params;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Validator performance per `(hotkey, netuid)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorRecord {
    pub hotkey: String,
    pub netuid: i64,
    pub name: Option<String>,
    pub apy: Decimal,
    pub apy_7d: Decimal,
    pub apy_30d: Decimal,
    pub take_rate: Decimal,
    pub stake_tao: Decimal,
    pub is_quality: bool,
}

impl Datastore {
    pub async fn upsert_validator(&self, rec: &ValidatorRecord) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO validators
             (hotkey, netuid, name, apy, apy_7d, apy_30d, take_rate, stake_tao, is_quality, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(hotkey, netuid) DO UPDATE SET
                name = COALESCE(excluded.name, validators.name),
                apy = excluded.apy,
                apy_7d = excluded.apy_7d,
                apy_30d = excluded.apy_30d,
                take_rate = excluded.take_rate,
                stake_tao = excluded.stake_tao,
                is_quality = excluded.is_quality,
                updated_at = excluded.updated_at",
            params![
                rec.hotkey,
                rec.netuid,
                rec.name,
                rec.apy.to_string(),
                rec.apy_7d.to_string(),
                rec.apy_30d.to_string(),
                rec.take_rate.to_string(),
                rec.stake_tao.to_string(),
                rec.is_quality as i64,
                now,
            ],
        )?;
        Ok(())
    }

    pub async fn get_validator(
        &self,
        hotkey: &str,
        netuid: i64,
    ) -> Result<Option<ValidatorRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT hotkey, netuid, name, apy, apy_7d, apy_30d, take_rate, stake_tao, is_quality
             FROM validators WHERE hotkey = ?1 AND netuid = ?2",
        )?;
        let mut rows = stmt.query(params![hotkey, netuid])?;
        match rows.next()? {
            Some(row) => Ok(Some(ValidatorRecord {
                hotkey: row.get(0)?,
                netuid: row.get(1)?,
                name: row.get(2)?,
                apy: get_dec(row, 3)?,
                apy_7d: get_dec(row, 4)?,
                apy_30d: get_dec(row, 5)?,
                take_rate: get_dec(row, 6)?,
                stake_tao: get_dec(row, 7)?,
                is_quality: row.get::<_, i64>(8)? != 0,
            })),
            None => Ok(None),
        }
    }
}
