use super::{get_dec, get_ts, Datastore};
use crate::models::SlippageAction;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Cached slippage quote for one `(netuid, action, size)` point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlippageSurfaceRecord {
    pub netuid: i64,
    pub action: SlippageAction,
    pub size_tao: Decimal,
    pub slippage_pct: Decimal,
    pub expected_output: Decimal,
    pub pool_tao_reserve: Decimal,
    pub pool_alpha_reserve: Decimal,
    pub computed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SlippageSurfaceRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

impl Datastore {
    pub async fn upsert_slippage_surface(&self, rec: &SlippageSurfaceRecord) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO slippage_surfaces
             (netuid, action, size_tao, slippage_pct, expected_output, pool_tao_reserve, \
              pool_alpha_reserve, computed_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(netuid, action, size_tao) DO UPDATE SET
                slippage_pct = excluded.slippage_pct,
                expected_output = excluded.expected_output,
                pool_tao_reserve = excluded.pool_tao_reserve,
                pool_alpha_reserve = excluded.pool_alpha_reserve,
                computed_at = excluded.computed_at,
                expires_at = excluded.expires_at",
            params![
                rec.netuid,
                rec.action.as_str(),
                rec.size_tao.to_string(),
                rec.slippage_pct.to_string(),
                rec.expected_output.to_string(),
                rec.pool_tao_reserve.to_string(),
                rec.pool_alpha_reserve.to_string(),
                rec.computed_at.timestamp(),
                rec.expires_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Surfaces for one (netuid, action), ascending by size.
    pub async fn list_slippage_surfaces(
        &self,
        netuid: i64,
        action: SlippageAction,
    ) -> Result<Vec<SlippageSurfaceRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT netuid, action, size_tao, slippage_pct, expected_output, pool_tao_reserve, \
             pool_alpha_reserve, computed_at, expires_at
             FROM slippage_surfaces WHERE netuid = ?1 AND action = ?2
             ORDER BY CAST(size_tao AS REAL) ASC",
        )?;
        let rows = stmt.query_map(params![netuid, action.as_str()], |row| {
            let action_raw: String = row.get(1)?;
            Ok(SlippageSurfaceRecord {
                netuid: row.get(0)?,
                action: action_raw.parse().unwrap_or(SlippageAction::Unstake),
                size_tao: get_dec(row, 2)?,
                slippage_pct: get_dec(row, 3)?,
                expected_output: get_dec(row, 4)?,
                pool_tao_reserve: get_dec(row, 5)?,
                pool_alpha_reserve: get_dec(row, 6)?,
                computed_at: get_ts(row, 7)?,
                expires_at: get_ts(row, 8)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Drop surfaces past their expiry. Returns removed count.
    pub async fn cleanup_expired_surfaces(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock().await;
        let removed = conn.execute(
            "DELETE FROM slippage_surfaces WHERE expires_at < ?1",
            params![now.timestamp()],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn surface(netuid: i64, size: Decimal, slip: Decimal) -> SlippageSurfaceRecord {
        let now = Utc::now();
        SlippageSurfaceRecord {
            netuid,
            action: SlippageAction::Unstake,
            size_tao: size,
            slippage_pct: slip,
            expected_output: size * (dec!(1) - slip / dec!(100)),
            pool_tao_reserve: dec!(10000),
            pool_alpha_reserve: dec!(5000),
            computed_at: now,
            expires_at: now + Duration::minutes(5),
        }
    }

    #[tokio::test]
    async fn surfaces_upsert_and_order_by_size() {
        let store = Datastore::open_in_memory().unwrap();
        for (size, slip) in [(dec!(10), dec!(1.0)), (dec!(2), dec!(0.2)), (dec!(5), dec!(0.5))] {
            store
                .upsert_slippage_surface(&surface(1, size, slip))
                .await
                .unwrap();
        }
        // Re-upsert replaces, never duplicates.
        store
            .upsert_slippage_surface(&surface(1, dec!(5), dec!(0.6)))
            .await
            .unwrap();

        let rows = store
            .list_slippage_surfaces(1, SlippageAction::Unstake)
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].size_tao, dec!(2));
        assert_eq!(rows[1].slippage_pct, dec!(0.6));
        assert_eq!(rows[2].size_tao, dec!(10));
    }

    #[tokio::test]
    async fn expired_surfaces_are_cleaned_up() {
        let store = Datastore::open_in_memory().unwrap();
        let mut old = surface(2, dec!(5), dec!(0.4));
        old.expires_at = Utc::now() - Duration::minutes(1);
        store.upsert_slippage_surface(&old).await.unwrap();
        store
            .upsert_slippage_surface(&surface(2, dec!(10), dec!(0.9)))
            .await
            .unwrap();

        let removed = store.cleanup_expired_surfaces(Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        let rows = store
            .list_slippage_surfaces(2, SlippageAction::Unstake)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].size_tao, dec!(10));
    }
}
