use super::{get_dec, get_dec_opt, get_ts_opt, Datastore};
use crate::models::FlowRegime;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Current mutable state of one subnet. Root is netuid 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetRecord {
    pub netuid: i64,
    pub name: String,
    pub owner_address: Option<String>,
    pub owner_take: Decimal,
    pub fee_rate: Decimal,
    pub incentive_burn: Decimal,
    pub registered_at: Option<DateTime<Utc>>,
    pub age_days: i64,
    pub rank: Option<i64>,
    pub market_cap_tao: Decimal,
    pub emission_share: Decimal,
    pub pool_tao_reserve: Decimal,
    pub pool_alpha_reserve: Decimal,
    pub alpha_price_tao: Decimal,
    pub holder_count: i64,
    pub taoflow_1d: Decimal,
    pub taoflow_3d: Decimal,
    pub taoflow_7d: Decimal,
    pub taoflow_14d: Decimal,
    pub flow_regime: FlowRegime,
    pub flow_regime_since: Option<DateTime<Utc>>,
    pub regime_candidate: Option<FlowRegime>,
    pub regime_candidate_days: u32,
    pub viability_score: Option<Decimal>,
    pub viability_tier: Option<String>,
}

impl SubnetRecord {
    /// Alpha price from pool reserves; undefined when the alpha side is
    /// empty (the subnet is then excluded from valuation).
    pub fn derived_alpha_price(&self) -> Option<Decimal> {
        if self.pool_alpha_reserve.is_zero() {
            None
        } else {
            Some(self.pool_tao_reserve / self.pool_alpha_reserve)
        }
    }
}

/// Immutable historical row for backtesting, drawdown and backfill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetSnapshotRecord {
    pub netuid: i64,
    pub ts: DateTime<Utc>,
    pub alpha_price_tao: Decimal,
    pub pool_tao_reserve: Decimal,
    pub pool_alpha_reserve: Decimal,
    pub emission_share: Decimal,
    pub taoflow_net: Decimal,
    pub holder_count: i64,
    pub flow_regime: FlowRegime,
}

fn subnet_from_row(row: &Row<'_>) -> rusqlite::Result<SubnetRecord> {
    let regime_raw: String = row.get(19)?;
    let candidate_raw: Option<String> = row.get(21)?;
    Ok(SubnetRecord {
        netuid: row.get(0)?,
        name: row.get(1)?,
        owner_address: row.get(2)?,
        owner_take: get_dec(row, 3)?,
        fee_rate: get_dec(row, 4)?,
        incentive_burn: get_dec(row, 5)?,
        registered_at: get_ts_opt(row, 6)?,
        age_days: row.get(7)?,
        rank: row.get(8)?,
        market_cap_tao: get_dec(row, 9)?,
        emission_share: get_dec(row, 10)?,
        pool_tao_reserve: get_dec(row, 11)?,
        pool_alpha_reserve: get_dec(row, 12)?,
        alpha_price_tao: get_dec(row, 13)?,
        holder_count: row.get(14)?,
        taoflow_1d: get_dec(row, 15)?,
        taoflow_3d: get_dec(row, 16)?,
        taoflow_7d: get_dec(row, 17)?,
        taoflow_14d: get_dec(row, 18)?,
        flow_regime: regime_raw.parse().unwrap_or(FlowRegime::Neutral),
        flow_regime_since: get_ts_opt(row, 20)?,
        regime_candidate: candidate_raw.and_then(|s| s.parse().ok()),
        regime_candidate_days: row.get::<_, i64>(22)? as u32,
        viability_score: get_dec_opt(row, 23)?,
        viability_tier: row.get(24)?,
    })
}

const SUBNET_COLUMNS: &str = "netuid, name, owner_address, owner_take, fee_rate, incentive_burn, \
     registered_at, age_days, rank, market_cap_tao, emission_share, pool_tao_reserve, \
     pool_alpha_reserve, alpha_price_tao, holder_count, taoflow_1d, taoflow_3d, taoflow_7d, \
     taoflow_14d, flow_regime, flow_regime_since, regime_candidate, regime_candidate_days, \
     viability_score, viability_tier";

impl Datastore {
    /// Upsert the volatile market fields of a subnet; regime and
    /// viability columns are owned by their own engines and untouched here.
    pub async fn upsert_subnet_market_state(&self, rec: &SubnetRecord) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO subnets (netuid, name, owner_address, owner_take, fee_rate, \
             incentive_burn, registered_at, age_days, rank, market_cap_tao, emission_share, \
             pool_tao_reserve, pool_alpha_reserve, alpha_price_tao, holder_count, \
             taoflow_1d, taoflow_3d, taoflow_7d, taoflow_14d, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
             ON CONFLICT(netuid) DO UPDATE SET
                name = excluded.name,
                owner_address = excluded.owner_address,
                owner_take = excluded.owner_take,
                fee_rate = excluded.fee_rate,
                incentive_burn = excluded.incentive_burn,
                registered_at = excluded.registered_at,
                age_days = excluded.age_days,
                rank = excluded.rank,
                market_cap_tao = excluded.market_cap_tao,
                emission_share = excluded.emission_share,
                pool_tao_reserve = excluded.pool_tao_reserve,
                pool_alpha_reserve = excluded.pool_alpha_reserve,
                alpha_price_tao = excluded.alpha_price_tao,
                holder_count = excluded.holder_count,
                taoflow_1d = excluded.taoflow_1d,
                taoflow_3d = excluded.taoflow_3d,
                taoflow_7d = excluded.taoflow_7d,
                taoflow_14d = excluded.taoflow_14d,
                updated_at = excluded.updated_at",
            params![
                rec.netuid,
                rec.name,
                rec.owner_address,
                rec.owner_take.to_string(),
                rec.fee_rate.to_string(),
                rec.incentive_burn.to_string(),
                rec.registered_at.map(|t| t.timestamp()),
                rec.age_days,
                rec.rank,
                rec.market_cap_tao.to_string(),
                rec.emission_share.to_string(),
                rec.pool_tao_reserve.to_string(),
                rec.pool_alpha_reserve.to_string(),
                rec.alpha_price_tao.to_string(),
                rec.holder_count,
                rec.taoflow_1d.to_string(),
                rec.taoflow_3d.to_string(),
                rec.taoflow_7d.to_string(),
                rec.taoflow_14d.to_string(),
                now,
            ],
        )?;
        Ok(())
    }

    pub async fn get_subnet(&self, netuid: i64) -> Result<Option<SubnetRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SUBNET_COLUMNS} FROM subnets WHERE netuid = ?1"
        ))?;
        let mut rows = stmt.query(params![netuid])?;
        match rows.next()? {
            Some(row) => Ok(Some(subnet_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_subnets(&self) -> Result<Vec<SubnetRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SUBNET_COLUMNS} FROM subnets ORDER BY netuid ASC"
        ))?;
        let rows = stmt.query_map([], |row| subnet_from_row(row))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Subnets with non-empty pools, the regime engine's working set.
    pub async fn list_subnets_with_liquidity(&self) -> Result<Vec<SubnetRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SUBNET_COLUMNS} FROM subnets
             WHERE CAST(pool_tao_reserve AS REAL) > 0 ORDER BY netuid ASC"
        ))?;
        let rows = stmt.query_map([], |row| subnet_from_row(row))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Persist the outcome of one regime-engine pass for a subnet.
    pub async fn update_subnet_regime(
        &self,
        netuid: i64,
        regime: FlowRegime,
        regime_since: Option<DateTime<Utc>>,
        candidate: Option<FlowRegime>,
        candidate_days: u32,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.lock().await;
        conn.execute(
            "UPDATE subnets SET flow_regime = ?2, flow_regime_since = ?3,
                regime_candidate = ?4, regime_candidate_days = ?5, updated_at = ?6
             WHERE netuid = ?1",
            params![
                netuid,
                regime.as_str(),
                regime_since.map(|t| t.timestamp()),
                candidate.map(|c| c.as_str()),
                candidate_days as i64,
                now,
            ],
        )?;
        Ok(())
    }

    pub async fn update_subnet_viability(
        &self,
        netuid: i64,
        score: Option<Decimal>,
        tier: &str,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.lock().await;
        conn.execute(
            "UPDATE subnets SET viability_score = ?2, viability_tier = ?3, updated_at = ?4
             WHERE netuid = ?1",
            params![netuid, score.map(|s| s.to_string()), tier, now],
        )?;
        Ok(())
    }

    pub async fn insert_subnet_snapshot(&self, snap: &SubnetSnapshotRecord) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO subnet_snapshots (netuid, ts, alpha_price_tao, pool_tao_reserve, \
             pool_alpha_reserve, emission_share, taoflow_net, holder_count, flow_regime)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                snap.netuid,
                snap.ts.timestamp(),
                snap.alpha_price_tao.to_string(),
                snap.pool_tao_reserve.to_string(),
                snap.pool_alpha_reserve.to_string(),
                snap.emission_share.to_string(),
                snap.taoflow_net.to_string(),
                snap.holder_count,
                snap.flow_regime.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Most recent daily net flows for a subnet, newest first.
    pub async fn recent_daily_flows(&self, netuid: i64, limit: usize) -> Result<Vec<Decimal>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT taoflow_net FROM subnet_snapshots
             WHERE netuid = ?1 ORDER BY ts DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![netuid, limit as i64], |row| get_dec(row, 0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Alpha price path for a subnet since `since`, ascending.
    pub async fn subnet_price_history(
        &self,
        netuid: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, Decimal)>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT ts, alpha_price_tao FROM subnet_snapshots
             WHERE netuid = ?1 AND ts >= ?2 ORDER BY ts ASC",
        )?;
        let rows = stmt.query_map(params![netuid, since.timestamp()], |row| {
            Ok((super::get_ts(row, 0)?, get_dec(row, 1)?))
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub(crate) fn sample_subnet(netuid: i64) -> SubnetRecord {
        SubnetRecord {
            netuid,
            name: format!("SN{netuid}"),
            owner_address: None,
            owner_take: dec!(0.18),
            fee_rate: dec!(0.001),
            incentive_burn: dec!(0),
            registered_at: None,
            age_days: 120,
            rank: Some(netuid),
            market_cap_tao: dec!(50000),
            emission_share: dec!(0.02),
            pool_tao_reserve: dec!(10000),
            pool_alpha_reserve: dec!(5000),
            alpha_price_tao: dec!(2),
            holder_count: 400,
            taoflow_1d: dec!(0.01),
            taoflow_3d: dec!(0.02),
            taoflow_7d: dec!(0.06),
            taoflow_14d: dec!(0.08),
            flow_regime: FlowRegime::Neutral,
            flow_regime_since: None,
            regime_candidate: None,
            regime_candidate_days: 0,
            viability_score: None,
            viability_tier: None,
        }
    }

    #[tokio::test]
    async fn upsert_preserves_regime_columns() {
        let store = Datastore::open_in_memory().unwrap();
        let subnet = sample_subnet(7);
        store.upsert_subnet_market_state(&subnet).await.unwrap();

        store
            .update_subnet_regime(7, FlowRegime::RiskOff, Some(Utc::now()), None, 0)
            .await
            .unwrap();

        // Market refresh must not clobber the regime.
        store.upsert_subnet_market_state(&subnet).await.unwrap();
        let loaded = store.get_subnet(7).await.unwrap().unwrap();
        assert_eq!(loaded.flow_regime, FlowRegime::RiskOff);
        assert_eq!(loaded.pool_tao_reserve, dec!(10000));
    }

    #[tokio::test]
    async fn derived_price_handles_empty_pool() {
        let mut subnet = sample_subnet(3);
        assert_eq!(subnet.derived_alpha_price(), Some(dec!(2)));
        subnet.pool_alpha_reserve = dec!(0);
        assert_eq!(subnet.derived_alpha_price(), None);
    }

    #[tokio::test]
    async fn candidate_round_trips() {
        let store = Datastore::open_in_memory().unwrap();
        store
            .upsert_subnet_market_state(&sample_subnet(9))
            .await
            .unwrap();
        store
            .update_subnet_regime(9, FlowRegime::Neutral, None, Some(FlowRegime::RiskOff), 1)
            .await
            .unwrap();
        let loaded = store.get_subnet(9).await.unwrap().unwrap();
        assert_eq!(loaded.regime_candidate, Some(FlowRegime::RiskOff));
        assert_eq!(loaded.regime_candidate_days, 1);
    }
}
