//! FIFO cost-basis reconstruction from the stake transaction stream.
//!
//! Replay model:
//! - successful transactions ordered by `(block_number, timestamp)`;
//! - a stake with a known price opens a lot (`alpha = amount / price`);
//!   a stake without one defers (it counts toward TAO totals but opens
//!   no lot until transaction history can supply the alpha);
//! - an unstake consumes emission alpha before purchased lots: emission
//!   slices book to realized yield, lot slices to realized alpha P&L.
//!
//! Invariants the replay maintains:
//!   `net_invested = total_staked - cost of consumed lots`
//!   `realized_pnl = realized_yield + realized_alpha_pnl`

use crate::db::{CostBasisRecord, Datastore, StakeTransactionRecord};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// An open purchased lot.
#[derive(Debug, Clone, PartialEq)]
pub struct Lot {
    pub alpha: Decimal,
    pub tao_at_entry: Decimal,
    pub tao_price_at_entry: Decimal,
    pub usd_at_entry: Option<Decimal>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FifoResult {
    pub record: CostBasisRecord,
    /// Surviving purchased lots, FIFO order.
    pub open_lots: Vec<Lot>,
    /// Emission alpha credited but not yet consumed by unstakes.
    pub emission_remaining: Decimal,
}

/// Replay the ordered transaction stream against reward credits.
///
/// `emission_credits` are `(timestamp, alpha)` reward events ascending;
/// credits at or before an unstake's timestamp are available to it.
pub fn replay_fifo(
    wallet: &str,
    netuid: i64,
    txs: &[StakeTransactionRecord],
    emission_credits: &[(DateTime<Utc>, Decimal)],
) -> FifoResult {
    let mut ordered: Vec<&StakeTransactionRecord> = txs.iter().filter(|t| t.success).collect();
    ordered.sort_by_key(|t| (t.block_number, t.ts));

    let mut lots: VecDeque<Lot> = VecDeque::new();
    let mut credits = emission_credits.iter().peekable();
    let mut emission_available = Decimal::ZERO;

    let mut total_staked = Decimal::ZERO;
    let mut total_unstaked = Decimal::ZERO;
    let mut cost_consumed = Decimal::ZERO;
    let mut realized_pnl = Decimal::ZERO;
    let mut realized_yield = Decimal::ZERO;
    let mut realized_yield_alpha = Decimal::ZERO;
    let mut total_fees = Decimal::ZERO;
    let mut total_staked_usd = Decimal::ZERO;
    let mut total_unstaked_usd = Decimal::ZERO;
    let mut realized_pnl_usd = Decimal::ZERO;
    let mut stake_count = 0i64;
    let mut unstake_count = 0i64;
    let mut first_stake_at: Option<DateTime<Utc>> = None;
    let mut last_transaction_at: Option<DateTime<Utc>> = None;

    // Weighted-average entry accumulates over every lot ever opened.
    let mut purchased_alpha_all = Decimal::ZERO;
    let mut purchased_tao_all = Decimal::ZERO;

    for tx in ordered {
        // Emission credited up to this transaction is available to it.
        while let Some((ts, alpha)) = credits.peek() {
            if *ts <= tx.ts {
                emission_available += *alpha;
                credits.next();
            } else {
                break;
            }
        }

        total_fees += tx.fee_tao;
        last_transaction_at = Some(tx.ts);

        if !tx.tx_type.is_unstake() {
            stake_count += 1;
            total_staked += tx.amount_tao;
            first_stake_at.get_or_insert(tx.ts);
            if let Some(usd) = tx.usd_value {
                total_staked_usd += usd;
            }

            let alpha = tx.alpha_amount.or_else(|| {
                tx.limit_price.and_then(|p| {
                    if p > Decimal::ZERO {
                        Some(tx.amount_tao / p)
                    } else {
                        None
                    }
                })
            });
            match alpha {
                Some(alpha) if alpha > Decimal::ZERO => {
                    let price = tx.amount_tao / alpha;
                    purchased_alpha_all += alpha;
                    purchased_tao_all += tx.amount_tao;
                    lots.push_back(Lot {
                        alpha,
                        tao_at_entry: tx.amount_tao,
                        tao_price_at_entry: price,
                        usd_at_entry: tx.usd_value,
                        ts: tx.ts,
                    });
                }
                _ => {
                    debug!(
                        wallet,
                        netuid,
                        extrinsic = %tx.extrinsic_id,
                        "stake without price, lot deferred"
                    );
                }
            }
            continue;
        }

        unstake_count += 1;
        total_unstaked += tx.amount_tao;
        if let Some(usd) = tx.usd_value {
            total_unstaked_usd += usd;
        }

        let alpha_out = tx.alpha_amount.or_else(|| {
            tx.limit_price.and_then(|p| {
                if p > Decimal::ZERO {
                    Some(tx.amount_tao / p)
                } else {
                    None
                }
            })
        });
        let Some(alpha_out) = alpha_out.filter(|a| *a > Decimal::ZERO) else {
            warn!(
                wallet,
                netuid,
                extrinsic = %tx.extrinsic_id,
                "unstake without alpha quantity, realized attribution skipped"
            );
            continue;
        };
        let exit_price = tx.amount_tao / alpha_out;

        // Emission alpha is consumed first; its cost is zero.
        let from_emission = alpha_out.min(emission_available);
        if from_emission > Decimal::ZERO {
            emission_available -= from_emission;
            let proceeds = from_emission * exit_price;
            realized_yield += proceeds;
            realized_yield_alpha += from_emission;
            realized_pnl += proceeds;
        }

        // The rest comes out of purchased lots, FIFO.
        let mut remaining = alpha_out - from_emission;
        while remaining > Decimal::ZERO {
            let Some(front) = lots.front_mut() else {
                warn!(
                    wallet,
                    netuid,
                    extrinsic = %tx.extrinsic_id,
                    unmatched_alpha = %remaining,
                    "unstake exceeds tracked lots"
                );
                break;
            };
            let slice = remaining.min(front.alpha);
            let cost = slice * front.tao_price_at_entry;
            let proceeds = slice * exit_price;
            realized_pnl += proceeds - cost;
            cost_consumed += cost;

            if let Some(usd) = front.usd_at_entry {
                if front.alpha > Decimal::ZERO && total_unstaked_usd > Decimal::ZERO {
                    let usd_cost = usd * (slice / front.alpha);
                    let usd_proceeds = tx
                        .usd_value
                        .map(|v| v * (slice / alpha_out))
                        .unwrap_or(Decimal::ZERO);
                    realized_pnl_usd += usd_proceeds - usd_cost;
                }
            }

            front.alpha -= slice;
            front.tao_at_entry -= cost;
            remaining -= slice;
            if front.alpha.is_zero() {
                lots.pop_front();
            }
        }
    }

    let alpha_purchased_held: Decimal = lots.iter().map(|l| l.alpha).sum();
    let weighted_avg_entry_price = if purchased_alpha_all > Decimal::ZERO {
        purchased_tao_all / purchased_alpha_all
    } else {
        Decimal::ZERO
    };

    let record = CostBasisRecord {
        wallet_address: wallet.to_string(),
        netuid,
        total_staked_tao: total_staked,
        total_unstaked_tao: total_unstaked,
        net_invested_tao: total_staked - cost_consumed,
        alpha_purchased: alpha_purchased_held,
        weighted_avg_entry_price,
        realized_pnl_tao: realized_pnl,
        realized_yield_tao: realized_yield,
        realized_yield_alpha,
        total_fees_tao: total_fees,
        total_staked_usd,
        total_unstaked_usd,
        usd_cost_basis: total_staked_usd - total_unstaked_usd,
        realized_pnl_usd,
        stake_count,
        unstake_count,
        first_stake_at,
        last_transaction_at,
        computed_at: Utc::now(),
    };

    FifoResult {
        record,
        open_lots: lots.into(),
        emission_remaining: emission_available,
    }
}

/// Recomputes and persists cost basis for positions touched by new
/// transactions, then refreshes the positions' entry fields.
pub struct CostBasisEngine {
    store: Datastore,
}

impl CostBasisEngine {
    pub fn new(store: Datastore) -> Self {
        Self { store }
    }

    pub async fn recompute_position(&self, wallet: &str, netuid: i64) -> Result<CostBasisRecord> {
        let txs = self.store.list_position_transactions(wallet, netuid).await?;
        let credits = self.store.list_reward_credits(wallet, netuid).await?;
        let result = replay_fifo(wallet, netuid, &txs, &credits);
        self.store.upsert_cost_basis(&result.record).await?;

        // Push the exact lot-derived values onto the live position row,
        // replacing any earlier approximation of alpha_purchased.
        if let Some(mut position) = self.store.get_position(wallet, netuid).await? {
            position.alpha_purchased = result.record.alpha_purchased;
            position.entry_price_tao = result.record.weighted_avg_entry_price;
            position.cost_basis_tao = result.record.net_invested_tao;
            position.cost_basis_usd = result.record.usd_cost_basis;
            position.realized_pnl_tao = result.record.realized_pnl_tao;
            position.realized_yield_tao = result.record.realized_yield_tao;
            position.realized_alpha_pnl_tao =
                result.record.realized_pnl_tao - result.record.realized_yield_tao;
            if position.entry_date.is_none() {
                position.entry_date = result.record.first_stake_at;
            }
            self.store.update_position_accounting(&position).await?;
        }

        Ok(result.record)
    }

    pub async fn recompute_positions(
        &self,
        wallet: &str,
        netuids: &[i64],
    ) -> Result<Vec<CostBasisRecord>> {
        let mut out = Vec::with_capacity(netuids.len());
        for &netuid in netuids {
            out.push(self.recompute_position(wallet, netuid).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TxType;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn tx(
        id: &str,
        block: i64,
        tx_type: TxType,
        amount_tao: Decimal,
        alpha: Option<Decimal>,
        limit_price: Option<Decimal>,
    ) -> StakeTransactionRecord {
        StakeTransactionRecord {
            wallet_address: "5W".into(),
            extrinsic_id: id.into(),
            block_number: block,
            ts: Utc.timestamp_opt(1_700_000_000 + block * 12, 0).unwrap(),
            tx_hash: None,
            tx_type,
            call_name: String::new(),
            netuid: 1,
            hotkey: None,
            amount_rao: crate::units::tao_to_rao(amount_tao),
            amount_tao,
            alpha_amount: alpha,
            limit_price,
            usd_value: None,
            fee_tao: Decimal::ZERO,
            success: true,
            error_message: None,
        }
    }

    #[test]
    fn fifo_realized_gain_scenario() {
        // Stake 10 @ 1.0 (10 alpha), stake 10 @ 2.0 (5 alpha),
        // unstake 8 alpha at price 3.0 (proceeds 24).
        let txs = vec![
            tx("1-1", 1, TxType::Stake, dec!(10), None, Some(dec!(1.0))),
            tx("2-1", 2, TxType::Stake, dec!(10), None, Some(dec!(2.0))),
            tx("3-1", 3, TxType::Unstake, dec!(24), Some(dec!(8)), None),
        ];
        let result = replay_fifo("5W", 1, &txs, &[]);
        let rec = &result.record;

        assert_eq!(rec.total_staked_tao, dec!(20));
        assert_eq!(rec.total_unstaked_tao, dec!(24));
        // First 8 alpha come from the 10-alpha lot at price 1.0.
        assert_eq!(rec.realized_pnl_tao, dec!(16));
        assert_eq!(rec.realized_yield_tao, dec!(0));
        // Remaining lots: 2 @ 1.0 and 5 @ 2.0.
        assert_eq!(result.open_lots.len(), 2);
        assert_eq!(result.open_lots[0].alpha, dec!(2));
        assert_eq!(result.open_lots[0].tao_price_at_entry, dec!(1));
        assert_eq!(result.open_lots[1].alpha, dec!(5));
        assert_eq!(result.open_lots[1].tao_price_at_entry, dec!(2));
        assert_eq!(rec.alpha_purchased, dec!(7));
        // Net invested drops by the cost of the consumed slice.
        assert_eq!(rec.net_invested_tao, dec!(12));
    }

    #[test]
    fn emission_alpha_is_consumed_before_lots() {
        let credit_ts = Utc.timestamp_opt(1_700_000_000 + 24, 0).unwrap();
        let txs = vec![
            tx("1-1", 1, TxType::Stake, dec!(10), None, Some(dec!(1.0))),
            // Unstake 4 alpha at price 2.0 after 3 alpha of emission landed.
            tx("5-1", 5, TxType::Unstake, dec!(8), Some(dec!(4)), None),
        ];
        let credits = vec![(credit_ts, dec!(3))];
        let result = replay_fifo("5W", 1, &txs, &credits);
        let rec = &result.record;

        // 3 alpha from emission (cost 0, proceeds 6), 1 from the lot
        // (cost 1, proceeds 2).
        assert_eq!(rec.realized_yield_alpha, dec!(3));
        assert_eq!(rec.realized_yield_tao, dec!(6));
        assert_eq!(rec.realized_pnl_tao, dec!(7));
        let alpha_pnl = rec.realized_pnl_tao - rec.realized_yield_tao;
        assert_eq!(alpha_pnl, dec!(1));
        assert_eq!(result.open_lots[0].alpha, dec!(9));
        assert_eq!(result.emission_remaining, dec!(0));
    }

    #[test]
    fn net_invested_identity_holds_after_replay() {
        let txs = vec![
            tx("1-1", 1, TxType::Stake, dec!(100), None, Some(dec!(0.5))),
            tx("2-1", 2, TxType::Stake, dec!(50), None, Some(dec!(1.0))),
            tx("3-1", 3, TxType::Unstake, dec!(90), Some(dec!(60)), None),
            tx("4-1", 4, TxType::Unstake, dec!(30), Some(dec!(20)), None),
        ];
        let result = replay_fifo("5W", 1, &txs, &[]);
        let rec = &result.record;

        let surviving_cost: Decimal = result.open_lots.iter().map(|l| l.tao_at_entry).sum();
        assert_eq!(rec.net_invested_tao, surviving_cost);
        assert_eq!(
            rec.realized_pnl_tao,
            rec.realized_yield_tao + (rec.realized_pnl_tao - rec.realized_yield_tao)
        );
    }

    #[test]
    fn stake_without_price_defers_lot_but_counts_tao() {
        let txs = vec![tx("1-1", 1, TxType::Stake, dec!(10), None, None)];
        let result = replay_fifo("5W", 1, &txs, &[]);
        assert_eq!(result.record.total_staked_tao, dec!(10));
        assert_eq!(result.record.alpha_purchased, dec!(0));
        assert!(result.open_lots.is_empty());
    }

    #[test]
    fn failed_transactions_are_ignored() {
        let mut failed = tx("1-1", 1, TxType::Stake, dec!(10), None, Some(dec!(1)));
        failed.success = false;
        let result = replay_fifo("5W", 1, &[failed], &[]);
        assert_eq!(result.record.total_staked_tao, dec!(0));
        assert_eq!(result.record.stake_count, 0);
    }

    #[test]
    fn unstake_all_consumes_everything() {
        let credit_ts = Utc.timestamp_opt(1_700_000_000 + 24, 0).unwrap();
        let txs = vec![
            tx("1-1", 1, TxType::Stake, dec!(10), None, Some(dec!(1.0))),
            tx("9-1", 9, TxType::UnstakeAll, dec!(26), Some(dec!(13)), None),
        ];
        let credits = vec![(credit_ts, dec!(3))];
        let result = replay_fifo("5W", 1, &txs, &credits);
        assert!(result.open_lots.is_empty());
        assert_eq!(result.emission_remaining, dec!(0));
        // Emission: 3 alpha * 2.0 = 6; lots: 10 alpha, cost 10, proceeds 20.
        assert_eq!(result.record.realized_yield_tao, dec!(6));
        assert_eq!(result.record.realized_pnl_tao, dec!(16));
    }

    #[tokio::test]
    async fn engine_persists_and_updates_position() {
        use crate::db::PositionRecord;

        let store = Datastore::open_in_memory().unwrap();
        let mut pos = PositionRecord::new("5W", 1);
        pos.alpha_balance = dec!(15);
        pos.tao_value_mid = dec!(30);
        store.apply_position_balances("5W", &[pos]).await.unwrap();

        let txs = vec![
            tx("1-1", 1, TxType::Stake, dec!(10), None, Some(dec!(1.0))),
            tx("2-1", 2, TxType::Stake, dec!(10), None, Some(dec!(2.0))),
        ];
        store.insert_stake_transactions(&txs).await.unwrap();

        let engine = CostBasisEngine::new(store.clone());
        let rec = engine.recompute_position("5W", 1).await.unwrap();
        assert_eq!(rec.alpha_purchased, dec!(15));

        let position = store.get_position("5W", 1).await.unwrap().unwrap();
        assert_eq!(position.alpha_purchased, dec!(15));
        assert_eq!(position.cost_basis_tao, dec!(20));
        // 20 TAO for 15 alpha.
        assert_eq!(position.entry_price_tao, dec!(20) / dec!(15));
        assert!(position.entry_date.is_some());
    }
}
