//! End-to-end pipeline over an in-memory store: transaction ingest,
//! FIFO cost basis, yield decomposition, NAV history and the trust gate,
//! without any network.

use chrono::{Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tao_treasury_backend::accounting::{compute_unrealized_decomposition, CostBasisEngine};
use tao_treasury_backend::cache::Cache;
use tao_treasury_backend::client::TaostatsClient;
use tao_treasury_backend::db::{Datastore, PositionRecord, StakeTransactionRecord};
use tao_treasury_backend::models::{Config, SyncTier, TxType};
use tao_treasury_backend::nav::{NavCalculator, SlippageService};
use tao_treasury_backend::trust_gate::evaluate_inputs;
use tao_treasury_backend::metrics::DatasetHealth;

fn test_config() -> Config {
    std::env::set_var("TAOSTATS_API_KEY", "test-key");
    std::env::set_var("WALLET_ADDRESS", "5IntegrationWallet");
    Config::from_env().unwrap()
}

fn stake_tx(
    id: &str,
    block: i64,
    tx_type: TxType,
    netuid: i64,
    amount: Decimal,
    alpha: Option<Decimal>,
    limit_price: Option<Decimal>,
) -> StakeTransactionRecord {
    StakeTransactionRecord {
        wallet_address: "5IntegrationWallet".into(),
        extrinsic_id: id.into(),
        block_number: block,
        ts: Utc.timestamp_opt(1_700_000_000 + block * 12, 0).unwrap(),
        tx_hash: None,
        tx_type,
        call_name: "SubtensorModule.add_stake_limit".into(),
        netuid,
        hotkey: Some("5Validator".into()),
        amount_rao: 0,
        amount_tao: amount,
        alpha_amount: alpha,
        limit_price,
        usd_value: None,
        fee_tao: dec!(0.000125),
        success: true,
        error_message: None,
    }
}

#[tokio::test]
async fn transactions_to_cost_basis_to_decomposition() {
    let wallet = "5IntegrationWallet";
    let store = Datastore::open_in_memory().unwrap();

    // Live balance: 12 alpha worth 36 TAO (price 3.0).
    let mut position = PositionRecord::new(wallet, 64);
    position.alpha_balance = dec!(12);
    position.tao_value_mid = dec!(36);
    store
        .apply_position_balances(wallet, &[position])
        .await
        .unwrap();

    // History: stake 10 @ 1.0, stake 10 @ 2.0, unstake 8 alpha @ 3.0.
    let txs = vec![
        stake_tx("1-1", 1, TxType::Stake, 64, dec!(10), None, Some(dec!(1))),
        stake_tx("2-1", 2, TxType::Stake, 64, dec!(10), None, Some(dec!(2))),
        stake_tx("3-1", 3, TxType::Unstake, 64, dec!(24), Some(dec!(8)), None),
    ];
    let (inserted, touched) = store.insert_stake_transactions(&txs).await.unwrap();
    assert_eq!(inserted, 3);
    assert_eq!(touched, vec![64]);

    // Re-ingest of the same extrinsic stream is a no-op.
    let (inserted, _) = store.insert_stake_transactions(&txs).await.unwrap();
    assert_eq!(inserted, 0);

    let engine = CostBasisEngine::new(store.clone());
    let basis = engine.recompute_position(wallet, 64).await.unwrap();
    assert_eq!(basis.realized_pnl_tao, dec!(16));
    assert_eq!(basis.alpha_purchased, dec!(7));
    assert_eq!(basis.net_invested_tao, dec!(12));
    assert_eq!(basis.total_fees_tao, dec!(0.000375));

    // The position picked up the exact lot-derived fields; 5 alpha of
    // its 12 balance is emission.
    let mut position = store.get_position(wallet, 64).await.unwrap().unwrap();
    position.total_yield_alpha = dec!(5);
    compute_unrealized_decomposition(&mut position);

    assert_eq!(position.cost_basis_tao, dec!(12));
    assert_eq!(position.unrealized_pnl_tao, dec!(24));
    assert_eq!(position.unrealized_yield_tao, dec!(15));
    assert_eq!(position.unrealized_alpha_pnl_tao, dec!(9));
    assert_eq!(
        position.total_unrealized_pnl_tao,
        position.unrealized_yield_tao + position.unrealized_alpha_pnl_tao
    );
}

#[tokio::test]
async fn nav_history_invariants_over_a_week() {
    let config = test_config();
    let store = Datastore::open_in_memory().unwrap();
    let client = TaostatsClient::new(&config, Cache::disabled()).unwrap();
    let slippage = SlippageService::new(store.clone(), client);
    let calc = NavCalculator::new(store.clone(), &slippage);

    let closes = [
        dec!(1000),
        dec!(1060),
        dec!(990),
        dec!(1100),
        dec!(1080),
        dec!(950),
        dec!(1010),
    ];
    for (i, close) in closes.iter().enumerate() {
        let at = Utc.with_ymd_and_hms(2025, 7, 1 + i as u32, 12, 0, 0).unwrap();
        calc.record_nav_day("5W", *close + dec!(10), *close, at)
            .await
            .unwrap();
    }

    let history = store.list_nav_history("5W", "2025-07-01").await.unwrap();
    assert_eq!(history.len(), 7);

    let mut prior_ath = Decimal::ZERO;
    for day in &history {
        assert!(day.nav_exec_high >= day.nav_exec_close);
        assert!(day.nav_exec_low <= day.nav_exec_close);
        assert!(day.nav_exec_ath >= day.nav_exec_close);
        assert!(day.nav_exec_ath >= prior_ath);
        prior_ath = day.nav_exec_ath;
    }

    // Peak 1100 on day 4; close 950 on day 6 is the deepest drawdown.
    let day6 = &history[5];
    assert_eq!(day6.nav_exec_ath, dec!(1100));
    assert_eq!(day6.daily_return_tao, dec!(-130));
}

#[tokio::test]
async fn trust_gate_tracks_sync_and_reconciliation_state() {
    let now = Utc::now();
    let mut datasets = std::collections::HashMap::new();
    datasets.insert(
        SyncTier::Refresh.as_str().to_string(),
        DatasetHealth {
            total_runs: 5,
            total_errors: 0,
            consecutive_failures: 0,
            last_success: Some(now.timestamp()),
            last_error: None,
        },
    );

    // Healthy inputs: ok.
    let report = evaluate_inputs(
        now,
        Some(now - Duration::minutes(1)),
        30,
        Some((now - Duration::hours(2), true, 0)),
        &datasets,
    );
    assert_eq!(report.state.as_str(), "ok");

    // Drift on the latest run: degraded, confidence collapses.
    let report = evaluate_inputs(
        now,
        Some(now - Duration::minutes(1)),
        30,
        Some((now - Duration::hours(2), false, 2)),
        &datasets,
    );
    assert_eq!(report.state.as_str(), "degraded");
    let (confidence, reason) = report.gated_confidence("high");
    assert_eq!(confidence, "low");
    assert!(reason.unwrap().contains("drift"));
}

#[tokio::test]
async fn drained_position_survives_for_realized_queries() {
    let wallet = "5IntegrationWallet";
    let store = Datastore::open_in_memory().unwrap();

    let mut position = PositionRecord::new(wallet, 21);
    position.alpha_balance = dec!(10);
    position.tao_value_mid = dec!(20);
    store
        .apply_position_balances(wallet, &[position])
        .await
        .unwrap();

    let txs = vec![
        stake_tx("1-1", 1, TxType::Stake, 21, dec!(10), None, Some(dec!(1))),
        stake_tx(
            "9-1",
            9,
            TxType::UnstakeAll,
            21,
            dec!(30),
            Some(dec!(10)),
            None,
        ),
    ];
    store.insert_stake_transactions(&txs).await.unwrap();
    CostBasisEngine::new(store.clone())
        .recompute_position(wallet, 21)
        .await
        .unwrap();

    // Wallet fully exits subnet 21.
    store.apply_position_balances(wallet, &[]).await.unwrap();

    let position = store.get_position(wallet, 21).await.unwrap().unwrap();
    assert_eq!(position.alpha_balance, Decimal::ZERO);
    assert_eq!(position.realized_pnl_tao, dec!(20));

    let basis = store.get_cost_basis(wallet, 21).await.unwrap().unwrap();
    assert_eq!(basis.realized_pnl_tao, dec!(20));
    assert_eq!(basis.unstake_count, 1);
}
