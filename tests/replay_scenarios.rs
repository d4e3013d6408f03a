//! End-to-end scenarios over the replay adapter.
//!
//! Each test drives the pipeline the way `fairbot replay` would: historical
//! frames into warmup, then replayed ticks through aggregator, estimator,
//! and executor, with fills and balances simulated by the replay exchange.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nalgebra::DVector;

use fairbot::engine::{self, EngineParams};
use fairbot::exchange::{Exchange, ExchangeRef, OrderRequest, ReplayExchange};
use fairbot::executor::Executor;
use fairbot::math::{Gaussian, INF_VARIANCE};
use fairbot::models::{
    Currency, Direction, ExchangePair, Fees, Frame, OrderType, PricePoint, TradingPair,
};
use fairbot::runtime::ThreadManager;
use fairbot::strategy::{ExecutionConfig, ExecutionStrategy, KalmanConfig};

fn btc_usd() -> TradingPair {
    "BTC-USD".parse().unwrap()
}

fn constant_frames(count: usize, price: f64) -> Vec<Frame> {
    (0..count)
        .map(|_| {
            let mut frame = Frame::new();
            frame.insert(
                ExchangePair::new("replay", btc_usd()),
                PricePoint { price, volume: 1.0 },
            );
            frame
        })
        .collect()
}

fn execution_config() -> ExecutionConfig {
    ExecutionConfig {
        size: 10.0,
        variance_half_life: 4.0,
        trend_half_life: 2.0,
        accel_half_life: 2.0,
        trend_cutoff: -0.5,
        min_edge_to_enter: 0.01,
        min_edge_to_close: 0.0005,
    }
}

/// Warmup rows with a little alternating movement so the seeded movement
/// variance is nonzero.
fn warmup_rows(count: usize, price: f64) -> Vec<DVector<f64>> {
    (0..count)
        .map(|i| DVector::from_element(1, price + if i % 2 == 0 { 0.01 } else { -0.01 }))
        .collect()
}

fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// A replay executor harness with the book pumps running.
fn executor_harness(
    frames: Vec<Frame>,
    half_spread: f64,
    fees: Fees,
    config: ExecutionConfig,
) -> (Arc<ReplayExchange>, Executor) {
    let tm = ThreadManager::new();
    let replay = Arc::new(ReplayExchange::new(
        tm.clone(),
        "replay",
        vec![btc_usd()],
        frames,
        fees,
        half_spread,
    ));
    let strategy = ExecutionStrategy::new(
        config,
        vec![ExchangePair::new("replay", btc_usd())],
        &warmup_rows(32, 100.0),
    )
    .unwrap();
    let executor = Executor::new(vec![(replay.clone() as ExchangeRef, vec![btc_usd()])], strategy)
        .unwrap();

    // Track book delivery through a subscriber registered after the
    // executor's, so seeing a book here means the executor saw it too.
    let feed = replay.book_feed(&btc_usd()).unwrap();
    let delivered = Arc::new(parking_lot::Mutex::new(0usize));
    {
        let delivered = delivered.clone();
        feed.subscribe(move |_| *delivered.lock() += 1);
    }

    std::thread::spawn(move || {
        let _ = tm.run();
    });

    replay.step_time().unwrap();
    wait_for("first synthetic book", || *delivered.lock() >= 1);
    (replay, executor)
}

#[test]
fn test_step_edge_above_threshold_buys_at_ask() {
    let (replay, executor) = executor_harness(
        constant_frames(10, 100.0),
        1.0,
        Fees {
            maker: 0.0,
            taker: 0.0,
        },
        execution_config(),
    );

    // Fair fixed at N(110, 10^2): z_edge = 1, so the target position value
    // is `size` = 10 quote, i.e. 10/110 base, bought at the ask.
    executor.tick_fairs(&Gaussian::scalar(110.0, 100.0)).unwrap();

    let submitted = executor.submitted();
    assert_eq!(submitted.len(), 1);
    let order = &submitted[0];
    assert_eq!(order.side, Direction::Buy);
    assert_eq!(order.price, 101.0);
    assert!((order.volume - 10.0 / 110.0).abs() < 1e-9);

    let balances = replay.balances();
    assert!((balances[&Currency::new("BTC")] - 10.0 / 110.0).abs() < 1e-9);
}

#[test]
fn test_closing_hysteresis_through_executor() {
    let fees = Fees {
        maker: 0.001,
        taker: 0.001,
    };
    let (replay, executor) = executor_harness(
        constant_frames(10, 100.0),
        0.1,
        fees,
        ExecutionConfig {
            min_edge_to_close: 0.0005,
            ..execution_config()
        },
    );
    replay.deposit(Currency::new("BTC"), 1.0);

    // Fair collapsed onto the mid with huge uncertainty: the sell-side
    // pct_edge (~0.1%) does not clear fees + min_edge_to_close, so the
    // long position is kept.
    executor
        .tick_fairs(&Gaussian::scalar(100.0, INF_VARIANCE))
        .unwrap();
    assert!(executor.submitted().is_empty());
    assert_eq!(replay.balances()[&Currency::new("BTC")], 1.0);

    // Once the fair drops far enough below the bid, the close fires.
    executor
        .tick_fairs(&Gaussian::scalar(99.0, INF_VARIANCE))
        .unwrap();
    let submitted = executor.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].side, Direction::Sell);
    assert!((replay.balances()[&Currency::new("BTC")]).abs() < 1e-9);
}

#[test]
fn test_infinite_entry_edge_produces_no_orders() {
    let (_replay, executor) = executor_harness(
        constant_frames(10, 100.0),
        1.0,
        Fees {
            maker: 0.0,
            taker: 0.0,
        },
        ExecutionConfig {
            min_edge_to_enter: f64::INFINITY,
            ..execution_config()
        },
    );
    for mean in [50.0, 110.0, 1000.0] {
        executor.tick_fairs(&Gaussian::scalar(mean, 1.0)).unwrap();
    }
    assert!(executor.submitted().is_empty());
}

#[test]
fn test_replay_fill_is_immediate_and_synchronous() {
    let tm = ThreadManager::new();
    let replay = ReplayExchange::new(
        tm,
        "replay",
        vec![btc_usd()],
        constant_frames(2, 100.0),
        Fees {
            maker: 0.0,
            taker: 0.0,
        },
        0.0,
    );
    replay.step_time().unwrap();
    let order = replay
        .add_order(OrderRequest {
            pair: btc_usd(),
            side: Direction::Sell,
            order_type: OrderType::Ioc,
            price: 100.0,
            volume: 0.5,
            maker: false,
        })
        .unwrap();
    assert!(order.status().is_terminal());
    assert_eq!(replay.balances()[&Currency::new("BTC")], -0.5);
    assert_eq!(replay.balances()[&Currency::new("USD")], 50.0);
}

/// Scenario: a flat tape must produce no trades end-to-end. Runs the whole
/// engine the way `fairbot replay` wires it.
#[test]
fn test_flat_tape_trades_nothing() {
    let frames = constant_frames(140, 100.0);
    let (warmup, live) = frames.split_at(40);

    let tm = ThreadManager::new();
    let replay = Arc::new(ReplayExchange::new(
        tm.clone(),
        "replay",
        vec![btc_usd()],
        live.to_vec(),
        Fees {
            maker: 0.001,
            taker: 0.002,
        },
        0.5,
    ));

    let mut baskets = BTreeMap::new();
    baskets.insert("total_market".to_string(), vec![Currency::new("BTC")]);
    let params = EngineParams {
        beat_interval_ms: 25,
        signal_window: 16,
        baskets,
        kalman: KalmanConfig {
            window_size: 8,
            movement_half_life: 2.0,
            trend_half_life: 4.0,
            cointegration_period: 4,
            maxlag: 2,
        },
        execution: execution_config(),
    };

    let executor = engine::build_and_attach(
        &tm,
        params,
        vec![(replay.clone() as ExchangeRef, vec![btc_usd()])],
        warmup,
        Some(replay.clone()),
    )
    .unwrap();

    // The main loop is a finite worker in replay mode; run() returns once
    // the tape is exhausted.
    tm.run().unwrap();

    assert!(executor.submitted().is_empty());
    let balances = replay.balances();
    assert!(balances.values().all(|v| *v == 0.0));
}
