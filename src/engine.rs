//! The trading engine: warmup, then the beat-driven main loop.
//!
//! WARMUP replays historical frames through the aggregator and the Kalman
//! strategy and seeds the execution strategy's movement statistics. RUN
//! then ticks on the Beat: collect frame, aggregate signals, estimate
//! fairs, intersect with the observed prices, hand to the executor. The
//! loop only ends when replay data runs out or a fatal error propagates
//! through the thread manager.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use nalgebra::DVector;
use tracing::{info, warn};

use crate::exchange::{ExchangeRef, ReplayExchange};
use crate::executor::Executor;
use crate::math::{Gaussian, INF_VARIANCE};
use crate::models::{Currency, ExchangePair, Frame, TradingPair};
use crate::runtime::{Beat, ThreadManager};
use crate::signals::SignalAggregator;
use crate::strategy::{ExecutionConfig, ExecutionStrategy, KalmanConfig, KalmanStrategy};

pub struct EngineParams {
    pub beat_interval_ms: u64,
    pub signal_window: usize,
    pub baskets: BTreeMap<String, Vec<Currency>>,
    pub kalman: KalmanConfig,
    pub execution: ExecutionConfig,
}

/// Builds the full pipeline, replays the warmup frames through it, and
/// attaches the main loop to the thread manager. In replay mode the loop
/// is a finite worker that completes when the data is exhausted.
pub fn build_and_attach(
    thread_manager: &ThreadManager,
    params: EngineParams,
    exchanges: Vec<(ExchangeRef, Vec<TradingPair>)>,
    warmup_frames: &[Frame],
    replay: Option<Arc<ReplayExchange>>,
) -> Result<Arc<Executor>> {
    let universe: Vec<ExchangePair> = exchanges
        .iter()
        .flat_map(|(exchange, pairs)| {
            pairs
                .iter()
                .map(|pair| ExchangePair::new(exchange.id(), pair.clone()))
        })
        .collect();
    if universe.is_empty() {
        anyhow::bail!("engine has no pairs to trade");
    }

    let signal_dim = params.baskets.len();
    let mut aggregator = SignalAggregator::new(params.signal_window, params.baskets);
    let mut kalman = KalmanStrategy::new(params.kalman, universe.clone(), signal_dim);

    // Warmup: replay history through the estimators and collect the
    // complete price rows that seed the execution strategy.
    let mut warmup_rows: Vec<DVector<f64>> = Vec::with_capacity(warmup_frames.len());
    let mut skipped = 0usize;
    for frame in warmup_frames {
        let signals = aggregator.step(frame);
        kalman
            .tick(frame, &signals)
            .context("kalman warmup tick")?;
        match frame_prices(frame, &universe) {
            Some(row) => warmup_rows.push(row),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(skipped, "warmup frames missing pairs were not used for execution seeding");
    }
    info!(
        ticks = warmup_rows.len(),
        pairs = universe.len(),
        "warmup complete"
    );

    let execution = ExecutionStrategy::new(params.execution, universe.clone(), &warmup_rows)?;
    let executor = Arc::new(Executor::new(exchanges.clone(), execution)?);

    let mut beat = Beat::new(params.beat_interval_ms);
    let loop_executor = executor.clone();
    let mut last_prices = warmup_rows
        .last()
        .cloned()
        .unwrap_or_else(|| DVector::zeros(universe.len()));
    let finite = replay.is_some();

    let body = move || -> Result<()> {
        beat.clear();
        loop {
            beat.tick()?;

            if let Some(replay) = &replay {
                if !replay.step_time()? {
                    info!("replay data exhausted");
                    return Ok(());
                }
            }

            let mut frame = Frame::new();
            for (exchange, pairs) in &exchanges {
                frame.extend(exchange.frame(pairs)?);
            }

            let signals = aggregator.step(&frame);
            let kalman_fairs = kalman.tick(&frame, &signals)?;

            for (i, ep) in universe.iter().enumerate() {
                if let Some(point) = frame.get(ep) {
                    last_prices[i] = point.price;
                }
            }
            let observed = Gaussian::diagonal(
                last_prices.clone(),
                DVector::from_element(universe.len(), INF_VARIANCE),
            )?;
            let fairs = kalman_fairs.intersect2(&observed)?;

            loop_executor.tick_fairs(&fairs)?;
        }
    };
    thread_manager.attach("main", body, finite)?;
    Ok(executor)
}

/// Price row aligned with the universe, or None when the frame has gaps.
fn frame_prices(frame: &Frame, universe: &[ExchangePair]) -> Option<DVector<f64>> {
    let mut row = DVector::zeros(universe.len());
    for (i, ep) in universe.iter().enumerate() {
        row[i] = frame.get(ep)?.price;
    }
    Some(row)
}
