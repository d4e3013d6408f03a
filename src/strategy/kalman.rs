//! Kalman-style fair-price estimator.
//!
//! Predicts fairs from correlated movements between pairs (plus the
//! aggregated basket signals, which enter the observation vector as extra
//! channels). All inputs should be cointegrated. Each channel's implied
//! delta for every other column is treated as an independent noisy
//! observation; intersecting them performs the Bayesian update, and the
//! posterior is rolled forward by an estimated one-step drift.

use std::collections::VecDeque;

use anyhow::Result;
use nalgebra::{DMatrix, DVector};
use serde::Deserialize;

use crate::math::{Ema, Estimator, Gaussian, TrendEstimator, INF_VARIANCE};
use crate::models::{ExchangePair, Frame};
use crate::signals::SignalWindow;

#[derive(Debug, Clone, Deserialize)]
pub struct KalmanConfig {
    /// Depth of the smoothed-observation ring buffer.
    pub window_size: usize,
    /// Half-life of the EMA applied to raw observations.
    pub movement_half_life: f64,
    /// Half-life of the drift estimator.
    pub trend_half_life: f64,
    /// Ticks between re-estimations of the cross-column covariance.
    pub cointegration_period: usize,
    /// Differencing horizon of the drift estimator, in ticks.
    pub maxlag: usize,
}

/// Cached cross-column moment estimates, refreshed every
/// `cointegration_period` ticks.
struct MomentCache {
    mean: DVector<f64>,
    stddev: DVector<f64>,
    covariance: DMatrix<f64>,
    correlation: DMatrix<f64>,
    diff_variance: DVector<f64>,
}

pub struct KalmanStrategy {
    config: KalmanConfig,
    pairs: Vec<ExchangePair>,
    signal_dim: usize,
    movement: Ema,
    drift: TrendEstimator<Ema>,
    history: VecDeque<DVector<f64>>,
    moments: Option<MomentCache>,
    ticks_since_estimate: usize,
    last_prices: Vec<Option<f64>>,
    prev_fair: Option<Gaussian>,
}

impl KalmanStrategy {
    pub fn new(config: KalmanConfig, pairs: Vec<ExchangePair>, signal_dim: usize) -> Self {
        let movement = Ema::new(config.movement_half_life);
        let drift = TrendEstimator::with_lag(Ema::new(config.trend_half_life), config.maxlag);
        let last_prices = vec![None; pairs.len()];
        Self {
            config,
            pairs,
            signal_dim,
            movement,
            drift,
            history: VecDeque::new(),
            moments: None,
            ticks_since_estimate: 0,
            last_prices,
            prev_fair: None,
        }
    }

    pub fn pairs(&self) -> &[ExchangePair] {
        &self.pairs
    }

    /// Mean = last observed prices, variance = the infinite-uncertainty
    /// sentinel. Returned until the estimator is warm.
    fn null_estimate(&self) -> Gaussian {
        let mean = DVector::from_iterator(
            self.pairs.len(),
            self.last_prices.iter().map(|p| p.unwrap_or(0.0)),
        );
        let variances = DVector::from_element(self.pairs.len(), INF_VARIANCE);
        Gaussian::diagonal(mean, variances)
            .unwrap_or_else(|_| unreachable!("dimensions match by construction"))
    }

    /// Raw observation vector: frame prices (carried forward over gaps)
    /// concatenated with the latest signal row.
    fn observe(&mut self, frame: &Frame, signals: &SignalWindow) -> DVector<f64> {
        for (i, pair) in self.pairs.iter().enumerate() {
            if let Some(point) = frame.get(pair) {
                self.last_prices[i] = Some(point.price);
            }
        }
        let dim = self.pairs.len() + self.signal_dim;
        DVector::from_iterator(
            dim,
            self.last_prices
                .iter()
                .map(|p| p.unwrap_or(0.0))
                .chain(
                    (0..self.signal_dim)
                        .map(|i| signals.latest().and_then(|row| row.get(i)).copied().unwrap_or(0.0)),
                ),
        )
    }

    fn estimate_moments(&self) -> MomentCache {
        let dim = self.pairs.len() + self.signal_dim;
        let n = self.history.len() as f64;
        let mut mean = DVector::zeros(dim);
        for row in &self.history {
            mean += row;
        }
        mean /= n;

        let mut covariance = DMatrix::zeros(dim, dim);
        for row in &self.history {
            let centered = row - &mean;
            covariance += &centered * centered.transpose();
        }
        covariance /= n - 1.0;

        let stddev = covariance.diagonal().map(|v| v.max(0.0).sqrt());
        let correlation = DMatrix::from_fn(dim, dim, |r, c| {
            let denom = stddev[r] * stddev[c];
            if denom > 0.0 {
                covariance[(r, c)] / denom
            } else {
                0.0
            }
        });

        // Variance of the one-step differences of the smoothed series,
        // used by the roll-forward drift model.
        let mut diff_variance = DVector::zeros(dim);
        if self.history.len() > 2 {
            let diffs: Vec<DVector<f64>> = self
                .history
                .iter()
                .zip(self.history.iter().skip(1))
                .map(|(a, b)| b - a)
                .collect();
            let m = diffs.len() as f64;
            let mut diff_mean = DVector::zeros(dim);
            for d in &diffs {
                diff_mean += d;
            }
            diff_mean /= m;
            for d in &diffs {
                let centered = d - &diff_mean;
                diff_variance += centered.component_mul(&centered);
            }
            diff_variance /= m - 1.0;
        }

        MomentCache {
            mean,
            stddev,
            covariance,
            correlation,
            diff_variance,
        }
    }

    /// One estimator step; returns the joint fair Gaussian over pairs.
    pub fn tick(&mut self, frame: &Frame, signals: &SignalWindow) -> Result<Gaussian> {
        let observation = self.observe(frame, signals);

        self.movement.step(&observation);
        let smoothed = self
            .movement
            .value()
            .cloned()
            .unwrap_or_else(|| observation.clone());
        self.drift.step(&smoothed);

        if !self.movement.ready() {
            return Ok(self.null_estimate());
        }

        self.history.push_back(smoothed);
        if self.history.len() > self.config.window_size {
            self.history.pop_front();
        }
        if self.history.len() < self.config.window_size {
            return Ok(self.null_estimate());
        }

        if self.moments.is_none() || self.ticks_since_estimate >= self.config.cointegration_period {
            self.moments = Some(self.estimate_moments());
            self.ticks_since_estimate = 0;
        }
        self.ticks_since_estimate += 1;

        let dim = self.pairs.len() + self.signal_dim;
        let moments = self
            .moments
            .as_ref()
            .unwrap_or_else(|| unreachable!("estimated above"));
        let deltas = &observation - &moments.mean;

        // Each column i acts as an observation channel: its delta implies a
        // delta for every column j via their correlation, with variance
        // growing as the correlation weakens.
        let mut channels = Vec::with_capacity(dim);
        for i in 0..dim {
            let mut mean_row = DVector::zeros(dim);
            let mut var_row = DVector::from_element(dim, INF_VARIANCE);
            if moments.stddev[i] > 0.0 {
                for j in 0..dim {
                    let corr = moments.correlation[(i, j)];
                    mean_row[j] = corr * deltas[i] * moments.stddev[j] / moments.stddev[i];
                    let variance = moments.covariance[(i, j)].abs() * moments.stddev[j]
                        / moments.stddev[i]
                        / (corr * corr);
                    var_row[j] = if variance.is_finite() {
                        variance.min(INF_VARIANCE)
                    } else {
                        INF_VARIANCE
                    };
                }
            }
            channels.push(Gaussian::diagonal(mean_row, var_row)?);
        }

        let predicted_deltas = Gaussian::intersect(channels)?;
        let pair_indices: Vec<usize> = (0..self.pairs.len()).collect();
        let predicted = predicted_deltas
            .shift_vec(&moments.mean)?
            .marginal(&pair_indices)?;
        let drift_var = moments.diff_variance.rows(0, self.pairs.len()).into_owned();

        // Roll the previous posterior forward by the estimated drift.
        let drift_mean = self
            .drift
            .value()
            .map(|v| v.rows(0, self.pairs.len()).into_owned())
            .unwrap_or_else(|| DVector::zeros(self.pairs.len()));
        let drift_model = Gaussian::diagonal(drift_mean, drift_var)?;
        let prev = self.prev_fair.take().unwrap_or_else(|| self.null_estimate());

        let prior = Gaussian::sum(vec![prev, drift_model])?;
        let posterior = prior.intersect2(&predicted)?;
        self.prev_fair = Some(posterior.clone());
        Ok(posterior)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PricePoint;
    use crate::signals::SignalAggregator;
    use std::collections::BTreeMap;

    fn pairs() -> Vec<ExchangePair> {
        vec![
            "replay-BTC-USD".parse().unwrap(),
            "replay-ETH-USD".parse().unwrap(),
        ]
    }

    fn frame_for(prices: [f64; 2]) -> Frame {
        pairs()
            .into_iter()
            .zip(prices)
            .map(|(pair, price)| (pair, PricePoint { price, volume: 1.0 }))
            .collect()
    }

    fn config(window: usize) -> KalmanConfig {
        KalmanConfig {
            window_size: window,
            movement_half_life: 2.0,
            trend_half_life: 4.0,
            cointegration_period: 4,
            maxlag: 2,
        }
    }

    #[test]
    fn test_cold_strategy_returns_null_estimate() {
        let mut strategy = KalmanStrategy::new(config(8), pairs(), 0);
        let mut aggregator = SignalAggregator::new(8, BTreeMap::new());
        let frame = frame_for([100.0, 10.0]);
        let signals = aggregator.step(&frame);
        let fair = strategy.tick(&frame, &signals).unwrap();
        assert_eq!(fair.mean()[0], 100.0);
        assert_eq!(fair.mean()[1], 10.0);
        assert!(fair.variances()[0] >= INF_VARIANCE);
    }

    #[test]
    fn test_warm_strategy_tightens_variance() {
        let mut strategy = KalmanStrategy::new(config(8), pairs(), 0);
        let mut aggregator = SignalAggregator::new(8, BTreeMap::new());
        let mut fair = None;
        for i in 0..40 {
            // Correlated random-ish walk on both pairs.
            let wiggle = ((i * 7) % 5) as f64 - 2.0;
            let frame = frame_for([100.0 + wiggle, 10.0 + wiggle / 10.0]);
            let signals = aggregator.step(&frame);
            fair = Some(strategy.tick(&frame, &signals).unwrap());
        }
        let fair = fair.unwrap();
        assert_eq!(fair.dim(), 2);
        assert!(fair.variances()[0] < INF_VARIANCE);
        // A warm posterior should sit near the price it has been fed.
        assert!((fair.mean()[0] - 100.0).abs() < 10.0);
    }

    #[test]
    fn test_estimator_consumes_signal_columns() {
        let mut baskets = BTreeMap::new();
        baskets.insert(
            "total_market".to_string(),
            vec![crate::models::BTC.clone(), crate::models::ETH.clone()],
        );
        let mut strategy = KalmanStrategy::new(config(6), pairs(), 1);
        let mut aggregator = SignalAggregator::new(6, baskets);
        for i in 0..30 {
            let drifted = 100.0 * 1.001f64.powi(i);
            let frame = frame_for([drifted, drifted / 10.0]);
            let signals = aggregator.step(&frame);
            let fair = strategy.tick(&frame, &signals).unwrap();
            // Output stays in pair space even with signal channels mixed in.
            assert_eq!(fair.dim(), 2);
        }
    }
}
