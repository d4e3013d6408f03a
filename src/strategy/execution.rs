//! Execution policy: turns fair distributions into sized orders.
//!
//! Stateless per tick apart from its movement statistics. Takes fairs as a
//! Gaussian and positions in base currency; returns base-currency order
//! sizes (negative = sell). Since the fair estimate's uncertainty is
//! joint, a price change in one pair can move the desired position in
//! another, so the whole universe is sized at once.

use anyhow::Result;
use nalgebra::DVector;
use serde::Deserialize;
use tracing::{info, warn};

use crate::math::{Emse, Estimator, Gaussian, HoltEma};
use crate::models::ExchangePair;

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Target position value per unit of z-edge, in quote currency.
    pub size: f64,
    pub variance_half_life: f64,
    pub trend_half_life: f64,
    pub accel_half_life: f64,
    /// Orders only go out when `z_trend · sign(pct_edge)` clears this.
    pub trend_cutoff: f64,
    pub min_edge_to_enter: f64,
    pub min_edge_to_close: f64,
}

#[derive(Debug)]
pub struct ExecutionStrategy {
    config: ExecutionConfig,
    pairs: Vec<ExchangePair>,
    mvmt_variance: Emse,
    trend_estimator: HoltEma,
    prev_mids: DVector<f64>,
}

/// `sign` with the zero-is-zero convention the sizing math relies on
/// (`f64::signum` maps +0.0 to 1.0).
fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

impl ExecutionStrategy {
    /// Seeds the movement statistics from warmup price history (one row of
    /// mid prices per tick, aligned with `pairs`). Fails loudly when the
    /// warmup horizon cannot cover the configured half-lives.
    pub fn new(
        config: ExecutionConfig,
        pairs: Vec<ExchangePair>,
        warmup_prices: &[DVector<f64>],
    ) -> Result<Self> {
        let needed = (4.0
            * config
                .variance_half_life
                .max(config.trend_half_life)
                .max(config.accel_half_life))
        .ceil() as usize;
        if warmup_prices.len() < needed {
            anyhow::bail!(
                "warmup data too short for execution strategy: {} rows < {} required",
                warmup_prices.len(),
                needed
            );
        }
        for row in warmup_prices {
            if row.len() != pairs.len() {
                anyhow::bail!(
                    "warmup row dimension {} does not match pair universe {}",
                    row.len(),
                    pairs.len()
                );
            }
        }

        let movements: Vec<DVector<f64>> = warmup_prices
            .iter()
            .zip(warmup_prices.iter().skip(1))
            .map(|(a, b)| b - a)
            .collect();

        let mut mse = DVector::zeros(pairs.len());
        for mvmt in &movements {
            mse += mvmt.component_mul(mvmt);
        }
        mse /= movements.len() as f64;
        let mvmt_variance = Emse::seeded(config.variance_half_life, mse);

        let mut trend_estimator =
            HoltEma::new(config.trend_half_life, config.accel_half_life, None);
        let trend_window = (4.0 * config.accel_half_life).ceil() as usize;
        for mvmt in movements.iter().rev().take(trend_window).rev() {
            trend_estimator.step(mvmt);
        }

        let prev_mids = warmup_prices[warmup_prices.len() - 1].clone();

        if mvmt_variance.ready() {
            info!("execution strategy initialized and warm");
        } else {
            warn!("insufficient warmup data for execution strategy, warming up in real time");
        }

        Ok(Self {
            config,
            pairs,
            mvmt_variance,
            trend_estimator,
            prev_mids,
        })
    }

    pub fn pairs(&self) -> &[ExchangePair] {
        &self.pairs
    }

    /// One sizing pass. All vectors are aligned with the pair universe;
    /// `fees` is the venue's taker rate.
    pub fn tick(
        &mut self,
        positions: &DVector<f64>,
        bids: &DVector<f64>,
        asks: &DVector<f64>,
        fairs: &Gaussian,
        fees: f64,
    ) -> Result<DVector<f64>> {
        let n = self.pairs.len();
        if positions.len() != n || bids.len() != n || asks.len() != n || fairs.dim() != n {
            anyhow::bail!(
                "execution tick dimension mismatch: universe {n}, positions {}, bids {}, asks {}, fairs {}",
                positions.len(),
                bids.len(),
                asks.len(),
                fairs.dim()
            );
        }

        // Mid prices drive the target vector so both sides of the book
        // influence inventory equally.
        let mids = (bids + asks) / 2.0;
        let mvmt = &mids - &self.prev_mids;
        self.mvmt_variance.step(&mvmt);
        self.trend_estimator.step(&mvmt);
        self.prev_mids = mids.clone();

        if !self.mvmt_variance.ready() {
            return Ok(DVector::zeros(n));
        }

        let fair_mean = fairs.mean();
        let fair_stddev = fairs.stddev();
        // The trend signal is the Holt-smoothed movement level, not its
        // slope.
        let trend = self
            .trend_estimator
            .value()
            .cloned()
            .unwrap_or_else(|| DVector::zeros(n));
        let mvmt_stderr = self
            .mvmt_variance
            .stderr()
            .unwrap_or_else(|| DVector::zeros(n));

        let mut orders = DVector::zeros(n);
        for i in 0..n {
            let stddev = fair_stddev[i];
            let z_edge = if stddev > 0.0 {
                (fair_mean[i] - mids[i]) / stddev
            } else {
                0.0
            };
            let z_trend = if mvmt_stderr[i] > 0.0 {
                trend[i] / mvmt_stderr[i]
            } else {
                0.0
            };

            let target_value = z_edge * self.config.size;
            let target_position = if fair_mean[i] != 0.0 {
                target_value / fair_mean[i]
            } else {
                0.0
            };
            let proposed = target_position - positions[i];

            let price = if proposed >= 0.0 { asks[i] } else { bids[i] };
            if price <= 0.0 {
                continue;
            }
            let pct_edge = fair_mean[i] / price - 1.0;

            let profitable = sign(proposed) * pct_edge > fees + self.config.min_edge_to_enter;
            let trending_correctly = z_trend * sign(pct_edge) > self.config.trend_cutoff;

            let opening = if profitable && trending_correctly {
                proposed
            } else {
                0.0
            };

            let should_close =
                -sign(positions[i]) * pct_edge > fees + self.config.min_edge_to_close;
            let closing = if !profitable && should_close && trending_correctly {
                -positions[i]
            } else {
                0.0
            };

            orders[i] = opening + closing;
        }
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::INF_VARIANCE;

    fn pair() -> Vec<ExchangePair> {
        vec!["replay-BTC-USD".parse().unwrap()]
    }

    fn config() -> ExecutionConfig {
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

    fn warmup(rows: usize, price: f64) -> Vec<DVector<f64>> {
        // Tiny alternating movements so the seeded variance is nonzero.
        (0..rows)
            .map(|i| DVector::from_element(1, price + if i % 2 == 0 { 0.01 } else { -0.01 }))
            .collect()
    }

    fn strategy() -> ExecutionStrategy {
        ExecutionStrategy::new(config(), pair(), &warmup(32, 100.0)).unwrap()
    }

    #[test]
    fn test_rejects_short_warmup() {
        let err = ExecutionStrategy::new(config(), pair(), &warmup(3, 100.0)).unwrap_err();
        assert!(err.to_string().contains("warmup data too short"));
    }

    #[test]
    fn test_buys_on_positive_edge() {
        let mut strategy = strategy();
        let fairs = Gaussian::scalar(110.0, 100.0);
        let orders = strategy
            .tick(
                &DVector::zeros(1),
                &DVector::from_element(1, 99.0),
                &DVector::from_element(1, 101.0),
                &fairs,
                0.0,
            )
            .unwrap();
        // z_edge = (110 - 100) / 10 = 1, target = 10 quote -> 10/110 base.
        assert!((orders[0] - 10.0 / 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_infinite_entry_edge_never_trades() {
        let mut cfg = config();
        cfg.min_edge_to_enter = f64::INFINITY;
        cfg.min_edge_to_close = f64::INFINITY;
        let mut strategy = ExecutionStrategy::new(cfg, pair(), &warmup(32, 100.0)).unwrap();
        for fair_mean in [50.0, 100.0, 500.0] {
            let orders = strategy
                .tick(
                    &DVector::from_element(1, 1.0),
                    &DVector::from_element(1, 99.0),
                    &DVector::from_element(1, 101.0),
                    &Gaussian::scalar(fair_mean, 1.0),
                    0.001,
                )
                .unwrap();
            assert_eq!(orders[0], 0.0);
        }
    }

    #[test]
    fn test_unprofitable_when_edge_below_fees() {
        let mut strategy = strategy();
        // pct_edge to buy = 110/101 - 1 ~ 8.9%; fees swamp it.
        let orders = strategy
            .tick(
                &DVector::zeros(1),
                &DVector::from_element(1, 99.0),
                &DVector::from_element(1, 101.0),
                &Gaussian::scalar(110.0, 100.0),
                0.5,
            )
            .unwrap();
        assert_eq!(orders[0], 0.0);
    }

    #[test]
    fn test_trend_filter_blocks_entry() {
        let mut strategy = strategy();
        // Feed strongly falling mids: the smoothed movement tracks the
        // constant -1 drop, so z_trend settles well below -1.
        let mut orders = DVector::zeros(1);
        for i in 0..10 {
            let mid = 100.0 - i as f64;
            orders = strategy
                .tick(
                    &DVector::zeros(1),
                    &DVector::from_element(1, mid - 1.0),
                    &DVector::from_element(1, mid + 1.0),
                    &Gaussian::scalar(mid + 10.0, 100.0),
                    0.0,
                )
                .unwrap();
        }
        // The buy edge is large and positive, but z_trend * sign(pct_edge)
        // sits below the default trend_cutoff, so the entry is blocked.
        assert_eq!(orders[0], 0.0);
    }

    #[test]
    fn test_closing_hysteresis() {
        let mut strategy = strategy();
        // Long 1 unit; fair collapses to the mid with wide uncertainty, so
        // no profitable entry. pct_edge on the sell side is tiny: below
        // fees + min_edge_to_close, the position is kept.
        let orders = strategy
            .tick(
                &DVector::from_element(1, 1.0),
                &DVector::from_element(1, 99.9),
                &DVector::from_element(1, 100.1),
                &Gaussian::scalar(100.0, INF_VARIANCE),
                0.001,
            )
            .unwrap();
        assert_eq!(orders[0], 0.0);

        // Once the edge on the close clears fees + min_edge_to_close, the
        // position is flattened.
        let orders = strategy
            .tick(
                &DVector::from_element(1, 1.0),
                &DVector::from_element(1, 99.9),
                &DVector::from_element(1, 100.1),
                &Gaussian::scalar(99.0, INF_VARIANCE),
                0.001,
            )
            .unwrap();
        assert!((orders[0] + 1.0).abs() < 1e-12);
    }
}
