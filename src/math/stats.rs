//! Exponential smoothing estimators over vector-valued series.
//!
//! Everything here is restartable cold: `ready` flips once one half-life
//! worth of samples has been seen (or immediately when seeded).

use nalgebra::DVector;

/// Common surface for the smoothing estimators so they compose (see
/// [`TrendEstimator`]).
pub trait Estimator {
    fn step(&mut self, x: &DVector<f64>);
    fn value(&self) -> Option<&DVector<f64>>;
    fn ready(&self) -> bool;
}

fn smoothing_factor(half_life: f64) -> f64 {
    0.5f64.powf(1.0 / half_life)
}

/// Exponentially-weighted moving average.
#[derive(Debug, Clone)]
pub struct Ema {
    a: f64,
    value: Option<DVector<f64>>,
    samples_needed: u64,
}

impl Ema {
    pub fn new(half_life: f64) -> Self {
        Self {
            a: smoothing_factor(half_life),
            value: None,
            samples_needed: half_life.ceil() as u64,
        }
    }

    /// Seeded with an initial value; ready immediately.
    pub fn seeded(half_life: f64, value_0: DVector<f64>) -> Self {
        Self {
            a: smoothing_factor(half_life),
            value: Some(value_0),
            samples_needed: 0,
        }
    }

    pub fn a(&self) -> f64 {
        self.a
    }
}

impl Estimator for Ema {
    fn step(&mut self, x: &DVector<f64>) {
        let prev = self.value.take().unwrap_or_else(|| x.clone());
        self.value = Some(prev * self.a + x * (1.0 - self.a));
        self.samples_needed = self.samples_needed.saturating_sub(1);
    }

    fn value(&self) -> Option<&DVector<f64>> {
        self.value.as_ref()
    }

    fn ready(&self) -> bool {
        self.samples_needed == 0
    }
}

/// Exponentially-weighted mean squared error.
#[derive(Debug, Clone)]
pub struct Emse {
    a: f64,
    mse: Option<DVector<f64>>,
    samples_needed: u64,
}

impl Emse {
    pub fn new(half_life: f64) -> Self {
        Self {
            a: smoothing_factor(half_life),
            mse: None,
            samples_needed: half_life.ceil() as u64,
        }
    }

    pub fn seeded(half_life: f64, mse_0: DVector<f64>) -> Self {
        Self {
            a: smoothing_factor(half_life),
            mse: Some(mse_0),
            samples_needed: 0,
        }
    }

    pub fn mse(&self) -> Option<&DVector<f64>> {
        self.mse.as_ref()
    }

    pub fn stderr(&self) -> Option<DVector<f64>> {
        self.mse.as_ref().map(|m| m.map(f64::sqrt))
    }
}

impl Estimator for Emse {
    fn step(&mut self, e: &DVector<f64>) {
        let prev = self
            .mse
            .take()
            .unwrap_or_else(|| DVector::zeros(e.len()));
        self.mse = Some((prev + e.component_mul(e) * (1.0 - self.a)) * self.a);
        self.samples_needed = self.samples_needed.saturating_sub(1);
    }

    fn value(&self) -> Option<&DVector<f64>> {
        self.mse.as_ref()
    }

    fn ready(&self) -> bool {
        self.samples_needed == 0
    }
}

/// Holt's linear exponential smoothing: a level and a trend with separate
/// half-lives, plus an optional moving mean squared one-step error.
///
/// Implementation from https://people.duke.edu/~rnau/411avg.htm
#[derive(Debug, Clone)]
pub struct HoltEma {
    a: f64,
    b: f64,
    c: Option<f64>,
    value: Option<DVector<f64>>,
    trend: Option<DVector<f64>>,
    mse: Option<DVector<f64>>,
    samples_needed: u64,
}

impl HoltEma {
    pub fn new(value_half_life: f64, trend_half_life: f64, mse_half_life: Option<f64>) -> Self {
        Self {
            a: smoothing_factor(value_half_life),
            b: smoothing_factor(trend_half_life),
            c: mse_half_life.map(smoothing_factor),
            value: None,
            trend: None,
            mse: None,
            samples_needed: value_half_life.max(trend_half_life).ceil() as u64,
        }
    }

    pub fn trend(&self) -> Option<&DVector<f64>> {
        self.trend.as_ref()
    }

    pub fn mse(&self) -> Option<&DVector<f64>> {
        self.mse.as_ref()
    }

    pub fn stderr(&self) -> Option<DVector<f64>> {
        self.mse.as_ref().map(|m| m.map(f64::sqrt))
    }
}

impl Estimator for HoltEma {
    fn step(&mut self, x: &DVector<f64>) {
        let value_old = self.value.take().unwrap_or_else(|| x.clone());
        let trend_old = self
            .trend
            .take()
            .unwrap_or_else(|| DVector::zeros(x.len()));
        let value = (&value_old + &trend_old) * self.a + x * (1.0 - self.a);
        let trend = &trend_old * self.b + (&value - &value_old) * (1.0 - self.b);
        if let Some(c) = self.c {
            let err = x - (&value + &trend);
            let prev_mse = self
                .mse
                .take()
                .unwrap_or_else(|| DVector::zeros(x.len()));
            self.mse = Some((prev_mse + err.component_mul(&err) * (1.0 - c)) * c);
        }
        self.value = Some(value);
        self.trend = Some(trend);
        self.samples_needed = self.samples_needed.saturating_sub(1);
    }

    fn value(&self) -> Option<&DVector<f64>> {
        self.value.as_ref()
    }

    fn ready(&self) -> bool {
        self.samples_needed == 0
    }
}

/// Differences the input and feeds the differences to an inner estimator.
/// With a lag of 1 these are plain first differences; a larger lag
/// estimates the per-step slope over that horizon.
#[derive(Debug, Clone)]
pub struct TrendEstimator<E> {
    inner: E,
    lag: usize,
    window: std::collections::VecDeque<DVector<f64>>,
}

impl<E: Estimator> TrendEstimator<E> {
    pub fn new(inner: E) -> Self {
        Self::with_lag(inner, 1)
    }

    pub fn with_lag(inner: E, lag: usize) -> Self {
        Self {
            inner,
            lag: lag.max(1),
            window: std::collections::VecDeque::new(),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<E: Estimator> Estimator for TrendEstimator<E> {
    fn step(&mut self, x: &DVector<f64>) {
        let oldest = self.window.front().cloned().unwrap_or_else(|| x.clone());
        let span = self.window.len().max(1) as f64;
        let diff = (x - oldest) / span;
        self.window.push_back(x.clone());
        if self.window.len() > self.lag {
            self.window.pop_front();
        }
        self.inner.step(&diff);
    }

    fn value(&self) -> Option<&DVector<f64>> {
        self.inner.value()
    }

    fn ready(&self) -> bool {
        self.inner.ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(x: f64) -> DVector<f64> {
        DVector::from_element(1, x)
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-12, "{a} vs {b}");
    }

    #[test]
    fn test_ema_first_sample_is_identity() {
        let mut ema = Ema::new(4.0);
        ema.step(&v(10.0));
        assert_close(ema.value().unwrap()[0], 10.0);
    }

    #[test]
    fn test_ema_update_rule() {
        let mut ema = Ema::new(2.0);
        let a = ema.a();
        ema.step(&v(10.0));
        ema.step(&v(20.0));
        assert_close(ema.value().unwrap()[0], a * 10.0 + (1.0 - a) * 20.0);
    }

    #[test]
    fn test_ema_warmup_count() {
        let mut ema = Ema::new(3.0);
        assert!(!ema.ready());
        for _ in 0..3 {
            ema.step(&v(1.0));
        }
        assert!(ema.ready());
        assert!(Ema::seeded(3.0, v(1.0)).ready());
    }

    #[test]
    fn test_emse_update_rule() {
        let mut emse = Emse::new(2.0);
        let a = smoothing_factor(2.0);
        emse.step(&v(3.0));
        // mse = a * (0 + (1-a) * 9)
        assert_close(emse.mse().unwrap()[0], a * (1.0 - a) * 9.0);
        assert_close(emse.stderr().unwrap()[0], (a * (1.0 - a) * 9.0).sqrt());
    }

    #[test]
    fn test_holt_tracks_linear_ramp() {
        let mut holt = HoltEma::new(2.0, 2.0, Some(2.0));
        for i in 0..200 {
            holt.step(&v(i as f64));
        }
        // On a perfect ramp the trend converges to the slope and the
        // one-step error vanishes.
        assert!((holt.trend().unwrap()[0] - 1.0).abs() < 1e-6);
        assert!(holt.stderr().unwrap()[0] < 1e-3);
    }

    #[test]
    fn test_trend_estimator_first_differences() {
        let mut trend = TrendEstimator::new(Ema::new(1.0));
        trend.step(&v(5.0));
        // First step has no history, diff is zero.
        assert_close(trend.value().unwrap()[0], 0.0);
        trend.step(&v(8.0));
        // Ema(1.0) has a = 0.5, so value = 0.5*0 + 0.5*3.
        assert_close(trend.value().unwrap()[0], 1.5);
    }

    #[test]
    fn test_trend_estimator_lagged_slope() {
        let mut trend = TrendEstimator::with_lag(Ema::seeded(1.0, v(0.0)), 3);
        for x in [0.0, 1.0, 2.0, 3.0, 4.0] {
            trend.step(&v(x));
        }
        // Per-step slope of a unit ramp is 1 regardless of lag.
        let value = trend.value().unwrap()[0];
        assert!(value > 0.5 && value <= 1.0, "slope estimate {value}");
    }
}
