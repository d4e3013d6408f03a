//! Numerical building blocks: the Gaussian random-variable type and the
//! exponential smoothing estimators used by the strategies.

pub mod gaussian;
pub mod stats;

pub use gaussian::{Gaussian, GaussianError, INF_VARIANCE};
pub use stats::{Ema, Emse, Estimator, HoltEma, TrendEstimator};
