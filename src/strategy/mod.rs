//! Trading strategies: the fair-price estimator and the execution policy
//! that turns fair distributions into sized orders.

pub mod execution;
pub mod kalman;

pub use execution::{ExecutionConfig, ExecutionStrategy};
pub use kalman::{KalmanConfig, KalmanStrategy};
