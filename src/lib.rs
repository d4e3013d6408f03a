//! Fairbot: a Kalman market-making and statistical-arbitrage engine.
//!
//! The pipeline: exchange adapters stream books and balances into typed
//! feeds; each beat, the engine collects a price/volume frame, aggregates
//! basket signals, updates the Kalman fair estimator, and hands the joint
//! fair distribution to the executor, which reconciles desired positions
//! against the live books.

pub mod book;
pub mod config;
pub mod engine;
pub mod exchange;
pub mod executor;
pub mod history;
pub mod math;
pub mod models;
pub mod runtime;
pub mod signals;
pub mod strategy;
