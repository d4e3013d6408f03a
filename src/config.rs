//! Engine configuration: a TOML file for parameters, environment for
//! credentials.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::models::{Currency, TradingPair};
use crate::strategy::{ExecutionConfig, KalmanConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Main-loop cadence in milliseconds.
    pub beat_interval_ms: u64,
    /// Historical ticks replayed through the estimators before trading.
    pub warmup_ticks: usize,
    /// Traded pairs, as `BASE-QUOTE` strings.
    pub pairs: Vec<String>,
    pub signals: SignalsConfig,
    pub kalman: KalmanConfig,
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalsConfig {
    pub window_size: usize,
    /// Basket name -> base currency symbols.
    pub baskets: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Exchange id the candle rows were recorded under.
    pub source_exchange: String,
    /// Synthetic books quote the row price ± this.
    pub half_spread: f64,
    pub maker_fee: f64,
    pub taker_fee: f64,
    /// Starting quote-currency balance for the simulated account.
    pub quote_deposit: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            source_exchange: crate::exchange::replay::REPLAY_EXCHANGE_ID.to_string(),
            half_spread: 0.0,
            maker_fee: 0.001,
            taker_fee: 0.002,
            quote_deposit: 0.0,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration errors are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.beat_interval_ms == 0 {
            anyhow::bail!("beat_interval_ms must be positive");
        }
        if self.pairs.is_empty() {
            anyhow::bail!("no trading pairs configured");
        }
        self.trading_pairs()?;
        if self.signals.window_size < 2 {
            anyhow::bail!("signals.window_size must be at least 2");
        }
        if self.kalman.window_size < 2 {
            anyhow::bail!("kalman.window_size must be at least 2");
        }
        if self.kalman.cointegration_period == 0 {
            anyhow::bail!("kalman.cointegration_period must be at least 1");
        }
        if self.kalman.maxlag == 0 {
            anyhow::bail!("kalman.maxlag must be at least 1");
        }
        for (name, half_life) in [
            ("kalman.movement_half_life", self.kalman.movement_half_life),
            ("kalman.trend_half_life", self.kalman.trend_half_life),
            (
                "execution.variance_half_life",
                self.execution.variance_half_life,
            ),
            ("execution.trend_half_life", self.execution.trend_half_life),
            ("execution.accel_half_life", self.execution.accel_half_life),
        ] {
            if half_life <= 0.0 {
                anyhow::bail!("{name} must be positive");
            }
        }
        if self.execution.size <= 0.0 {
            anyhow::bail!("execution.size must be positive");
        }
        if self.replay.half_spread < 0.0 {
            anyhow::bail!("replay.half_spread cannot be negative");
        }
        Ok(())
    }

    pub fn trading_pairs(&self) -> Result<Vec<TradingPair>> {
        self.pairs
            .iter()
            .map(|s| s.parse::<TradingPair>())
            .collect()
    }

    pub fn baskets(&self) -> BTreeMap<String, Vec<Currency>> {
        self.signals
            .baskets
            .iter()
            .map(|(name, bases)| {
                (
                    name.clone(),
                    bases.iter().map(Currency::new).collect::<Vec<_>>(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
beat_interval_ms = 60000
warmup_ticks = 128
pairs = ["BTC-USD", "ETH-USD"]

[signals]
window_size = 50
baskets = { total_market = ["BTC", "ETH"] }

[kalman]
window_size = 500
movement_half_life = 6.0
trend_half_life = 256.0
cointegration_period = 32
maxlag = 8

[execution]
size = 10.0
variance_half_life = 192.0
trend_half_life = 1.0
accel_half_life = 3.0
trend_cutoff = -0.5
min_edge_to_enter = 0.002
min_edge_to_close = 0.0005

[replay]
source_exchange = "binance"
half_spread = 0.5
"#;

    #[test]
    fn test_sample_config_parses() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.trading_pairs().unwrap().len(), 2);
        assert_eq!(config.replay.source_exchange, "binance");
        // Unset replay fields fall back to defaults.
        assert_eq!(config.replay.taker_fee, 0.002);
        let baskets = config.baskets();
        assert_eq!(baskets["total_market"].len(), 2);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.pairs = vec!["BTCUSD".to_string()];
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.beat_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.kalman.window_size = 1;
        assert!(config.validate().is_err());
    }
}
