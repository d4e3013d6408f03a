//! Cross-sectional signal aggregation.
//!
//! Rolls a fixed-width window of derived signals over the per-tick frames.
//! The initial signal set is basket log-return indices ("total_market" by
//! default); more baskets come straight from configuration. Output at tick
//! t depends only on frames up to t.

use std::collections::{BTreeMap, VecDeque};

use crate::models::{Currency, ExchangePair, Frame};

/// A windowed table of named signal series, most recent row last.
#[derive(Debug, Clone)]
pub struct SignalWindow {
    names: Vec<String>,
    rows: VecDeque<Vec<f64>>,
    depth: usize,
}

impl SignalWindow {
    fn new(names: Vec<String>, depth: usize) -> Self {
        Self {
            names,
            rows: VecDeque::with_capacity(depth),
            depth,
        }
    }

    fn push(&mut self, row: Vec<f64>) {
        if self.rows.len() == self.depth {
            self.rows.pop_front();
        }
        self.rows.push_back(row);
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The most recent signal row, in `names` order.
    pub fn latest(&self) -> Option<&[f64]> {
        self.rows.back().map(Vec::as_slice)
    }

    /// One signal's windowed series, oldest first.
    pub fn series(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.names.iter().position(|n| n == name)?;
        Some(self.rows.iter().map(|row| row[idx]).collect())
    }
}

/// Computes configured basket signals per tick and maintains the window.
pub struct SignalAggregator {
    baskets: Vec<(String, Vec<Currency>)>,
    window: SignalWindow,
    prev_prices: BTreeMap<ExchangePair, f64>,
}

impl SignalAggregator {
    pub fn new(window_size: usize, baskets: BTreeMap<String, Vec<Currency>>) -> Self {
        let baskets: Vec<(String, Vec<Currency>)> = baskets.into_iter().collect();
        let names = baskets.iter().map(|(name, _)| name.clone()).collect();
        Self {
            baskets,
            window: SignalWindow::new(names, window_size),
            prev_prices: BTreeMap::new(),
        }
    }

    /// Ingests one frame, appends the derived signal row, and returns the
    /// current window.
    pub fn step(&mut self, frame: &Frame) -> SignalWindow {
        let row = self
            .baskets
            .iter()
            .map(|(_, bases)| self.basket_log_return(frame, bases))
            .collect();
        self.window.push(row);
        for (pair, point) in frame {
            self.prev_prices.insert(pair.clone(), point.price);
        }
        self.window.clone()
    }

    /// Mean log-return across the frame's pairs whose base is in the
    /// basket. Pairs without a previous price contribute nothing; an empty
    /// basket reads as flat.
    fn basket_log_return(&self, frame: &Frame, bases: &[Currency]) -> f64 {
        let mut total = 0.0;
        let mut count = 0usize;
        for (pair, point) in frame {
            if !bases.contains(pair.base()) {
                continue;
            }
            if let Some(&prev) = self.prev_prices.get(pair) {
                if prev > 0.0 && point.price > 0.0 {
                    total += (point.price / prev).ln();
                    count += 1;
                }
            }
        }
        if count == 0 {
            0.0
        } else {
            total / count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PricePoint;

    fn frame(prices: &[(&str, f64)]) -> Frame {
        prices
            .iter()
            .map(|&(pair, price)| {
                (
                    pair.parse::<ExchangePair>().unwrap(),
                    PricePoint {
                        price,
                        volume: 1.0,
                    },
                )
            })
            .collect()
    }

    fn total_market(bases: &[&str]) -> BTreeMap<String, Vec<Currency>> {
        let mut baskets = BTreeMap::new();
        baskets.insert(
            "total_market".to_string(),
            bases.iter().map(|&b| Currency::new(b)).collect(),
        );
        baskets
    }

    #[test]
    fn test_first_tick_is_flat() {
        let mut agg = SignalAggregator::new(4, total_market(&["BTC"]));
        let window = agg.step(&frame(&[("bitfinex-BTC-USD", 100.0)]));
        assert_eq!(window.latest(), Some(&[0.0][..]));
    }

    #[test]
    fn test_basket_mean_log_return() {
        let mut agg = SignalAggregator::new(4, total_market(&["BTC", "ETH"]));
        agg.step(&frame(&[
            ("bitfinex-BTC-USD", 100.0),
            ("bitfinex-ETH-USD", 10.0),
        ]));
        let window = agg.step(&frame(&[
            ("bitfinex-BTC-USD", 110.0),
            ("bitfinex-ETH-USD", 9.0),
        ]));
        let expected = ((110.0f64 / 100.0).ln() + (9.0f64 / 10.0).ln()) / 2.0;
        let latest = window.latest().unwrap();
        assert!((latest[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_window_depth_is_bounded() {
        let mut agg = SignalAggregator::new(3, total_market(&["BTC"]));
        for i in 0..10 {
            let window = agg.step(&frame(&[("bitfinex-BTC-USD", 100.0 + i as f64)]));
            assert!(window.len() <= 3);
        }
    }

    #[test]
    fn test_no_lookahead() {
        // Stepping the same prefix of frames must yield the same window,
        // regardless of what comes later.
        let frames: Vec<Frame> = (0..6)
            .map(|i| frame(&[("bitfinex-BTC-USD", 100.0 * 1.01f64.powi(i))]))
            .collect();

        let mut full = SignalAggregator::new(8, total_market(&["BTC"]));
        let mut at_three = None;
        for (i, f) in frames.iter().enumerate() {
            let window = full.step(f);
            if i == 2 {
                at_three = window.series("total_market");
            }
        }

        let mut prefix = SignalAggregator::new(8, total_market(&["BTC"]));
        let mut prefix_window = None;
        for f in frames.iter().take(3) {
            prefix_window = prefix.step(f).series("total_market");
        }
        assert_eq!(at_three, prefix_window);
    }

    #[test]
    fn test_ignores_bases_outside_basket() {
        let mut agg = SignalAggregator::new(4, total_market(&["BTC"]));
        agg.step(&frame(&[
            ("bitfinex-BTC-USD", 100.0),
            ("bitfinex-ETH-USD", 10.0),
        ]));
        let window = agg.step(&frame(&[
            ("bitfinex-BTC-USD", 100.0),
            ("bitfinex-ETH-USD", 20.0),
        ]));
        // ETH doubling is invisible to a BTC-only basket.
        assert_eq!(window.latest(), Some(&[0.0][..]));
    }
}
