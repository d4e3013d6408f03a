//! Order book state for one exchange pair.
//!
//! Maintains L2 state from snapshots and per-level deltas. Uses BTreeMap
//! for efficient sorted access to price levels; bids compare in reverse so
//! the best level is always first on both sides.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{ExchangePair, Side};

/// One price level. A size of zero means "remove this level".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

impl BookLevel {
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }
}

/// Price wrapper for BTreeMap ordering.
/// Bids: higher price = better (reverse order).
/// Asks: lower price = better (natural order).
#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderedPrice {
    price: f64,
    is_bid: bool,
}

impl Eq for OrderedPrice {}

impl PartialOrd for OrderedPrice {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedPrice {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if self.is_bid {
            other
                .price
                .partial_cmp(&self.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        } else {
            self.price
                .partial_cmp(&other.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        }
    }
}

/// Sorted bid/ask ladders for one exchange pair. At most one level per
/// price per side.
#[derive(Debug, Clone)]
pub struct OrderBook {
    exchange_pair: ExchangePair,
    bids: BTreeMap<OrderedPrice, f64>,
    asks: BTreeMap<OrderedPrice, f64>,
    needs_reset: bool,
}

impl OrderBook {
    pub fn new(exchange_pair: ExchangePair) -> Self {
        Self {
            exchange_pair,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            needs_reset: false,
        }
    }

    /// Builds a book from an initial snapshot of levels.
    pub fn from_snapshot(
        exchange_pair: ExchangePair,
        bids: impl IntoIterator<Item = BookLevel>,
        asks: impl IntoIterator<Item = BookLevel>,
    ) -> Self {
        let mut book = Self::new(exchange_pair);
        for level in bids {
            book.update(Side::Bid, level);
        }
        for level in asks {
            book.update(Side::Ask, level);
        }
        book
    }

    pub fn exchange_pair(&self) -> &ExchangePair {
        &self.exchange_pair
    }

    /// Applies one level delta: replace the size at that price, insert the
    /// level, or remove it when the size is zero. A crossed result is a
    /// protocol error from the adapter: the book clears itself and raises
    /// `needs_reset` so the consumer resubscribes for a fresh snapshot.
    pub fn update(&mut self, side: Side, level: BookLevel) {
        let key = OrderedPrice {
            price: level.price,
            is_bid: side == Side::Bid,
        };
        let ladder = match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };
        if level.size == 0.0 {
            ladder.remove(&key);
        } else {
            ladder.insert(key, level.size);
        }
        if self.is_crossed() {
            self.clear();
            self.needs_reset = true;
        }
    }

    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids
            .iter()
            .next()
            .map(|(k, &size)| BookLevel::new(k.price, size))
    }

    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks
            .iter()
            .next()
            .map(|(k, &size)| BookLevel::new(k.price, size))
    }

    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / 2.0),
            _ => None,
        }
    }

    fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    /// Set when a crossed update forced a clear; the owner must request a
    /// snapshot resubscription.
    pub fn needs_reset(&self) -> bool {
        self.needs_reset
    }

    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }

    pub fn bids(&self) -> impl Iterator<Item = BookLevel> + '_ {
        self.bids
            .iter()
            .map(|(k, &size)| BookLevel::new(k.price, size))
    }

    pub fn asks(&self) -> impl Iterator<Item = BookLevel> + '_ {
        self.asks
            .iter()
            .map(|(k, &size)| BookLevel::new(k.price, size))
    }

    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }
}
