//! Replay exchange: the live interface driven by historical candles.
//!
//! `step_time` advances a simulated clock one row at a time, publishing a
//! synthetic single-level book per pair at the row price. Fills are
//! immediate at the submitted price and positions update synchronously, so
//! a backtest's balance view is consistent within the same tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use crossbeam::channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::book::{BookLevel, OrderBook};
use crate::exchange::{Exchange, ExchangeError, OrderRequest};
use crate::models::{
    Currency, Direction, ExchangePair, Fees, Frame, Order, OrderStatus, TradingPair,
};
use crate::runtime::{Feed, ThreadManager};

/// Default id when the replayed data is not tied to a specific venue.
pub const REPLAY_EXCHANGE_ID: &str = "replay";

struct Clock {
    frames: Vec<Frame>,
    cursor: usize,
    current: Option<Frame>,
}

pub struct ReplayExchange {
    thread_manager: ThreadManager,
    /// Reported as `id()`; set to the recorded venue's id so replayed
    /// frames keep their original keys.
    exchange_id: String,
    pairs: Vec<TradingPair>,
    fees: Fees,
    /// Synthetic books quote `price ± half_spread`.
    half_spread: f64,
    clock: Mutex<Clock>,
    books: Mutex<HashMap<TradingPair, Feed<OrderBook>>>,
    book_taps: Mutex<HashMap<TradingPair, Sender<OrderBook>>>,
    balances: RwLock<HashMap<Currency, f64>>,
    next_order_id: AtomicU64,
}

impl ReplayExchange {
    pub fn new(
        thread_manager: ThreadManager,
        exchange_id: impl Into<String>,
        pairs: Vec<TradingPair>,
        frames: Vec<Frame>,
        fees: Fees,
        half_spread: f64,
    ) -> Self {
        Self {
            thread_manager,
            exchange_id: exchange_id.into(),
            pairs,
            fees,
            half_spread,
            clock: Mutex::new(Clock {
                frames,
                cursor: 0,
                current: None,
            }),
            books: Mutex::new(HashMap::new()),
            book_taps: Mutex::new(HashMap::new()),
            balances: RwLock::new(HashMap::new()),
            next_order_id: AtomicU64::new(1),
        }
    }

    /// Seeds a starting balance (the replayed account's deposit).
    pub fn deposit(&self, currency: Currency, amount: f64) {
        *self.balances.write().entry(currency).or_insert(0.0) += amount;
    }

    /// Rows remaining on the simulated clock.
    pub fn remaining(&self) -> usize {
        let clock = self.clock.lock();
        clock.frames.len() - clock.cursor
    }

    /// Advances the clock by one row, publishing synthetic books for every
    /// pair present in it. Returns false once the data is exhausted.
    pub fn step_time(&self) -> Result<bool> {
        let frame = {
            let mut clock = self.clock.lock();
            let Some(frame) = clock.frames.get(clock.cursor).cloned() else {
                return Ok(false);
            };
            clock.cursor += 1;
            clock.current = Some(frame.clone());
            frame
        };

        debug!(tick = self.clock.lock().cursor, "replay step");
        let taps = self.book_taps.lock();
        for (ep, point) in &frame {
            if let Some(tap) = taps.get(ep.pair()) {
                let book = OrderBook::from_snapshot(
                    ep.clone(),
                    [BookLevel::new(point.price - self.half_spread, point.volume)],
                    [BookLevel::new(point.price + self.half_spread, point.volume)],
                );
                let _ = tap.send(book);
            }
        }
        Ok(true)
    }
}

impl Exchange for ReplayExchange {
    fn id(&self) -> &str {
        &self.exchange_id
    }

    fn pairs(&self) -> Vec<TradingPair> {
        self.pairs.clone()
    }

    fn book_feed(&self, pair: &TradingPair) -> Result<Feed<OrderBook>> {
        if !self.pairs.contains(pair) {
            return Err(ExchangeError::UnsupportedPair(pair.to_string()).into());
        }
        let mut books = self.books.lock();
        if let Some(feed) = books.get(pair) {
            return Ok(feed.clone());
        }
        let (tx, rx) = unbounded();
        let (feed, runner) = Feed::of(rx);
        self.book_taps.lock().insert(pair.clone(), tx);
        self.thread_manager.attach(
            format!("{}-{pair}-book", self.exchange_id),
            move || runner.run(),
            // Book pumps live for the life of the adapter.
            false,
        )?;
        books.insert(pair.clone(), feed.clone());
        Ok(feed)
    }

    fn frame(&self, pairs: &[TradingPair]) -> Result<Frame> {
        let clock = self.clock.lock();
        let Some(current) = clock.current.as_ref() else {
            anyhow::bail!("replay clock has not been stepped yet");
        };
        let mut frame = Frame::new();
        for pair in pairs {
            let ep = ExchangePair::new(self.exchange_id.as_str(), pair.clone());
            if let Some(point) = current.get(&ep) {
                frame.insert(ep, *point);
            }
        }
        Ok(frame)
    }

    fn balances(&self) -> HashMap<Currency, f64> {
        self.balances.read().clone()
    }

    fn fees(&self) -> Fees {
        self.fees
    }

    /// Immediate synthetic fill at the submitted price.
    fn add_order(&self, request: OrderRequest) -> Result<Order> {
        if !self.pairs.contains(&request.pair) {
            return Err(ExchangeError::UnsupportedPair(request.pair.to_string()).into());
        }
        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        let mut order = Order::new(
            id.to_string(),
            self.exchange_id.as_str(),
            request.pair.clone(),
            request.side,
            request.order_type,
            request.price,
            request.volume,
        )?;

        {
            let mut balances = self.balances.write();
            let signed = match request.side {
                Direction::Buy => request.volume,
                Direction::Sell => -request.volume,
            };
            *balances
                .entry(request.pair.base().clone())
                .or_insert(0.0) += signed;
            *balances
                .entry(request.pair.quote().clone())
                .or_insert(0.0) -= signed * request.price;
        }
        order.transition(OrderStatus::Filled)?;

        info!(
            target: "data",
            pair = %request.pair,
            side = ?request.side,
            price = request.price,
            volume = request.volume,
            "replay fill"
        );
        Ok(order)
    }

    fn cancel_order(&self, order_id: &str) -> Result<()> {
        // Fills are immediate; there is never anything resting to cancel.
        debug!(order_id, "replay cancel is a no-op");
        Ok(())
    }

    fn open_orders(&self) -> Result<Vec<Order>> {
        Ok(Vec::new())
    }
}
