//! Order reconciliation against live books.
//!
//! The executor owns the exchange set and the execution strategy. Each
//! `tick_fairs` gathers the freshest view per exchange (latest books,
//! balances, fees), sizes the whole universe in one strategy pass, and
//! submits the non-negligible orders. Positions always come from the
//! adapters' balance state, never from locally assumed fills.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use nalgebra::DVector;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::book::OrderBook;
use crate::exchange::{ExchangeRef, OrderRequest};
use crate::math::Gaussian;
use crate::models::{Direction, ExchangePair, Order, OrderType, TradingPair};
use crate::strategy::ExecutionStrategy;

/// Orders smaller than this are noise from the sizing math, not intents.
const MIN_ORDER_VOLUME: f64 = 1e-9;

pub struct Executor {
    exchanges: Vec<(ExchangeRef, Vec<TradingPair>)>,
    universe: Vec<ExchangePair>,
    strategy: Mutex<ExecutionStrategy>,
    books: Arc<RwLock<HashMap<ExchangePair, OrderBook>>>,
    submitted: Mutex<Vec<Order>>,
}

impl Executor {
    /// Builds the executor and subscribes to every pair's book feed. The
    /// strategy must have been constructed over the same universe, in the
    /// same (exchange, pair) order.
    pub fn new(
        exchanges: Vec<(ExchangeRef, Vec<TradingPair>)>,
        strategy: ExecutionStrategy,
    ) -> Result<Self> {
        let universe: Vec<ExchangePair> = exchanges
            .iter()
            .flat_map(|(exchange, pairs)| {
                pairs
                    .iter()
                    .map(|pair| ExchangePair::new(exchange.id(), pair.clone()))
            })
            .collect();
        if strategy.pairs() != universe.as_slice() {
            anyhow::bail!(
                "execution strategy universe does not match executor universe ({:?} vs {:?})",
                strategy.pairs(),
                universe
            );
        }

        let books: Arc<RwLock<HashMap<ExchangePair, OrderBook>>> =
            Arc::new(RwLock::new(HashMap::new()));
        for (exchange, pairs) in &exchanges {
            for pair in pairs {
                let feed = exchange
                    .book_feed(pair)
                    .with_context(|| format!("book feed for {}-{pair}", exchange.id()))?;
                let sink = books.clone();
                feed.subscribe(move |book: OrderBook| {
                    sink.write().insert(book.exchange_pair().clone(), book);
                });
            }
        }

        Ok(Self {
            exchanges,
            universe,
            strategy: Mutex::new(strategy),
            books,
            submitted: Mutex::new(Vec::new()),
        })
    }

    pub fn universe(&self) -> &[ExchangePair] {
        &self.universe
    }

    /// Orders submitted so far (terminal and open), oldest first.
    pub fn submitted(&self) -> Vec<Order> {
        self.submitted.lock().clone()
    }

    /// Best bid/ask per universe entry, falling back to the last frame
    /// price on both sides when a book has not arrived yet.
    fn quotes(&self) -> Result<(DVector<f64>, DVector<f64>)> {
        let books = self.books.read();
        let mut bids = DVector::zeros(self.universe.len());
        let mut asks = DVector::zeros(self.universe.len());
        let mut missing: HashMap<String, Vec<TradingPair>> = HashMap::new();
        for (i, ep) in self.universe.iter().enumerate() {
            let quoted = books.get(ep).and_then(|book| {
                match (book.best_bid(), book.best_ask()) {
                    (Some(bid), Some(ask)) => Some((bid.price, ask.price)),
                    _ => None,
                }
            });
            match quoted {
                Some((bid, ask)) => {
                    bids[i] = bid;
                    asks[i] = ask;
                }
                None => {
                    missing
                        .entry(ep.exchange_id().to_string())
                        .or_default()
                        .push(ep.pair().clone());
                }
            }
        }
        drop(books);

        if !missing.is_empty() {
            for (exchange, _) in &self.exchanges {
                let Some(pairs) = missing.get(exchange.id()) else {
                    continue;
                };
                let frame = exchange.frame(pairs)?;
                for (ep, point) in frame {
                    if let Some(i) = self.universe.iter().position(|u| u == &ep) {
                        bids[i] = point.price;
                        asks[i] = point.price;
                    }
                }
            }
        }
        Ok((bids, asks))
    }

    /// Base-currency positions per universe entry, read from the owning
    /// adapter's balances.
    fn positions(&self) -> DVector<f64> {
        let mut positions = DVector::zeros(self.universe.len());
        for (exchange, _) in &self.exchanges {
            let balances = exchange.balances();
            for (i, ep) in self.universe.iter().enumerate() {
                if ep.exchange_id() == exchange.id() {
                    positions[i] = balances.get(ep.base()).copied().unwrap_or(0.0);
                }
            }
        }
        positions
    }

    /// One reconciliation pass against the given joint fair estimate.
    /// Submission failures are logged and skipped; the next beat
    /// re-evaluates from fresh state.
    pub fn tick_fairs(&self, fairs: &Gaussian) -> Result<()> {
        let (bids, asks) = self.quotes()?;
        let positions = self.positions();

        // The strategy sizes the whole universe in one pass and takes a
        // single taker rate: the most conservative across the venues
        // involved.
        let fees = self
            .exchanges
            .iter()
            .map(|(exchange, _)| exchange.fees().taker)
            .fold(0.0, f64::max);

        let orders = self
            .strategy
            .lock()
            .tick(&positions, &bids, &asks, fairs, fees)?;

        for (i, ep) in self.universe.iter().enumerate() {
            let size = orders[i];
            if size.abs() < MIN_ORDER_VOLUME {
                continue;
            }
            let side = Direction::of_size(size);
            let price = match side {
                Direction::Buy => asks[i],
                Direction::Sell => bids[i],
            };
            let Some((exchange, _)) = self
                .exchanges
                .iter()
                .find(|(exchange, _)| exchange.id() == ep.exchange_id())
            else {
                continue;
            };
            let request = OrderRequest {
                pair: ep.pair().clone(),
                side,
                order_type: OrderType::Ioc,
                price,
                volume: size.abs(),
                maker: false,
            };
            match exchange.add_order(request) {
                Ok(order) => {
                    info!(
                        target: "data",
                        pair = %ep,
                        side = ?side,
                        price,
                        volume = size.abs(),
                        order_id = %order.id,
                        status = ?order.status(),
                        "order placed"
                    );
                    self.submitted.lock().push(order);
                }
                Err(e) => {
                    warn!(pair = %ep, error = %e, "order submission failed, skipping");
                }
            }
        }
        Ok(())
    }
}
