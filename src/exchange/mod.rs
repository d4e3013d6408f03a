//! Exchange adapter boundary.
//!
//! Adapters own their credentials, session state, and I/O worker threads
//! (attached to the [`ThreadManager`](crate::runtime::ThreadManager) they
//! are constructed with). Downstream consumers only see this trait plus the
//! typed feeds it hands out.

pub mod bitfinex;
pub mod replay;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::book::OrderBook;
use crate::models::{Currency, Direction, Fees, Frame, Order, OrderType, TradingPair};
use crate::runtime::Feed;

pub use bitfinex::Bitfinex;
pub use replay::ReplayExchange;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    UnsupportedPair(String),
    Protocol(String),
    Rejected(String),
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::UnsupportedPair(pair) => write!(f, "pair not supported: {pair}"),
            ExchangeError::Protocol(what) => write!(f, "exchange protocol violation: {what}"),
            ExchangeError::Rejected(what) => write!(f, "order rejected: {what}"),
        }
    }
}

impl std::error::Error for ExchangeError {}

/// Parameters for one order submission.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub pair: TradingPair,
    pub side: Direction,
    pub order_type: OrderType,
    pub price: f64,
    pub volume: f64,
    /// Post-only flag; maker pricing when the venue supports it.
    pub maker: bool,
}

/// The narrow surface the trading pipeline relies on from each venue.
pub trait Exchange: Send + Sync {
    fn id(&self) -> &str;

    /// Pairs this adapter can stream and trade.
    fn pairs(&self) -> Vec<TradingPair>;

    /// The live order-book feed for one pair. The first call starts the
    /// underlying stream workers.
    fn book_feed(&self, pair: &TradingPair) -> Result<Feed<OrderBook>>;

    /// Latest price/volume snapshot for the given pairs.
    fn frame(&self, pairs: &[TradingPair]) -> Result<Frame>;

    /// Current balances by currency. Slightly stale by design; written by
    /// the adapter's balance-tracker worker.
    fn balances(&self) -> HashMap<Currency, f64>;

    fn fees(&self) -> Fees;

    fn add_order(&self, request: OrderRequest) -> Result<Order>;

    fn cancel_order(&self, order_id: &str) -> Result<()>;

    fn open_orders(&self) -> Result<Vec<Order>>;
}

/// Shared handle the executor and engine pass around.
pub type ExchangeRef = Arc<dyn Exchange>;
