//! Domain value types shared across the trading pipeline.
//!
//! Currencies, trading pairs, orders, and per-tick price/volume frames.
//! All of these are plain value types with structural equality.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An opaque currency symbol, unique within the process.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

lazy_static::lazy_static! {
    pub static ref USD: Currency = Currency::new("USD");
    pub static ref USDT: Currency = Currency::new("USDT");
    pub static ref BTC: Currency = Currency::new("BTC");
    pub static ref ETH: Currency = Currency::new("ETH");
    pub static ref XRP: Currency = Currency::new("XRP");
    pub static ref LTC: Currency = Currency::new("LTC");
    pub static ref EOS: Currency = Currency::new("EOS");
    pub static ref NEO: Currency = Currency::new("NEO");
    pub static ref STABLECOINS: Vec<Currency> = vec![USD.clone(), USDT.clone()];
}

/// A base/quote trading pair, e.g. `BTC-USD`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TradingPair {
    base: Currency,
    quote: Currency,
}

impl TradingPair {
    /// Base and quote must differ.
    pub fn new(base: Currency, quote: Currency) -> anyhow::Result<Self> {
        if base == quote {
            anyhow::bail!("trading pair base and quote are both {}", base);
        }
        Ok(Self { base, quote })
    }

    pub fn base(&self) -> &Currency {
        &self.base
    }

    pub fn quote(&self) -> &Currency {
        &self.quote
    }
}

impl fmt::Display for TradingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

impl FromStr for TradingPair {
    type Err = anyhow::Error;

    /// Parses the `BASE-QUOTE` form, e.g. `BTC-USD`.
    fn from_str(s: &str) -> anyhow::Result<Self> {
        let mut parts = s.split('-');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(base), Some(quote), None) if !base.is_empty() && !quote.is_empty() => {
                TradingPair::new(Currency::new(base), Currency::new(quote))
            }
            _ => anyhow::bail!("malformed trading pair: {s:?}"),
        }
    }
}

/// A trading pair on a specific exchange; identifies one market-data stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExchangePair {
    exchange_id: String,
    pair: TradingPair,
}

impl ExchangePair {
    pub fn new(exchange_id: impl Into<String>, pair: TradingPair) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            pair,
        }
    }

    pub fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    pub fn pair(&self) -> &TradingPair {
        &self.pair
    }

    pub fn base(&self) -> &Currency {
        self.pair.base()
    }

    pub fn quote(&self) -> &Currency {
        self.pair.quote()
    }
}

impl fmt::Display for ExchangePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.exchange_id, self.pair)
    }
}

impl FromStr for ExchangePair {
    type Err = anyhow::Error;

    /// Parses the `exchange-BASE-QUOTE` form, e.g. `bitfinex-BTC-USD`.
    fn from_str(s: &str) -> anyhow::Result<Self> {
        let mut parts = s.split('-');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(exchange), Some(base), Some(quote), None)
                if !exchange.is_empty() && !base.is_empty() && !quote.is_empty() =>
            {
                Ok(ExchangePair::new(
                    exchange,
                    TradingPair::new(Currency::new(base), Currency::new(quote))?,
                ))
            }
            _ => anyhow::bail!("malformed exchange pair: {s:?}"),
        }
    }
}

/// A standing-order side of the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// A trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// Direction implied by a signed order size.
    pub fn of_size(size: f64) -> Self {
        if size >= 0.0 {
            Direction::Buy
        } else {
            Direction::Sell
        }
    }
}

/// Order fill semantics, translated by each exchange adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Ioc,
    Fok,
}

/// Order lifecycle state. `Open` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Open,
    Cancelled,
    Rejected,
    Filled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OrderStatus::Open)
    }
}

/// An exchange-agnostic order record, created on submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub exchange_id: String,
    pub pair: TradingPair,
    pub side: Direction,
    pub order_type: OrderType,
    pub price: f64,
    pub volume: f64,
    status: OrderStatus,
}

impl Order {
    pub fn new(
        id: impl Into<String>,
        exchange_id: impl Into<String>,
        pair: TradingPair,
        side: Direction,
        order_type: OrderType,
        price: f64,
        volume: f64,
    ) -> anyhow::Result<Self> {
        if price < 0.0 {
            anyhow::bail!("order price {price} is negative");
        }
        if volume <= 0.0 {
            anyhow::bail!("order volume {volume} is not positive");
        }
        Ok(Self {
            id: id.into(),
            exchange_id: exchange_id.into(),
            pair,
            side,
            order_type,
            price,
            volume,
            status: OrderStatus::Open,
        })
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    /// Status moves monotonically: once terminal it never changes again.
    pub fn transition(&mut self, status: OrderStatus) -> anyhow::Result<()> {
        if self.status.is_terminal() && status != self.status {
            anyhow::bail!(
                "order {} already terminal ({:?}), refusing {:?}",
                self.id,
                self.status,
                status
            );
        }
        self.status = status;
        Ok(())
    }
}

/// Last price and volume observed for one exchange pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub price: f64,
    pub volume: f64,
}

/// A per-tick snapshot of prices and volumes across the traded universe.
/// `BTreeMap` keeps column ordering stable from frame to frame.
pub type Frame = BTreeMap<ExchangePair, PricePoint>;

/// Maker/taker fee rates, as fractions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fees {
    pub maker: f64,
    pub taker: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc_usd() -> TradingPair {
        TradingPair::new(BTC.clone(), USD.clone()).unwrap()
    }

    #[test]
    fn test_pair_rejects_same_base_quote() {
        assert!(TradingPair::new(BTC.clone(), BTC.clone()).is_err());
    }

    #[test]
    fn test_pair_roundtrip() {
        let pair: TradingPair = "BTC-USD".parse().unwrap();
        assert_eq!(pair, btc_usd());
        assert_eq!(pair.to_string(), "BTC-USD");
        assert!("BTCUSD".parse::<TradingPair>().is_err());
        assert!("BTC-USD-X".parse::<TradingPair>().is_err());
    }

    #[test]
    fn test_exchange_pair_roundtrip() {
        let ep: ExchangePair = "bitfinex-BTC-USD".parse().unwrap();
        assert_eq!(ep.exchange_id(), "bitfinex");
        assert_eq!(ep.pair(), &btc_usd());
        assert_eq!(ep.to_string(), "bitfinex-BTC-USD");
    }

    #[test]
    fn test_exchange_pair_ordering() {
        let a: ExchangePair = "binance-BTC-USDT".parse().unwrap();
        let b: ExchangePair = "bitfinex-BTC-USD".parse().unwrap();
        let c: ExchangePair = "bitfinex-ETH-USD".parse().unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_order_status_monotonic() {
        let mut order = Order::new(
            "1",
            "bitfinex",
            btc_usd(),
            Direction::Buy,
            OrderType::Ioc,
            100.0,
            1.0,
        )
        .unwrap();
        assert_eq!(order.status(), OrderStatus::Open);
        order.transition(OrderStatus::Filled).unwrap();
        assert!(order.transition(OrderStatus::Cancelled).is_err());
        // Re-asserting the same terminal state is allowed.
        order.transition(OrderStatus::Filled).unwrap();
    }

    #[test]
    fn test_order_validation() {
        assert!(Order::new(
            "1",
            "bitfinex",
            btc_usd(),
            Direction::Buy,
            OrderType::Market,
            100.0,
            0.0
        )
        .is_err());
        assert!(Order::new(
            "1",
            "bitfinex",
            btc_usd(),
            Direction::Sell,
            OrderType::Limit,
            -1.0,
            1.0
        )
        .is_err());
    }
}
