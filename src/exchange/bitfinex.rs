//! The Bitfinex exchange.
//!
//! Credentials come from the `BITFINEX_API_KEY` and `BITFINEX_SECRET`
//! environment variables. Each order-book stream and the wallet tracker run
//! as their own supervised worker threads; workers own a current-thread
//! tokio runtime to drive the websocket, so the process model stays
//! thread-parallel. REST calls (candles, order entry) go through the
//! blocking HTTP client on the calling thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossbeam::channel::{unbounded, Sender};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use sha2::Sha384;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::book::{BookLevel, OrderBook};
use crate::exchange::{Exchange, ExchangeError, OrderRequest};
use crate::models::{
    Currency, Direction, ExchangePair, Fees, Frame, Order, OrderStatus, OrderType, PricePoint,
    TradingPair,
};
use crate::runtime::{Feed, SharedCell, ThreadManager};

pub const BITFINEX_EXCHANGE_ID: &str = "bitfinex";

const PUBLIC_WS_URL: &str = "wss://api-pub.bitfinex.com/ws/2";
const AUTH_WS_URL: &str = "wss://api.bitfinex.com/ws/";
const REST_PUBLIC_URL: &str = "https://api-pub.bitfinex.com";
const REST_TRADING_URL: &str = "https://api.bitfinex.com";

/// Consecutive connection failures tolerated before a stream worker gives
/// up and escalates through the thread manager.
const MAX_CONNECT_FAILURES: u32 = 5;
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

type HmacSha384 = Hmac<Sha384>;

/// Pairs Bitfinex supports, with their wire symbols.
fn symbol_table() -> Vec<(TradingPair, &'static str)> {
    [
        ("BTC-USD", "tBTCUSD"),
        ("ETH-USD", "tETHUSD"),
        ("XRP-USD", "tXRPUSD"),
        ("LTC-USD", "tLTCUSD"),
        ("EOS-USD", "tEOSUSD"),
    ]
    .into_iter()
    .map(|(pair, symbol)| (pair.parse().expect("static pair table"), symbol))
    .collect()
}

pub struct Bitfinex {
    thread_manager: ThreadManager,
    api_key: String,
    api_secret: String,
    http: reqwest::blocking::Client,
    symbols: HashMap<TradingPair, &'static str>,
    fees: Fees,
    books: Mutex<HashMap<TradingPair, Feed<OrderBook>>>,
    book_cells: Mutex<HashMap<TradingPair, SharedCell<Option<OrderBook>>>>,
    last_trades: Arc<RwLock<HashMap<TradingPair, f64>>>,
    balances: Arc<RwLock<HashMap<Currency, f64>>>,
    nonce: AtomicU64,
}

impl Bitfinex {
    /// Reads credentials from the environment, starts the wallet tracker,
    /// and returns the adapter. Missing credentials are a startup error.
    pub fn new(thread_manager: ThreadManager) -> Result<Self> {
        let api_key = std::env::var("BITFINEX_API_KEY")
            .context("BITFINEX_API_KEY is not set")?;
        let api_secret = std::env::var("BITFINEX_SECRET")
            .context("BITFINEX_SECRET is not set")?;

        let adapter = Self {
            thread_manager,
            api_key,
            api_secret,
            http: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .context("building http client")?,
            symbols: symbol_table().into_iter().collect(),
            // TODO: pull the account's actual fee tier from the REST API.
            fees: Fees {
                maker: 0.001,
                taker: 0.002,
            },
            books: Mutex::new(HashMap::new()),
            book_cells: Mutex::new(HashMap::new()),
            last_trades: Arc::new(RwLock::new(HashMap::new())),
            balances: Arc::new(RwLock::new(HashMap::new())),
            nonce: AtomicU64::new(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_micros() as u64,
            ),
        };
        adapter.spawn_balance_tracker()?;
        Ok(adapter)
    }

    fn symbol(&self, pair: &TradingPair) -> Result<&'static str> {
        self.symbols
            .get(pair)
            .copied()
            .ok_or_else(|| ExchangeError::UnsupportedPair(pair.to_string()).into())
    }

    fn next_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::SeqCst)
    }

    /// Wallet state over the authenticated websocket: HMAC-SHA384 over
    /// `AUTH<nonce>`, then a `ws` snapshot followed by `wu` updates,
    /// filtered to the exchange wallet.
    fn spawn_balance_tracker(&self) -> Result<()> {
        let api_key = self.api_key.clone();
        let api_secret = self.api_secret.clone();
        let balances = self.balances.clone();
        self.thread_manager.attach(
            "bitfinex-balances",
            move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context("building balance tracker runtime")?;
                runtime.block_on(track_balances(api_key, api_secret, balances))
            },
            false,
        )
    }

    /// Starts the raw-book stream worker for one pair. The worker owns the
    /// order-id map and publishes an aggregated book after every delta.
    fn spawn_book_stream(&self, pair: &TradingPair, tx: Sender<OrderBook>) -> Result<()> {
        let symbol = self.symbol(pair)?;
        let exchange_pair = ExchangePair::new(BITFINEX_EXCHANGE_ID, pair.clone());
        let last_trades = self.last_trades.clone();
        self.thread_manager.attach(
            format!("bitfinex-{pair}-book"),
            move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context("building book stream runtime")?;
                runtime.block_on(stream_book(symbol, exchange_pair, tx, last_trades))
            },
            false,
        )
    }

    fn signed_v1_post(&self, request_path: &str, mut payload: Value) -> Result<Value> {
        payload["request"] = json!(request_path);
        payload["nonce"] = json!(self.next_nonce().to_string());
        let payload_b64 = BASE64.encode(serde_json::to_vec(&payload)?);
        let mut mac = HmacSha384::new_from_slice(self.api_secret.as_bytes())
            .map_err(|_| anyhow!("invalid API secret length"))?;
        mac.update(payload_b64.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let response = self
            .http
            .post(format!("{REST_TRADING_URL}{request_path}"))
            .header("X-BFX-APIKEY", &self.api_key)
            .header("X-BFX-PAYLOAD", &payload_b64)
            .header("X-BFX-SIGNATURE", &signature)
            .send()
            .with_context(|| format!("posting {request_path}"))?;
        let status = response.status();
        let body: Value = response
            .json()
            .with_context(|| format!("decoding {request_path} response"))?;
        if !status.is_success() {
            return Err(ExchangeError::Rejected(format!("{request_path}: {status} {body}")).into());
        }
        Ok(body)
    }

    /// Most recent 1m candle for a pair, for the frame's volume column.
    fn last_candle_volume(&self, pair: &TradingPair) -> Result<f64> {
        let symbol = self.symbol(pair)?;
        let candle: Vec<Value> = self
            .http
            .get(format!("{REST_PUBLIC_URL}/v2/candles/trade:1m:{symbol}/last"))
            .send()
            .context("fetching last candle")?
            .json()
            .context("decoding last candle")?;
        // [MTS, OPEN, CLOSE, HIGH, LOW, VOLUME]
        candle
            .get(5)
            .and_then(Value::as_f64)
            .ok_or_else(|| ExchangeError::Protocol("candle missing volume".to_string()).into())
    }

    /// Historical 1m close/volume candles, oldest first. Used to warm up
    /// the estimators before live trading starts.
    pub fn candle_history(&self, pair: &TradingPair, limit: usize) -> Result<Vec<(i64, f64, f64)>> {
        let symbol = self.symbol(pair)?;
        let rows: Vec<Vec<Value>> = self
            .http
            .get(format!(
                "{REST_PUBLIC_URL}/v2/candles/trade:1m:{symbol}/hist?limit={limit}&sort=1"
            ))
            .send()
            .context("fetching candle history")?
            .json()
            .context("decoding candle history")?;
        rows.iter()
            .map(|row| {
                let ts = row.get(0).and_then(Value::as_i64);
                let close = row.get(2).and_then(Value::as_f64);
                let volume = row.get(5).and_then(Value::as_f64);
                match (ts, close, volume) {
                    (Some(ts), Some(close), Some(volume)) => Ok((ts, close, volume)),
                    _ => Err(ExchangeError::Protocol("malformed candle row".to_string()).into()),
                }
            })
            .collect()
    }

    /// Warmup frames across pairs, joined on candle timestamp. Only
    /// timestamps with every pair present survive the join.
    pub fn warmup_frames(&self, pairs: &[TradingPair], ticks: usize) -> Result<Vec<Frame>> {
        let mut by_ts: std::collections::BTreeMap<i64, Frame> = std::collections::BTreeMap::new();
        for pair in pairs {
            let ep = ExchangePair::new(BITFINEX_EXCHANGE_ID, pair.clone());
            for (ts, close, volume) in self.candle_history(pair, ticks)? {
                by_ts.entry(ts).or_default().insert(
                    ep.clone(),
                    PricePoint {
                        price: close,
                        volume,
                    },
                );
            }
        }
        Ok(by_ts
            .into_values()
            .filter(|frame| frame.len() == pairs.len())
            .collect())
    }

    fn order_type_code(order_type: OrderType) -> &'static str {
        match order_type {
            OrderType::Market => "exchange market",
            OrderType::Limit => "exchange limit",
            OrderType::Ioc => "exchange immediate-or-cancel",
            OrderType::Fok => "exchange fill-or-kill",
        }
    }

    fn order_type_from_code(code: &str) -> OrderType {
        match code {
            "exchange market" => OrderType::Market,
            "exchange immediate-or-cancel" => OrderType::Ioc,
            "exchange fill-or-kill" => OrderType::Fok,
            _ => OrderType::Limit,
        }
    }

    fn order_from_response(&self, pair: &TradingPair, body: &Value) -> Result<Order> {
        let id = body
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ExchangeError::Protocol("order response missing id".to_string()))?;
        let side = match body.get("side").and_then(Value::as_str) {
            Some("buy") => Direction::Buy,
            Some("sell") => Direction::Sell,
            other => {
                return Err(
                    ExchangeError::Protocol(format!("unexpected order side {other:?}")).into(),
                )
            }
        };
        let price = body
            .get("price")
            .and_then(Value::as_str)
            .and_then(|p| p.parse::<f64>().ok())
            .unwrap_or(0.0);
        let volume = body
            .get("original_amount")
            .and_then(Value::as_str)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| *v > 0.0)
            .ok_or_else(|| {
                ExchangeError::Protocol("order response missing original_amount".to_string())
            })?;
        let order_type = body
            .get("type")
            .and_then(Value::as_str)
            .map(Self::order_type_from_code)
            .unwrap_or(OrderType::Limit);
        let mut order = Order::new(
            id.to_string(),
            BITFINEX_EXCHANGE_ID,
            pair.clone(),
            side,
            order_type,
            price,
            volume,
        )?;
        let is_live = body.get("is_live").and_then(Value::as_bool).unwrap_or(false);
        let is_cancelled = body
            .get("is_cancelled")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if is_cancelled {
            order.transition(OrderStatus::Cancelled)?;
        } else if !is_live {
            order.transition(OrderStatus::Filled)?;
        }
        Ok(order)
    }
}

impl Exchange for Bitfinex {
    fn id(&self) -> &str {
        BITFINEX_EXCHANGE_ID
    }

    fn pairs(&self) -> Vec<TradingPair> {
        self.symbols.keys().cloned().collect()
    }

    fn book_feed(&self, pair: &TradingPair) -> Result<Feed<OrderBook>> {
        let mut books = self.books.lock();
        if let Some(feed) = books.get(pair) {
            return Ok(feed.clone());
        }
        let (tx, rx) = unbounded();
        let (feed, runner) = Feed::of(rx);
        self.spawn_book_stream(pair, tx)?;
        self.thread_manager.attach(
            format!("bitfinex-{pair}-book-pump"),
            move || runner.run(),
            false,
        )?;

        // Keep the latest book in a cell so `frame` can block until the
        // stream is warm.
        let (cell, fold_runner) = feed.fold(|_, book| Some(book), None);
        self.thread_manager.attach(
            format!("bitfinex-{pair}-book-cell"),
            move || fold_runner.run(),
            false,
        )?;
        self.book_cells.lock().insert(pair.clone(), cell);

        books.insert(pair.clone(), feed.clone());
        Ok(feed)
    }

    /// Last trade price (falling back to the book mid) plus most recent
    /// candle volume, per pair. Blocks until each pair's book stream has
    /// produced its first snapshot.
    fn frame(&self, pairs: &[TradingPair]) -> Result<Frame> {
        let mut frame = Frame::new();
        for pair in pairs {
            let cell = self.book_cells.lock().get(pair).cloned();
            let cell = match cell {
                Some(cell) => cell,
                None => {
                    self.book_feed(pair)?;
                    self.book_cells
                        .lock()
                        .get(pair)
                        .cloned()
                        .ok_or_else(|| anyhow!("book cell missing after subscribe"))?
                }
            };
            let book = cell
                .read()
                .ok_or_else(|| anyhow!("book stream for {pair} ended before first snapshot"))?;
            let price = match self.last_trades.read().get(pair) {
                Some(&last) => last,
                None => book
                    .mid()
                    .ok_or_else(|| ExchangeError::Protocol(format!("empty book for {pair}")))?,
            };
            let volume = self.last_candle_volume(pair)?;
            frame.insert(
                ExchangePair::new(BITFINEX_EXCHANGE_ID, pair.clone()),
                PricePoint { price, volume },
            );
        }
        Ok(frame)
    }

    fn balances(&self) -> HashMap<Currency, f64> {
        self.balances.read().clone()
    }

    fn fees(&self) -> Fees {
        self.fees
    }

    fn add_order(&self, request: OrderRequest) -> Result<Order> {
        let symbol = self.symbol(&request.pair)?;
        // The v1 REST API wants the bare symbol without the "t" prefix.
        let payload = json!({
            "symbol": symbol.trim_start_matches('t'),
            "amount": format!("{:.8}", request.volume),
            "price": format!("{:.8}", request.price),
            "exchange": "bitfinex",
            "side": match request.side {
                Direction::Buy => "buy",
                Direction::Sell => "sell",
            },
            "type": Self::order_type_code(request.order_type),
            "is_postonly": request.maker,
        });
        let body = self.signed_v1_post("/v1/order/new", payload)?;
        self.order_from_response(&request.pair, &body)
    }

    fn cancel_order(&self, order_id: &str) -> Result<()> {
        let id: i64 = order_id
            .parse()
            .with_context(|| format!("bitfinex order id {order_id:?} is not numeric"))?;
        self.signed_v1_post("/v1/order/cancel", json!({ "order_id": id }))?;
        Ok(())
    }

    fn open_orders(&self) -> Result<Vec<Order>> {
        let body = self.signed_v1_post("/v1/orders", json!({}))?;
        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::Protocol("orders response not an array".to_string()))?;
        let mut orders = Vec::with_capacity(rows.len());
        for row in rows {
            let symbol = row
                .get("symbol")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_uppercase();
            let Some(pair) = self
                .symbols
                .iter()
                .find(|(_, s)| s.trim_start_matches('t') == symbol)
                .map(|(pair, _)| pair.clone())
            else {
                continue;
            };
            orders.push(self.order_from_response(&pair, row)?);
        }
        Ok(orders)
    }
}

/// One raw-book (R0) websocket session per connection attempt: subscribe,
/// apply the snapshot, then stream deltas. A delta whose price is zero
/// removes that order id (and marks a trade at the removed order's price).
async fn stream_book(
    symbol: &'static str,
    exchange_pair: ExchangePair,
    tx: Sender<OrderBook>,
    last_trades: Arc<RwLock<HashMap<TradingPair, f64>>>,
) -> Result<()> {
    let mut failures = 0u32;
    let mut delay = INITIAL_RECONNECT_DELAY;
    loop {
        match run_book_session(symbol, &exchange_pair, &tx, &last_trades).await {
            Ok(SessionEnd::Resubscribe) => {
                warn!(pair = %exchange_pair, "crossed book, resubscribing for a fresh snapshot");
                failures = 0;
                delay = INITIAL_RECONNECT_DELAY;
            }
            Ok(SessionEnd::ConsumerGone) => return Ok(()),
            Err(e) => {
                failures += 1;
                if failures >= MAX_CONNECT_FAILURES {
                    return Err(e.context(format!(
                        "book stream for {exchange_pair} failed {failures} times"
                    )));
                }
                warn!(pair = %exchange_pair, error = %e, "book stream disconnected; reconnecting");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RECONNECT_DELAY);
            }
        }
    }
}

enum SessionEnd {
    /// The book crossed; caller should reconnect for a fresh snapshot.
    Resubscribe,
    /// All feed consumers are gone; the worker can retire.
    ConsumerGone,
}

async fn run_book_session(
    symbol: &str,
    exchange_pair: &ExchangePair,
    tx: &Sender<OrderBook>,
    last_trades: &RwLock<HashMap<TradingPair, f64>>,
) -> Result<SessionEnd> {
    let (mut ws, _) = connect_async(PUBLIC_WS_URL)
        .await
        .context("connecting public websocket")?;
    ws.send(Message::Text(
        json!({
            "event": "subscribe",
            "channel": "book",
            "symbol": symbol,
            "prec": "R0",
            "len": "100",
        })
        .to_string(),
    ))
    .await
    .context("subscribing to book channel")?;

    let mut channel_id: Option<i64> = None;
    // Raw book state: order id -> (price, signed amount).
    let mut orders: HashMap<i64, (f64, f64)> = HashMap::new();

    while let Some(message) = ws.next().await {
        let message = message.context("reading book stream")?;
        let text = match message {
            Message::Text(text) => text,
            Message::Ping(payload) => {
                ws.send(Message::Pong(payload)).await.ok();
                continue;
            }
            Message::Close(frame) => {
                return Err(anyhow!("book stream closed: {frame:?}"));
            }
            _ => continue,
        };
        let value: Value = serde_json::from_str(&text).context("parsing book message")?;

        match &value {
            Value::Object(event) => {
                match event.get("event").and_then(Value::as_str) {
                    Some("subscribed") => {
                        channel_id = event.get("chanId").and_then(Value::as_i64);
                        debug!(pair = %exchange_pair, channel = ?channel_id, "book subscribed");
                    }
                    Some("error") => {
                        return Err(anyhow!("subscription error: {event:?}"));
                    }
                    _ => {}
                }
                continue;
            }
            Value::Array(parts) => {
                let Some(chan) = parts.first().and_then(Value::as_i64) else {
                    continue;
                };
                if Some(chan) != channel_id {
                    continue;
                }
                match parts.get(1) {
                    // Heartbeat.
                    Some(Value::String(s)) if s == "hb" => continue,
                    // Snapshot: an array of raw orders.
                    Some(Value::Array(rows))
                        if rows.first().map_or(false, Value::is_array) =>
                    {
                        orders.clear();
                        for row in rows {
                            if let Some((id, price, amount)) = parse_raw_order(row) {
                                orders.insert(id, (price, amount));
                            }
                        }
                    }
                    // Delta: a single raw order.
                    Some(Value::Array(_)) => {
                        let Some((id, price, amount)) = parse_raw_order(&parts[1]) else {
                            continue;
                        };
                        if price == 0.0 {
                            if let Some((removed_price, _)) = orders.remove(&id) {
                                last_trades
                                    .write()
                                    .insert(exchange_pair.pair().clone(), removed_price);
                            }
                        } else {
                            orders.insert(id, (price, amount));
                        }
                    }
                    _ => continue,
                }

                let book = aggregate_book(exchange_pair.clone(), &orders);
                if book.needs_reset() {
                    return Ok(SessionEnd::Resubscribe);
                }
                info!(
                    target: "data",
                    pair = %exchange_pair,
                    bid = ?book.best_bid().map(|l| l.price),
                    ask = ?book.best_ask().map(|l| l.price),
                    "book update"
                );
                if tx.send(book).is_err() {
                    return Ok(SessionEnd::ConsumerGone);
                }
            }
            _ => continue,
        }
    }
    Err(anyhow!("book stream ended"))
}

fn parse_raw_order(row: &Value) -> Option<(i64, f64, f64)> {
    let row = row.as_array()?;
    Some((
        row.first()?.as_i64()?,
        row.get(1)?.as_f64()?,
        row.get(2)?.as_f64()?,
    ))
}

/// Folds the raw order map into per-price levels. Positive amounts are
/// bids, negative are asks.
fn aggregate_book(exchange_pair: ExchangePair, orders: &HashMap<i64, (f64, f64)>) -> OrderBook {
    let mut bid_levels: HashMap<u64, (f64, f64)> = HashMap::new();
    let mut ask_levels: HashMap<u64, (f64, f64)> = HashMap::new();
    for &(price, amount) in orders.values() {
        let levels = if amount > 0.0 {
            &mut bid_levels
        } else {
            &mut ask_levels
        };
        let entry = levels.entry(price.to_bits()).or_insert((price, 0.0));
        entry.1 += amount.abs();
    }
    OrderBook::from_snapshot(
        exchange_pair,
        bid_levels.into_values().map(|(p, s)| BookLevel::new(p, s)),
        ask_levels.into_values().map(|(p, s)| BookLevel::new(p, s)),
    )
}

/// Authenticated wallet stream: signs `AUTH<nonce>` with HMAC-SHA384 and
/// keeps the exchange-wallet balances current.
async fn track_balances(
    api_key: String,
    api_secret: String,
    balances: Arc<RwLock<HashMap<Currency, f64>>>,
) -> Result<()> {
    let mut failures = 0u32;
    let mut delay = INITIAL_RECONNECT_DELAY;
    loop {
        match run_balance_session(&api_key, &api_secret, &balances).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                failures += 1;
                if failures >= MAX_CONNECT_FAILURES {
                    return Err(e.context(format!("balance stream failed {failures} times")));
                }
                warn!(error = %e, "balance stream disconnected; reconnecting");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RECONNECT_DELAY);
            }
        }
    }
}

async fn run_balance_session(
    api_key: &str,
    api_secret: &str,
    balances: &RwLock<HashMap<Currency, f64>>,
) -> Result<()> {
    let (mut ws, _) = connect_async(AUTH_WS_URL)
        .await
        .context("connecting authenticated websocket")?;

    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    let auth_payload = format!("AUTH{nonce}");
    let mut mac = HmacSha384::new_from_slice(api_secret.as_bytes())
        .map_err(|_| anyhow!("invalid API secret length"))?;
    mac.update(auth_payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    ws.send(Message::Text(
        json!({
            "apiKey": api_key,
            "event": "auth",
            "authPayload": auth_payload,
            "authNonce": nonce,
            "authSig": signature,
            "filter": ["wallet"],
        })
        .to_string(),
    ))
    .await
    .context("sending auth payload")?;

    let mut channel_id: Option<i64> = None;
    while let Some(message) = ws.next().await {
        let message = message.context("reading balance stream")?;
        let text = match message {
            Message::Text(text) => text,
            Message::Ping(payload) => {
                ws.send(Message::Pong(payload)).await.ok();
                continue;
            }
            Message::Close(frame) => return Err(anyhow!("balance stream closed: {frame:?}")),
            _ => continue,
        };
        let value: Value = serde_json::from_str(&text).context("parsing balance message")?;

        match &value {
            Value::Object(event) => match event.get("event").and_then(Value::as_str) {
                Some("auth") => {
                    channel_id = event.get("chanId").and_then(Value::as_i64);
                    info!("bitfinex wallet stream authenticated");
                }
                Some("error") => return Err(anyhow!("auth error: {event:?}")),
                _ => {}
            },
            Value::Array(parts) => {
                let Some(chan) = parts.first().and_then(Value::as_i64) else {
                    continue;
                };
                if Some(chan) != channel_id {
                    continue;
                }
                match parts.get(1).and_then(Value::as_str) {
                    // Wallet snapshot.
                    Some("ws") => {
                        if let Some(rows) = parts.get(2).and_then(Value::as_array) {
                            let mut balances = balances.write();
                            for row in rows {
                                apply_wallet_update(&mut balances, row);
                            }
                        }
                    }
                    // Single wallet update.
                    Some("wu") => {
                        if let Some(row) = parts.get(2) {
                            apply_wallet_update(&mut balances.write(), row);
                        }
                    }
                    _ => continue,
                }
            }
            _ => continue,
        }
    }
    Err(anyhow!("balance stream ended"))
}

/// Only the exchange (trading) wallet is tracked.
fn apply_wallet_update(balances: &mut HashMap<Currency, f64>, row: &Value) {
    let Some(row) = row.as_array() else {
        return;
    };
    if row.first().and_then(Value::as_str) != Some("exchange") {
        return;
    }
    let (Some(currency), Some(amount)) = (
        row.get(1).and_then(Value::as_str),
        row.get(2).and_then(Value::as_f64),
    ) else {
        return;
    };
    info!(target: "data", currency, amount, "balance update");
    balances.insert(Currency::new(currency), amount);
}
