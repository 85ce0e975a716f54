// ===============================
// src/domain.rs
// ===============================
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Timestamp = DateTime<Utc>;

// ---- Assets & market data ----

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: String,
    pub currency: String,
}

impl Asset {
    pub fn new(symbol: impl Into<String>, currency: impl Into<String>) -> Self {
        Self { symbol: symbol.into(), currency: currency.into() }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol)
    }
}

/// One observation about an asset carried inside an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PriceItem {
    Quote { asset: Asset, bid: f64, ask: f64 },
    Trade { asset: Asset, price: f64, volume: f64 },
    Bar { asset: Asset, open: f64, high: f64, low: f64, close: f64, volume: f64 },
}

impl PriceItem {
    pub fn asset(&self) -> &Asset {
        match self {
            PriceItem::Quote { asset, .. } => asset,
            PriceItem::Trade { asset, .. } => asset,
            PriceItem::Bar { asset, .. } => asset,
        }
    }

    /// Reference price: mid for quotes, last for trades, close for bars.
    pub fn price(&self) -> f64 {
        match self {
            PriceItem::Quote { bid, ask, .. } => (bid + ask) / 2.0,
            PriceItem::Trade { price, .. } => *price,
            PriceItem::Bar { close, .. } => *close,
        }
    }
}

/// Immutable bundle of observations sharing one timestamp. An empty event is a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub time: Timestamp,
    pub items: Vec<PriceItem>,
}

impl Event {
    pub fn new(time: Timestamp, items: Vec<PriceItem>) -> Self {
        Self { time, items }
    }

    pub fn empty(time: Timestamp) -> Self {
        Self { time, items: Vec::new() }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.items.is_empty()
    }

    pub fn price(&self, asset: &Asset) -> Option<f64> {
        self.items.iter().find(|i| i.asset() == asset).map(|i| i.price())
    }

    pub fn prices(&self) -> HashMap<Asset, f64> {
        let mut out = HashMap::new();
        for item in &self.items {
            out.entry(item.asset().clone()).or_insert_with(|| item.price());
        }
        out
    }
}

// ---- Timeframe ----

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeframe {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Timeframe {
    pub const INFINITE: Timeframe = Timeframe { start: DateTime::<Utc>::MIN_UTC, end: DateTime::<Utc>::MAX_UTC };

    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Timeframe starting now and lasting `duration`.
    pub fn next(duration: Duration) -> Self {
        let now = Utc::now();
        Self { start: now, end: now + duration }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, time: Timestamp) -> bool {
        time >= self.start && time < self.end
    }

    pub fn overlaps(&self, other: &Timeframe) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Intersection of both timeframes; may be empty.
    pub fn intersect(&self, other: &Timeframe) -> Timeframe {
        Timeframe { start: self.start.max(other.start), end: self.end.min(other.end) }
    }

    pub fn duration(&self) -> Duration {
        if self.is_empty() { Duration::zero() } else { self.end - self.start }
    }

    /// Split into a leading and trailing part; `ratio` is the trailing share (0..1).
    /// The trailing part is typically used as a validation timeframe.
    pub fn split(&self, ratio: f64) -> (Timeframe, Timeframe) {
        let ratio = ratio.clamp(0.0, 1.0);
        let total_ms = self.duration().num_milliseconds() as f64;
        let tail = Duration::milliseconds((total_ms * ratio).round() as i64);
        let border = self.end - tail;
        (Timeframe::new(self.start, border), Timeframe::new(border, self.end))
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} - {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

// ---- Signals, orders, positions ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub asset: Asset,
    /// Positive = buy bias, negative = sell bias.
    pub rating: f64,
    pub entry: bool,
    pub exit: bool,
}

impl Signal {
    pub fn new(asset: Asset, rating: f64) -> Self {
        Self { asset, rating, entry: true, exit: true }
    }

    pub fn entry_only(asset: Asset, rating: f64) -> Self {
        Self { asset, rating, entry: true, exit: false }
    }

    pub fn exit_only(asset: Asset, rating: f64) -> Self {
        Self { asset, rating, entry: false, exit: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit { limit: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tif {
    /// Good till cancelled.
    Gtc,
    /// Immediate or cancel: dropped if not filled on the step it is placed.
    Ioc,
}

/// Signed order: positive size buys, negative size sells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub asset: Asset,
    pub size: f64,
    pub order_type: OrderType,
    pub tif: Tif,
}

impl Order {
    pub fn market(id: u64, asset: Asset, size: f64) -> Self {
        Self { id, asset, size, order_type: OrderType::Market, tif: Tif::Gtc }
    }

    pub fn is_buy(&self) -> bool {
        self.size > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub asset: Asset,
    pub size: f64,
    pub avg_price: f64,
    pub mkt_price: f64,
}

impl Position {
    pub fn flat(asset: Asset) -> Self {
        Self { asset, size: 0.0, avg_price: 0.0, mkt_price: 0.0 }
    }

    pub fn is_long(&self) -> bool {
        self.size > 0.0
    }

    pub fn is_short(&self) -> bool {
        self.size < 0.0
    }

    pub fn is_flat(&self) -> bool {
        self.size == 0.0
    }

    pub fn market_value(&self) -> f64 {
        self.size * self.mkt_price
    }
}

// ---- Account ----

/// Snapshot produced by the broker once per step. Readers never mutate it.
#[derive(Debug, Clone)]
pub struct Account {
    pub base_currency: String,
    pub time: Option<Timestamp>,
    pub cash: f64,
    pub buying_power: f64,
    pub portfolio: HashMap<Asset, Position>,
    pub open_orders: Vec<Order>,
    /// Units of base currency per unit of foreign currency.
    pub rates: HashMap<String, f64>,
}

impl Account {
    pub fn new(base_currency: impl Into<String>, cash: f64) -> Self {
        Self {
            base_currency: base_currency.into(),
            time: None,
            cash,
            buying_power: cash,
            portfolio: HashMap::new(),
            open_orders: Vec::new(),
            rates: HashMap::new(),
        }
    }

    /// Position for `asset`, flat if none is held.
    pub fn position(&self, asset: &Asset) -> Position {
        self.portfolio.get(asset).cloned().unwrap_or_else(|| Position::flat(asset.clone()))
    }

    pub fn has_open_order(&self, asset: &Asset) -> bool {
        self.open_orders.iter().any(|o| &o.asset == asset)
    }

    /// Convert an amount in `currency` into the base currency. Unknown currencies convert 1:1.
    pub fn convert(&self, amount: f64, currency: &str) -> f64 {
        if currency == self.base_currency {
            return amount;
        }
        amount * self.rates.get(currency).copied().unwrap_or(1.0)
    }

    /// Cash plus market value of all positions, in base currency.
    pub fn equity(&self) -> f64 {
        let positions: f64 = self
            .portfolio
            .values()
            .map(|p| self.convert(p.market_value(), &p.asset.currency))
            .sum();
        self.cash + positions
    }
}

// ---- Run bookkeeping ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Main,
    Validate,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Main => "main",
            Phase::Validate => "validate",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run: String,
    pub episode: u32,
    pub step: u64,
    pub time: Option<Timestamp>,
    pub timeframe: Timeframe,
    pub phase: Phase,
}

impl RunInfo {
    pub fn new(run: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            episode: 0,
            step: 0,
            time: None,
            timeframe: Timeframe::INFINITE,
            phase: Phase::Main,
        }
    }
}
