// ===============================
// src/broker.rs
// ===============================
//
// Execution side of a step: the broker takes the orders decided on the previous
// step plus the new event, and returns a fresh Account snapshot.
//
// SimBroker is a minimal in-process simulator:
// - market orders fill at the event price of their asset
// - limit orders fill when the event price crosses the limit
// - Ioc orders not filled on their first step are cancelled
// - orders for assets without a price in the event stay open
//
use ahash::AHashMap as HashMap;
use tracing::{debug, warn};

use crate::domain::{Account, Asset, Event, Order, OrderType, Position, Tif, Timestamp};
use crate::error::{EngineError, Result};
use crate::metrics::{Component, MetricResults};

pub trait Broker: Component + Send {
    /// Accept new orders, process them against `event` and report the account.
    fn place(&mut self, orders: Vec<Order>, event: &Event) -> Result<Account>;
}

pub struct SimBroker {
    base_currency: String,
    initial_cash: f64,
    rates: HashMap<String, f64>,
    cash: f64,
    positions: HashMap<Asset, Position>,
    open: Vec<Order>,
    time: Option<Timestamp>,
    fills: u64,
    realized_pnl: f64,
}

impl SimBroker {
    pub fn new(base_currency: impl Into<String>, initial_cash: f64) -> Self {
        Self {
            base_currency: base_currency.into(),
            initial_cash,
            rates: HashMap::new(),
            cash: initial_cash,
            positions: HashMap::new(),
            open: Vec::new(),
            time: None,
            fills: 0,
            realized_pnl: 0.0,
        }
    }

    /// Fixed conversion rate: units of base currency per unit of `currency`.
    pub fn with_rate(mut self, currency: impl Into<String>, rate: f64) -> Self {
        self.rates.insert(currency.into(), rate);
        self
    }

    fn convert(&self, amount: f64, currency: &str) -> f64 {
        if currency == self.base_currency {
            return amount;
        }
        amount * self.rates.get(currency).copied().unwrap_or(1.0)
    }

    fn fill_price(order: &Order, price: f64) -> Option<f64> {
        match order.order_type {
            OrderType::Market => Some(price),
            OrderType::Limit { limit } if order.is_buy() && price <= limit => Some(price),
            OrderType::Limit { limit } if !order.is_buy() && price >= limit => Some(price),
            OrderType::Limit { .. } => None,
        }
    }

    fn on_fill(&mut self, order: &Order, px: f64) {
        let cost = self.convert(order.size * px, &order.asset.currency);
        self.cash -= cost;
        self.fills += 1;

        let pos = self
            .positions
            .entry(order.asset.clone())
            .or_insert_with(|| Position::flat(order.asset.clone()));
        let prev = pos.size;
        let new_size = prev + order.size;

        if prev == 0.0 || prev.signum() == order.size.signum() {
            // same direction -> blend average cost
            pos.avg_price = (pos.avg_price * prev.abs() + px * order.size.abs()) / (prev.abs() + order.size.abs());
        } else {
            // opposite direction -> realize PnL on the closed part
            let closed = order.size.abs().min(prev.abs());
            let pnl = (px - pos.avg_price) * if prev > 0.0 { closed } else { -closed };
            self.realized_pnl += pnl;
            if new_size == 0.0 {
                pos.avg_price = 0.0;
            } else if new_size.signum() != prev.signum() {
                // flipped through flat
                pos.avg_price = px;
            }
        }
        pos.size = new_size;
        pos.mkt_price = px;
        debug!(asset = %order.asset, size = order.size, px, "filled");
    }

    fn account(&self) -> Account {
        let mut acc = Account::new(self.base_currency.clone(), self.cash);
        acc.time = self.time;
        acc.buying_power = self.cash.max(0.0);
        acc.portfolio = self
            .positions
            .iter()
            .filter(|(_, p)| !p.is_flat())
            .map(|(a, p)| (a.clone(), p.clone()))
            .collect();
        acc.open_orders = self.open.clone();
        acc.rates = self.rates.clone();
        acc
    }
}

impl Component for SimBroker {
    fn reset(&mut self) {
        self.cash = self.initial_cash;
        self.positions.clear();
        self.open.clear();
        self.time = None;
        self.fills = 0;
        self.realized_pnl = 0.0;
    }

    fn get_metrics(&mut self) -> MetricResults {
        let mut out = MetricResults::new();
        out.insert("broker.fills".into(), std::mem::take(&mut self.fills) as f64);
        out.insert("broker.realized_pnl".into(), self.realized_pnl);
        out
    }
}

impl Broker for SimBroker {
    fn place(&mut self, orders: Vec<Order>, event: &Event) -> Result<Account> {
        if let Some(bad) = orders.iter().find(|o| !o.size.is_finite()) {
            return Err(EngineError::Broker(format!("order {} has invalid size {}", bad.id, bad.size)));
        }
        for o in orders {
            if o.size == 0.0 {
                warn!(id = o.id, asset = %o.asset, "zero size order rejected");
                continue;
            }
            self.open.push(o);
        }
        self.time = Some(event.time);

        let prices = event.prices();
        let pending = std::mem::take(&mut self.open);
        for order in pending {
            match prices.get(&order.asset).and_then(|px| Self::fill_price(&order, *px)) {
                Some(px) => self.on_fill(&order, px),
                None if order.tif == Tif::Ioc => debug!(id = order.id, "ioc order cancelled"),
                None => self.open.push(order),
            }
        }

        for (asset, px) in prices {
            if let Some(pos) = self.positions.get_mut(&asset) {
                pos.mkt_price = px;
            }
        }
        Ok(self.account())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PriceItem;
    use chrono::Utc;

    fn x() -> Asset {
        Asset::new("X", "USD")
    }

    fn at(px: f64) -> Event {
        Event::new(Utc::now(), vec![PriceItem::Trade { asset: x(), price: px, volume: 1.0 }])
    }

    #[test]
    fn market_order_fills_and_updates_cash() {
        let mut b = SimBroker::new("USD", 10_000.0);
        let acc = b.place(vec![Order::market(1, x(), 10.0)], &at(50.0)).unwrap();
        assert_eq!(acc.cash, 9_500.0);
        assert_eq!(acc.buying_power, 9_500.0);
        assert_eq!(acc.position(&x()).size, 10.0);
        assert!(acc.open_orders.is_empty());
        assert_eq!(acc.equity(), 10_000.0);
    }

    #[test]
    fn liquidation_realizes_pnl() {
        let mut b = SimBroker::new("USD", 10_000.0);
        b.place(vec![Order::market(1, x(), 10.0)], &at(50.0)).unwrap();
        let acc = b.place(vec![Order::market(2, x(), -10.0)], &at(60.0)).unwrap();
        assert!(acc.position(&x()).is_flat());
        assert_eq!(acc.cash, 10_100.0);
        let m = b.get_metrics();
        assert_eq!(m["broker.fills"], 2.0);
        assert_eq!(m["broker.realized_pnl"], 100.0);
    }

    #[test]
    fn orders_without_price_stay_open_unless_ioc() {
        let mut b = SimBroker::new("USD", 10_000.0);
        let mut ioc = Order::market(2, x(), 1.0);
        ioc.tif = Tif::Ioc;
        let acc = b.place(vec![Order::market(1, x(), 1.0), ioc], &Event::empty(Utc::now())).unwrap();
        assert_eq!(acc.open_orders.len(), 1);
        assert!(acc.has_open_order(&x()));

        let acc = b.place(vec![], &at(10.0)).unwrap();
        assert!(acc.open_orders.is_empty());
        assert_eq!(acc.position(&x()).size, 1.0);
    }

    #[test]
    fn limit_order_waits_for_price() {
        let mut b = SimBroker::new("USD", 10_000.0);
        let mut o = Order::market(1, x(), 5.0);
        o.order_type = OrderType::Limit { limit: 95.0 };
        assert_eq!(b.place(vec![o], &at(100.0)).unwrap().open_orders.len(), 1);
        let acc = b.place(vec![], &at(94.0)).unwrap();
        assert_eq!(acc.position(&x()).size, 5.0);
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut b = SimBroker::new("USD", 1_000.0);
        b.place(vec![Order::market(1, x(), 1.0)], &at(10.0)).unwrap();
        b.reset();
        let acc = b.place(vec![], &Event::empty(Utc::now())).unwrap();
        assert_eq!(acc.cash, 1_000.0);
        assert!(acc.portfolio.is_empty());
    }
}
