// ===============================
// src/policy.rs
// ===============================
//
// Pre-trade rules: turn strategy signals into concrete orders.
//
// Closing exposure (selling a long on exit, covering a short on exit) is always
// allowed and never sized. Opening or adding exposure is gated by the config and by
// the buying power left in this step.
//
use tracing::debug;

use crate::domain::{Account, Event, Order, Position, Signal};
use crate::error::{EngineError, Result};
use crate::metrics::{Component, MetricResults, ORDERS};

pub trait Policy: Component + Send {
    fn act(&mut self, signals: &[Signal], account: &Account, event: &Event) -> Result<Vec<Order>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyConfig {
    /// Minimum notional (base currency) for new exposure.
    pub min_amount: f64,
    /// Maximum notional (base currency) per signal.
    pub max_amount: f64,
    pub shorting: bool,
    pub increase_position: bool,
    pub one_order_per_asset: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_amount: 5_000.0,
            max_amount: 20_000.0,
            shorting: false,
            increase_position: false,
            one_order_per_asset: true,
        }
    }
}

/// Default rule set.
#[derive(Debug)]
pub struct FlexPolicy {
    cfg: PolicyConfig,
    next_id: u64,
    recorded: MetricResults,
}

impl FlexPolicy {
    pub fn new(cfg: PolicyConfig) -> Result<Self> {
        if cfg.min_amount < 0.0 || cfg.max_amount < 0.0 {
            return Err(EngineError::Configuration("policy amounts must be >= 0".into()));
        }
        if cfg.min_amount > cfg.max_amount {
            return Err(EngineError::Configuration(format!(
                "min_amount ({}) > max_amount ({})",
                cfg.min_amount, cfg.max_amount
            )));
        }
        Ok(Self { cfg, next_id: 1, recorded: MetricResults::new() })
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.cfg
    }

    fn order(&mut self, signal: &Signal, size: f64) -> Order {
        let id = self.next_id;
        self.next_id += 1;
        Order::market(id, signal.asset.clone(), size)
    }

    /// Whole units affordable for `amount` (base currency) at `price` (asset currency).
    fn units(account: &Account, signal: &Signal, amount: f64, price: f64) -> f64 {
        let unit_cost = account.convert(price, &signal.asset.currency);
        if unit_cost <= 0.0 {
            return 0.0;
        }
        (amount / unit_cost).floor()
    }

    fn sell(&mut self, signal: &Signal, pos: &Position, account: &Account, amount: f64, price: f64) -> Option<Order> {
        if pos.is_long() {
            // only an exit may sell against a long, and then it liquidates
            return signal.exit.then(|| self.order(signal, -pos.size));
        }
        if !signal.entry || !self.cfg.shorting {
            return None;
        }
        if pos.is_short() && !self.cfg.increase_position {
            return None;
        }
        if amount < self.cfg.min_amount {
            return None;
        }
        let units = Self::units(account, signal, amount, price);
        (units > 0.0).then(|| self.order(signal, -units))
    }

    fn buy(&mut self, signal: &Signal, pos: &Position, account: &Account, amount: f64, price: f64) -> Option<Order> {
        if pos.is_long() && !self.cfg.increase_position {
            return None;
        }
        if pos.is_short() {
            // only an exit may buy against a short, and then it covers
            return signal.exit.then(|| self.order(signal, -pos.size));
        }
        if !signal.entry || amount < self.cfg.min_amount {
            return None;
        }
        let units = Self::units(account, signal, amount, price);
        (units > 0.0).then(|| self.order(signal, units))
    }

    /// Buying power consumed by `order`. Orders that shrink the position cost nothing.
    fn cost(account: &Account, pos: &Position, order: &Order, price: f64) -> f64 {
        if pos.size * order.size < 0.0 {
            return 0.0;
        }
        account.convert(order.size.abs() * price, &order.asset.currency)
    }
}

impl Component for FlexPolicy {
    fn reset(&mut self) {
        self.recorded.clear();
    }

    fn get_metrics(&mut self) -> MetricResults {
        std::mem::take(&mut self.recorded)
    }
}

impl Policy for FlexPolicy {
    fn act(&mut self, signals: &[Signal], account: &Account, event: &Event) -> Result<Vec<Order>> {
        if signals.is_empty() {
            return Ok(Vec::new());
        }

        let mut buying_power = account.buying_power;
        let mut orders = Vec::new();

        for signal in signals {
            // open orders of the snapshot only; orders made in this call are not open yet
            if self.cfg.one_order_per_asset && account.has_open_order(&signal.asset) {
                continue;
            }
            let Some(price) = event.price(&signal.asset) else {
                debug!(asset = %signal.asset, "no price, signal skipped");
                continue;
            };
            let amount = self.cfg.max_amount.min(buying_power).max(0.0);
            let pos = account.position(&signal.asset);

            let order = if signal.rating < 0.0 {
                self.sell(signal, &pos, account, amount, price)
            } else if signal.rating > 0.0 {
                self.buy(signal, &pos, account, amount, price)
            } else {
                None
            };

            if let Some(order) = order {
                buying_power -= Self::cost(account, &pos, &order, price);
                orders.push(order);
            }
        }

        self.recorded.insert("policy.signals".into(), signals.len() as f64);
        self.recorded.insert("policy.orders".into(), orders.len() as f64);
        ORDERS.inc_by(orders.len() as u64);
        Ok(orders)
    }
}
