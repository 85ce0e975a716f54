// ===============================
// src/metrics.rs
// ===============================
//
// Two kinds of metrics live here:
// - Run metrics: the `Metric` trait, evaluated by the runner every step against the
//   fresh Account/Event and handed to the configured MetricsLogger.
// - Process metrics: Prometheus counters describing the engine itself (events, steps,
//   signals, orders, failures), optionally served over HTTP.
//
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info};

use crate::domain::{Account, Event, Phase, RunInfo};
use crate::error::Result;

/// Metric name -> value, ordered by name.
pub type MetricResults = BTreeMap<String, f64>;

/// Lifecycle hooks shared by every pluggable part of a run
/// (strategy, policy, broker, metrics, logger).
///
/// Hooks are infallible; a component that cannot start should fail at construction.
pub trait Component {
    fn start(&mut self, _phase: Phase, _run: &RunInfo) {}
    fn end(&mut self, _phase: Phase, _run: &RunInfo) {}
    fn reset(&mut self) {}

    /// Drain the values recorded since the previous call.
    fn get_metrics(&mut self) -> MetricResults {
        MetricResults::new()
    }
}

impl<C: Component + ?Sized> Component for Box<C> {
    fn start(&mut self, phase: Phase, run: &RunInfo) {
        (**self).start(phase, run)
    }
    fn end(&mut self, phase: Phase, run: &RunInfo) {
        (**self).end(phase, run)
    }
    fn reset(&mut self) {
        (**self).reset()
    }
    fn get_metrics(&mut self) -> MetricResults {
        (**self).get_metrics()
    }
}

/// A metric evaluated once per step. Errors are reported and skipped, never fatal.
pub trait Metric: Component + Send {
    fn name(&self) -> &str;
    fn calculate(&mut self, account: &Account, event: &Event) -> Result<MetricResults>;
}

// -----------------------------------------------------------------------------
// Built-in metrics
// -----------------------------------------------------------------------------

/// Equity, cash, buying power and exposure counts of the account.
#[derive(Debug, Default)]
pub struct AccountMetric;

impl Component for AccountMetric {}

impl Metric for AccountMetric {
    fn name(&self) -> &str {
        "account"
    }

    fn calculate(&mut self, account: &Account, _event: &Event) -> Result<MetricResults> {
        let mut out = MetricResults::new();
        out.insert("account.equity".into(), account.equity());
        out.insert("account.cash".into(), account.cash);
        out.insert("account.buying_power".into(), account.buying_power);
        let open_positions = account.portfolio.values().filter(|p| !p.is_flat()).count();
        out.insert("account.positions".into(), open_positions as f64);
        out.insert("account.open_orders".into(), account.open_orders.len() as f64);
        Ok(out)
    }
}

/// Step and item counts within the current phase.
#[derive(Debug, Default)]
pub struct ProgressMetric {
    steps: u64,
    items: u64,
    heartbeats: u64,
}

impl Component for ProgressMetric {
    fn start(&mut self, _phase: Phase, _run: &RunInfo) {
        self.reset();
    }

    fn reset(&mut self) {
        self.steps = 0;
        self.items = 0;
        self.heartbeats = 0;
    }
}

impl Metric for ProgressMetric {
    fn name(&self) -> &str {
        "progress"
    }

    fn calculate(&mut self, _account: &Account, event: &Event) -> Result<MetricResults> {
        self.steps += 1;
        self.items += event.items.len() as u64;
        if event.is_heartbeat() {
            self.heartbeats += 1;
        }
        let mut out = MetricResults::new();
        out.insert("progress.steps".into(), self.steps as f64);
        out.insert("progress.items".into(), self.items as f64);
        out.insert("progress.heartbeats".into(), self.heartbeats as f64);
        Ok(out)
    }
}

// -----------------------------------------------------------------------------
// Process metrics (Prometheus)
// -----------------------------------------------------------------------------

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static EVENTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("events_total", "events received by the runner").unwrap());

pub static EVENTS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("events_dropped_total", "events rejected by the channel (outside timeframe)").unwrap()
});

pub static HEARTBEATS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("heartbeats_total", "heartbeat events sent").unwrap());

pub static STEPS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("steps_total", "steps completed without error").unwrap());

pub static SIGNALS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("signals_total", "strategy signals").unwrap());

pub static ORDERS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("orders_total", "orders generated by policy").unwrap());

pub static METRIC_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("metric_failures_total", "metric calculations that failed"),
        &["metric"],
    )
    .unwrap()
});

pub static PHASES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("phases_total", "phases executed"), &["phase"]).unwrap()
});

pub fn init() {
    // Registering twice only returns AlreadyReg; ignore.
    for m in [
        REGISTRY.register(Box::new(EVENTS.clone())),
        REGISTRY.register(Box::new(EVENTS_DROPPED.clone())),
        REGISTRY.register(Box::new(HEARTBEATS.clone())),
        REGISTRY.register(Box::new(STEPS.clone())),
        REGISTRY.register(Box::new(SIGNALS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(METRIC_FAILURES.clone())),
        REGISTRY.register(Box::new(PHASES.clone())),
    ] {
        let _ = m;
    }
}

/// Encode all process metrics in Prometheus text format.
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

fn handle_client(mut stream: TcpStream) {
    // headers are not parsed; every path returns the metrics
    let mut req_buf = [0u8; 1024];
    let _ = stream.read(&mut req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

/// Serve the process metrics from a dedicated OS thread.
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(?e, %addr, "metrics bind failed");
                return;
            }
        };
        info!(%addr, "metrics listening");
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => error!(?e, "metrics accept error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Asset, Position, PriceItem};
    use chrono::Utc;

    #[test]
    fn account_metric_reports_equity() {
        let mut acc = Account::new("USD", 1_000.0);
        let asset = Asset::new("X", "USD");
        acc.portfolio.insert(
            asset.clone(),
            Position { asset, size: 2.0, avg_price: 50.0, mkt_price: 60.0 },
        );
        let out = AccountMetric.calculate(&acc, &Event::empty(Utc::now())).unwrap();
        assert_eq!(out["account.equity"], 1_120.0);
        assert_eq!(out["account.positions"], 1.0);
    }

    #[test]
    fn progress_metric_counts_heartbeats_and_resets() {
        let mut m = ProgressMetric::default();
        let acc = Account::new("USD", 0.0);
        let asset = Asset::new("X", "USD");
        m.calculate(&acc, &Event::empty(Utc::now())).unwrap();
        let out = m
            .calculate(
                &acc,
                &Event::new(Utc::now(), vec![PriceItem::Trade { asset, price: 1.0, volume: 1.0 }]),
            )
            .unwrap();
        assert_eq!(out["progress.steps"], 2.0);
        assert_eq!(out["progress.items"], 1.0);
        assert_eq!(out["progress.heartbeats"], 1.0);

        m.start(Phase::Validate, &RunInfo::new("r"));
        let out = m.calculate(&acc, &Event::empty(Utc::now())).unwrap();
        assert_eq!(out["progress.steps"], 1.0);
    }

    #[test]
    fn encode_contains_registered_counters() {
        init();
        EVENTS.inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("events_total"));
        assert!(text.contains("steps_total"));
    }
}
