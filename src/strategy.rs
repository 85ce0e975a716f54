// ===============================
// src/strategy.rs
// ===============================
//
// Strategies turn an event into signals. Two are provided:
// 1) MeanReversion : price below mean - edge -> buy, above mean + edge -> sell
// 2) MaCrossover   : fast SMA crossing the slow SMA (golden / dead cross)
//
// Both keep one rolling window per asset and emit signals with rating +1/-1 that may
// open and close positions. Sizing is left to the policy.
//
use ahash::AHashMap as HashMap;
use std::collections::VecDeque;

use crate::domain::{Asset, Event, Signal};
use crate::error::Result;
use crate::metrics::{Component, MetricResults};

pub trait Strategy: Component + Send {
    fn generate(&mut self, event: &Event) -> Result<Vec<Signal>>;
}

impl<S: Strategy + ?Sized> Strategy for Box<S> {
    fn generate(&mut self, event: &Event) -> Result<Vec<Signal>> {
        (**self).generate(event)
    }
}

#[derive(Debug, Default)]
struct Window {
    values: VecDeque<f64>,
    sum: f64,
}

impl Window {
    fn push(&mut self, cap: usize, v: f64) {
        if self.values.len() == cap {
            if let Some(x) = self.values.pop_front() {
                self.sum -= x;
            }
        }
        self.values.push_back(v);
        self.sum += v;
    }

    fn mean(&self, cap: usize) -> Option<f64> {
        (self.values.len() >= cap && cap > 0).then(|| self.sum / cap as f64)
    }
}

// -----------------------------------------------------------------------------
// 1) MEAN-REVERSION
//    Works in sideways markets; fights strong trends (policy limits the damage).
// -----------------------------------------------------------------------------
pub struct MeanReversion {
    window: usize,
    /// Relative distance from the mean, e.g. 0.01 = 1%.
    edge: f64,
    state: HashMap<Asset, Window>,
    signals: u64,
}

impl MeanReversion {
    pub fn new(window: usize, edge: f64) -> Self {
        Self { window, edge, state: HashMap::new(), signals: 0 }
    }
}

impl Default for MeanReversion {
    fn default() -> Self {
        Self::new(20, 0.01)
    }
}

impl Component for MeanReversion {
    fn reset(&mut self) {
        self.state.clear();
        self.signals = 0;
    }

    fn get_metrics(&mut self) -> MetricResults {
        let mut out = MetricResults::new();
        out.insert("strategy.signals".into(), std::mem::take(&mut self.signals) as f64);
        out
    }
}

impl Strategy for MeanReversion {
    fn generate(&mut self, event: &Event) -> Result<Vec<Signal>> {
        let mut out = Vec::new();
        for (asset, price) in event.prices() {
            let w = self.state.entry(asset.clone()).or_default();
            // compare against the mean before this price enters the window
            let fair = w.mean(self.window);
            w.push(self.window, price);
            if let Some(fair) = fair {
                if price < fair * (1.0 - self.edge) {
                    out.push(Signal::new(asset, 1.0));
                } else if price > fair * (1.0 + self.edge) {
                    out.push(Signal::new(asset, -1.0));
                }
            }
        }
        out.sort_by(|a, b| a.asset.cmp(&b.asset));
        self.signals += out.len() as u64;
        Ok(out)
    }
}

// -----------------------------------------------------------------------------
// 2) MOVING AVERAGE CROSSOVER
//    Trend following. Choppy markets cause whipsaws, hence min_edge and cooldown.
// -----------------------------------------------------------------------------
#[derive(Debug, Default)]
struct CrossState {
    fast: Window,
    slow: Window,
    prev_sign: i8,
    since_last: u32,
}

pub struct MaCrossover {
    fast_w: usize,
    slow_w: usize,
    /// Minimum relative gap between both averages to count as a cross.
    min_edge: f64,
    cooldown: u32,
    state: HashMap<Asset, CrossState>,
    signals: u64,
}

impl MaCrossover {
    pub fn new(fast_w: usize, slow_w: usize, min_edge: f64, cooldown: u32) -> Self {
        Self { fast_w, slow_w, min_edge, cooldown, state: HashMap::new(), signals: 0 }
    }
}

impl Default for MaCrossover {
    fn default() -> Self {
        Self::new(12, 26, 0.0005, 5)
    }
}

impl Component for MaCrossover {
    fn reset(&mut self) {
        self.state.clear();
        self.signals = 0;
    }

    fn get_metrics(&mut self) -> MetricResults {
        let mut out = MetricResults::new();
        out.insert("strategy.signals".into(), std::mem::take(&mut self.signals) as f64);
        out
    }
}

impl Strategy for MaCrossover {
    fn generate(&mut self, event: &Event) -> Result<Vec<Signal>> {
        let mut out = Vec::new();
        for (asset, price) in event.prices() {
            let cooldown = self.cooldown;
            let st = self.state.entry(asset.clone()).or_insert_with(|| CrossState {
                since_last: cooldown,
                ..Default::default()
            });
            st.fast.push(self.fast_w, price);
            st.slow.push(self.slow_w, price);
            st.since_last = st.since_last.saturating_add(1);

            let (Some(fast), Some(slow)) = (st.fast.mean(self.fast_w), st.slow.mean(self.slow_w)) else {
                continue;
            };
            let diff = fast - slow;
            if diff.abs() < slow * self.min_edge {
                continue;
            }
            let sign: i8 = if diff > 0.0 { 1 } else { -1 };

            if st.prev_sign == 0 {
                // first full window only sets the reference side
                st.prev_sign = sign;
                continue;
            }
            if sign != st.prev_sign && st.since_last >= self.cooldown {
                st.prev_sign = sign;
                st.since_last = 0;
                out.push(Signal::new(asset, f64::from(sign)));
            }
        }
        out.sort_by(|a, b| a.asset.cmp(&b.asset));
        self.signals += out.len() as u64;
        Ok(out)
    }
}
