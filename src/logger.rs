// ===============================
// src/logger.rs
// ===============================
use ahash::AHashMap as HashMap;
use tracing::info;

use crate::domain::{Phase, RunInfo, Timestamp};
use crate::metrics::{Component, MetricResults};

/// Sink for the metric values computed each step.
pub trait MetricsLogger: Component + Send {
    /// `run` is a snapshot; the runner keeps the live counters.
    fn log(&mut self, results: &MetricResults, run: &RunInfo);
}

impl<L: MetricsLogger + ?Sized> MetricsLogger for Box<L> {
    fn log(&mut self, results: &MetricResults, run: &RunInfo) {
        (**self).log(results, run)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub run: String,
    pub episode: u32,
    pub phase: Phase,
    pub step: u64,
    pub time: Option<Timestamp>,
    pub value: f64,
}

/// Keeps every logged value in memory, grouped by metric name.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    history: HashMap<String, Vec<Observation>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.history.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> &[Observation] {
        self.history.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn last(&self, name: &str) -> Option<f64> {
        self.get(name).last().map(|o| o.value)
    }
}

impl Component for MemoryLogger {
    fn reset(&mut self) {
        self.history.clear();
    }
}

impl MetricsLogger for MemoryLogger {
    fn log(&mut self, results: &MetricResults, run: &RunInfo) {
        for (name, value) in results {
            self.history.entry(name.clone()).or_default().push(Observation {
                run: run.run.clone(),
                episode: run.episode,
                phase: run.phase,
                step: run.step,
                time: run.time,
                value: *value,
            });
        }
    }
}

/// Prints the latest metrics through `tracing` every `every` steps and at phase end.
#[derive(Debug)]
pub struct ConsoleLogger {
    every: u64,
    last: MetricResults,
}

impl ConsoleLogger {
    pub fn new(every: u64) -> Self {
        Self { every: every.max(1), last: MetricResults::new() }
    }
}

impl Default for ConsoleLogger {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl Component for ConsoleLogger {
    fn end(&mut self, phase: Phase, run: &RunInfo) {
        info!(run = %run.run, episode = run.episode, %phase, steps = run.step, metrics = ?self.last, "phase summary");
    }

    fn reset(&mut self) {
        self.last.clear();
    }
}

impl MetricsLogger for ConsoleLogger {
    fn log(&mut self, results: &MetricResults, run: &RunInfo) {
        self.last.extend(results.iter().map(|(k, v)| (k.clone(), *v)));
        if run.step % self.every == 0 {
            info!(episode = run.episode, phase = %run.phase, step = run.step, metrics = ?results, "metrics");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_logger_groups_by_name() {
        let mut logger = MemoryLogger::new();
        let mut run = RunInfo::new("run-1");
        for step in 1..=3 {
            run.step = step;
            let mut r = MetricResults::new();
            r.insert("a".into(), step as f64);
            if step == 2 {
                r.insert("b".into(), 10.0);
            }
            logger.log(&r, &run);
        }
        assert_eq!(logger.metric_names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(logger.get("a").len(), 3);
        assert_eq!(logger.last("a"), Some(3.0));
        assert_eq!(logger.get("b")[0].step, 2);
        assert!(logger.get("missing").is_empty());

        logger.reset();
        assert!(logger.metric_names().is_empty());
    }
}
