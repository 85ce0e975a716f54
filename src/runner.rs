// ===============================
// src/runner.rs
// ===============================
//
// Orchestrates a run: episodes -> phases (main, then optional validation) -> steps.
//
// Per phase exactly two tasks are active: the feed playing into an EventChannel
// (spawned) and the step loop below (consumer). Every step runs in a fixed order:
//
//   broker.place(previous orders, event) -> account
//   metrics(account, event) -> logger
//   strategy.generate(event) -> signals
//   policy.act(signals, account, event) -> orders for the next step
//
// The broker always sees an event before strategy and policy do, so decisions are
// taken on an account that already reflects that event (no look-ahead).
//
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::channel::{EventChannel, DEFAULT_CAPACITY};
use crate::domain::{Account, Event, Order, Phase, RunInfo, Timeframe};
use crate::error::{EngineError, Result};
use crate::feed::Feed;
use crate::logger::MetricsLogger;
use crate::metrics::{Component, Metric, MetricResults, EVENTS, METRIC_FAILURES, PHASES, SIGNALS, STEPS};
use crate::policy::Policy;
use crate::strategy::Strategy;

#[derive(Debug, Clone, Copy)]
enum Hook {
    Start(Phase),
    End(Phase),
    Reset,
}

fn notify<C: Component + ?Sized>(c: &mut C, hook: Hook, run: &RunInfo) {
    match hook {
        Hook::Start(phase) => c.start(phase, run),
        Hook::End(phase) => c.end(phase, run),
        Hook::Reset => c.reset(),
    }
}

fn new_run_id() -> String {
    format!("run-{}-{:04x}", Utc::now().format("%Y%m%d%H%M%S"), rand::thread_rng().gen::<u16>())
}

pub struct Runner {
    strategy: Box<dyn Strategy>,
    policy: Box<dyn Policy>,
    broker: Box<dyn Broker>,
    logger: Box<dyn MetricsLogger>,
    metrics: Vec<Box<dyn Metric>>,
    channel_capacity: usize,
    info: RunInfo,
}

impl Runner {
    pub fn new(
        strategy: impl Strategy + 'static,
        policy: impl Policy + 'static,
        broker: impl Broker + 'static,
        logger: impl MetricsLogger + 'static,
    ) -> Self {
        Self {
            strategy: Box::new(strategy),
            policy: Box::new(policy),
            broker: Box::new(broker),
            logger: Box::new(logger),
            metrics: Vec::new(),
            channel_capacity: DEFAULT_CAPACITY,
            info: RunInfo::new(new_run_id()),
        }
    }

    pub fn with_metric(mut self, metric: impl Metric + 'static) -> Self {
        self.metrics.push(Box::new(metric));
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Snapshot of the current run bookkeeping.
    pub fn info(&self) -> RunInfo {
        self.info.clone()
    }

    /// Run `episodes` episodes over `timeframe`, each followed by a validation phase
    /// over `validation` when given. Episodes run one after another.
    pub async fn run(
        &mut self,
        feed: Arc<dyn Feed>,
        timeframe: Timeframe,
        validation: Option<Timeframe>,
        episodes: u32,
    ) -> Result<()> {
        if episodes == 0 {
            return Err(EngineError::Configuration("episodes must be > 0".into()));
        }
        self.info.run = new_run_id();
        info!(run = %self.info.run, episodes, %timeframe, "run started");

        for _ in 0..episodes {
            self.info.episode += 1;
            self.run_phase(&feed, timeframe, Phase::Main).await?;
            if let Some(v) = validation {
                self.run_phase(&feed, v, Phase::Validate).await?;
            }
        }
        info!(run = %self.info.run, episode = self.info.episode, "run finished");
        Ok(())
    }

    /// Reset every component and the episode counter. Not meant to be called mid-run.
    pub fn reset(&mut self) {
        self.for_each_component(Hook::Reset);
        self.info.episode = 0;
        self.info.step = 0;
        self.info.time = None;
    }

    async fn run_phase(&mut self, feed: &Arc<dyn Feed>, timeframe: Timeframe, phase: Phase) -> Result<()> {
        let tf = feed.timeframe().intersect(&timeframe);
        if tf.is_empty() {
            info!(%phase, requested = %timeframe, available = %feed.timeframe(), "no overlap, phase skipped");
            return Ok(());
        }

        self.info.phase = phase;
        self.info.timeframe = tf;
        self.info.step = 0;
        self.info.time = None;
        PHASES.with_label_values(&[phase.as_str()]).inc();

        let channel = Arc::new(EventChannel::new(tf, self.channel_capacity));
        debug!(%phase, timeframe = %tf, capacity = channel.capacity(), "phase channel ready");
        let producer = {
            let feed = feed.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                let res = feed.play(channel.clone()).await;
                // end of production ends the phase once the buffer is drained
                channel.close();
                res
            })
        };

        self.for_each_component(Hook::Start(phase));
        let mut orders: Vec<Order> = Vec::new();
        let outcome = loop {
            match channel.receive().await {
                Ok(event) => {
                    EVENTS.inc();
                    match self.step(orders, &event) {
                        Ok(next) => {
                            STEPS.inc();
                            orders = next;
                        }
                        Err(e) => break Err(e),
                    }
                }
                Err(EngineError::ChannelClosed) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        if outcome.is_ok() {
            self.for_each_component(Hook::End(phase));
        }

        if !producer.is_finished() {
            debug!(%phase, "feed still running, cancelling");
            producer.abort();
        }
        channel.close();
        let produced = match producer.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_closed() => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(EngineError::Feed(e.to_string())),
        };

        outcome?;
        produced?;
        info!(run = %self.info.run, episode = self.info.episode, %phase, steps = self.info.step, "phase finished");
        Ok(())
    }

    fn step(&mut self, orders: Vec<Order>, event: &Event) -> Result<Vec<Order>> {
        self.info.step += 1;
        self.info.time = Some(event.time);

        let account = self.broker.place(orders, event)?;

        let results = self.collect_metrics(&account, event);
        if !results.is_empty() {
            let snapshot = self.info.clone();
            self.logger.log(&results, &snapshot);
        }

        let signals = self.strategy.generate(event)?;
        SIGNALS.inc_by(signals.len() as u64);
        self.policy.act(&signals, &account, event)
    }

    fn collect_metrics(&mut self, account: &Account, event: &Event) -> MetricResults {
        let mut out = MetricResults::new();
        for metric in self.metrics.iter_mut() {
            match metric.calculate(account, event) {
                Ok(values) => out.extend(values),
                Err(e) => {
                    warn!(metric = metric.name(), step = self.info.step, error = %e, "metric calculation failed");
                    METRIC_FAILURES.with_label_values(&[metric.name()]).inc();
                }
            }
        }
        out.extend(self.strategy.get_metrics());
        out.extend(self.policy.get_metrics());
        out.extend(self.broker.get_metrics());
        out.extend(self.logger.get_metrics());
        out
    }

    fn for_each_component(&mut self, hook: Hook) {
        let run = self.info.clone();
        notify(self.strategy.as_mut(), hook, &run);
        notify(self.policy.as_mut(), hook, &run);
        notify(self.broker.as_mut(), hook, &run);
        notify(self.logger.as_mut(), hook, &run);
        for metric in self.metrics.iter_mut() {
            notify(metric.as_mut(), hook, &run);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use parking_lot::Mutex;
    use std::time::Duration;

    use crate::broker::SimBroker;
    use crate::domain::{Asset, PriceItem, Signal, Timestamp};
    use crate::feed::{HistoricFeed, LiveFeed};
    use crate::heartbeat::HeartbeatSource;
    use crate::metrics::AccountMetric;
    use crate::policy::{FlexPolicy, PolicyConfig};

    type Log = Arc<Mutex<Vec<String>>>;

    fn t(day: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::days(i64::from(day) - 1)
    }

    fn x() -> Asset {
        Asset::new("X", "USD")
    }

    fn feed(days: u32) -> Arc<dyn Feed> {
        let events = (1..=days)
            .map(|d| Event::new(t(d), vec![PriceItem::Trade { asset: x(), price: 10.0 + d as f64, volume: 1.0 }]))
            .collect();
        Arc::new(HistoricFeed::new(events))
    }

    fn all() -> Timeframe {
        Timeframe::INFINITE
    }

    struct Calls {
        log: Log,
    }

    impl Component for Calls {
        fn start(&mut self, phase: Phase, _run: &RunInfo) {
            self.log.lock().push(format!("start:{phase}"));
        }
        fn end(&mut self, phase: Phase, _run: &RunInfo) {
            self.log.lock().push(format!("end:{phase}"));
        }
        fn reset(&mut self) {
            self.log.lock().push("reset".into());
        }
    }

    impl Strategy for Calls {
        fn generate(&mut self, _event: &Event) -> Result<Vec<Signal>> {
            self.log.lock().push("strategy".into());
            Ok(vec![Signal::new(x(), 1.0)])
        }
    }

    struct CountingPolicy {
        log: Log,
    }

    impl Component for CountingPolicy {}

    impl Policy for CountingPolicy {
        fn act(&mut self, signals: &[Signal], _account: &Account, _event: &Event) -> Result<Vec<Order>> {
            self.log.lock().push("policy".into());
            Ok(signals.iter().map(|s| Order::market(1, s.asset.clone(), 1.0)).collect())
        }
    }

    struct ScriptedBroker {
        log: Log,
        fail_at: Option<u64>,
        steps: u64,
    }

    impl Component for ScriptedBroker {}

    impl Broker for ScriptedBroker {
        fn place(&mut self, orders: Vec<Order>, _event: &Event) -> Result<Account> {
            self.steps += 1;
            self.log.lock().push(format!("broker:{}", orders.len()));
            if Some(self.steps) == self.fail_at {
                return Err(EngineError::Broker("rejected".into()));
            }
            Ok(Account::new("USD", 1_000.0))
        }
    }

    #[derive(Default, Clone)]
    struct SharedLogger {
        rows: Arc<Mutex<Vec<(RunInfo, MetricResults)>>>,
    }

    impl Component for SharedLogger {}

    impl MetricsLogger for SharedLogger {
        fn log(&mut self, results: &MetricResults, run: &RunInfo) {
            self.rows.lock().push((run.clone(), results.clone()));
        }
    }

    struct FailingMetric;

    impl Component for FailingMetric {}

    impl Metric for FailingMetric {
        fn name(&self) -> &str {
            "failing"
        }
        fn calculate(&mut self, _account: &Account, _event: &Event) -> Result<MetricResults> {
            Err(EngineError::Metric { metric: "failing".into(), reason: "boom".into() })
        }
    }

    fn scripted(log: &Log, fail_at: Option<u64>) -> Runner {
        Runner::new(
            Calls { log: log.clone() },
            CountingPolicy { log: log.clone() },
            ScriptedBroker { log: log.clone(), fail_at, steps: 0 },
            SharedLogger::default(),
        )
    }

    #[tokio::test]
    async fn broker_runs_before_strategy_and_policy() {
        let log: Log = Default::default();
        let mut runner = scripted(&log, None);
        runner.run(feed(3), all(), None, 1).await.unwrap();

        let calls = log.lock().clone();
        assert_eq!(
            calls,
            vec![
                "start:main", "broker:0", "strategy", "policy", "broker:1", "strategy", "policy", "broker:1",
                "strategy", "policy", "end:main",
            ]
        );
        assert_eq!(runner.info().step, 3);
    }

    #[tokio::test]
    async fn no_overlap_means_no_steps() {
        let log: Log = Default::default();
        let mut runner = scripted(&log, None);
        let later = Timeframe::new(t(20), t(25));
        runner.run(feed(5), later, None, 1).await.unwrap();
        assert!(log.lock().is_empty());
        assert_eq!(runner.info().step, 0);
    }

    #[tokio::test]
    async fn phase_is_limited_to_intersection() {
        let log: Log = Default::default();
        let mut runner = scripted(&log, None);
        runner.run(feed(10), Timeframe::new(t(3), t(6)), None, 1).await.unwrap();
        let steps = log.lock().iter().filter(|c| c.starts_with("broker")).count();
        assert_eq!(steps, 3);
    }

    #[tokio::test]
    async fn episodes_and_validation_run_sequentially() {
        let log: Log = Default::default();
        let mut runner = scripted(&log, None);
        let main = Timeframe::new(t(1), t(8));
        let validation = Timeframe::new(t(8), t(11));
        runner.run(feed(10), main, Some(validation), 2).await.unwrap();

        let phases: Vec<String> = log.lock().iter().filter(|c| c.contains(':') && !c.starts_with("broker")).cloned().collect();
        assert_eq!(
            phases,
            vec!["start:main", "end:main", "start:validate", "end:validate", "start:main", "end:main", "start:validate", "end:validate"]
        );
        let info = runner.info();
        assert_eq!(info.episode, 2);
        assert_eq!(info.phase, Phase::Validate);
        assert_eq!(info.step, 3);

        runner.reset();
        assert_eq!(runner.info().episode, 0);
        assert_eq!(log.lock().last().map(String::as_str), Some("reset"));
    }

    #[tokio::test]
    async fn zero_episodes_is_a_configuration_error() {
        let log: Log = Default::default();
        let mut runner = scripted(&log, None);
        let err = runner.run(feed(3), all(), None, 0).await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn broker_failure_aborts_the_run() {
        let log: Log = Default::default();
        let mut runner = scripted(&log, Some(2));
        let err = runner.run(feed(50), all(), None, 1).await.unwrap_err();
        assert!(matches!(err, EngineError::Broker(_)));
        assert!(!log.lock().iter().any(|c| c.starts_with("end")));
        // the failed event was received but its step never completed
        assert!(EVENTS.get() > STEPS.get());
    }

    #[tokio::test]
    async fn failing_metric_does_not_stop_the_others() {
        let logger = SharedLogger::default();
        let mut runner = Runner::new(
            Calls { log: Default::default() },
            FlexPolicy::new(PolicyConfig::default()).unwrap(),
            SimBroker::new("USD", 100_000.0),
            logger.clone(),
        )
        .with_metric(FailingMetric)
        .with_metric(AccountMetric);
        runner.run(feed(4), all(), None, 1).await.unwrap();

        let rows = logger.rows.lock();
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|(_, m)| m.contains_key("account.equity")));
        assert_eq!(rows[3].0.step, 4);
        assert_eq!(rows[3].0.time, Some(t(4)));
        // policy counters of the previous step are reported on the next one
        assert_eq!(rows[1].1["policy.signals"], 1.0);
        assert!(rows[3].1["account.positions"] >= 1.0);
    }

    #[tokio::test]
    async fn feed_failure_is_propagated() {
        struct Broken;

        #[async_trait]
        impl Feed for Broken {
            fn timeframe(&self) -> Timeframe {
                Timeframe::INFINITE
            }
            async fn play(&self, channel: Arc<EventChannel>) -> Result<()> {
                channel.send(Event::empty(t(1))).await?;
                Err(EngineError::Feed("disconnected".into()))
            }
        }

        let log: Log = Default::default();
        let mut runner = scripted(&log, None);
        let err = runner.run(Arc::new(Broken), all(), None, 1).await.unwrap_err();
        assert!(matches!(err, EngineError::Feed(_)));
    }

    #[tokio::test]
    async fn live_feed_phase_ends_with_timeframe() {
        let log: Log = Default::default();
        let mut runner = scripted(&log, None).with_channel_capacity(4);
        let live: Arc<dyn Feed> = Arc::new(LiveFeed::new(HeartbeatSource::new(Duration::from_millis(20))));
        let tf = Timeframe::next(ChronoDuration::milliseconds(150));

        tokio::time::timeout(Duration::from_secs(5), runner.run(live, tf, None, 1))
            .await
            .expect("live phase must stop once its timeframe is over")
            .unwrap();
        assert!(runner.info().step >= 1);
        assert!(log.lock().iter().any(|c| c == "end:main"));
    }
}
