// ===============================
// src/main.rs
// ===============================
/*
 # backtest 90 days of hourly bars, last 20% as validation, 3 episodes
 DAYS=90 VALIDATION_RATIO=0.2 EPISODES=3 RECORD_FILE=out/metrics.jsonl cargo run --release

 # live mode for 2 minutes with a 5s heartbeat, process metrics on :9898
 FEED_MODE=live LIVE_SECONDS=120 HEARTBEAT_MS=5000 METRICS_PORT=9898 cargo run
 curl -s localhost:9898/metrics | egrep "^(steps|events|orders)_total"
*/
/*
=============================================================================
Project : event_runner_rust — async backtest / live step engine in Rust
Module  : main.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Replays (random-walk) or streams (heartbeat live feed) market events
          through strategy -> policy -> simulated broker, one step per event,
          across episodes and main/validation phases; logs run metrics and
          exposes Prometheus process metrics.

=============================================================================
*/
use chrono::{Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use event_runner_rust::broker::SimBroker;
use event_runner_rust::config::{self, Args, FeedMode, StrategyMode};
use event_runner_rust::domain::{Asset, Event, PriceItem, Timeframe};
use event_runner_rust::feed::{Feed, LiveFeed, RandomWalkFeed};
use event_runner_rust::heartbeat::HeartbeatSource;
use event_runner_rust::logger::{ConsoleLogger, MetricsLogger};
use event_runner_rust::metrics::{self, AccountMetric, ProgressMetric};
use event_runner_rust::policy::{FlexPolicy, PolicyConfig};
use event_runner_rust::recorder::JsonlLogger;
use event_runner_rust::strategy::{MaCrossover, MeanReversion, Strategy};
use event_runner_rust::{Result, Runner};

const RECORDER_BUFFER: usize = 8192;
const LIVE_TICK: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Load config & policy limits ----
    let (args, policy_cfg) = config::load();
    info!(
        feed_mode = ?args.feed_mode,
        strategy = ?args.strategy_mode,
        symbols = ?args.symbols,
        episodes = args.episodes,
        capacity = args.channel_capacity,
        policy = ?policy_cfg,
        "startup config"
    );

    // ---- Metrics ----
    metrics::init();
    if let Some(port) = args.metrics_port {
        metrics::serve_metrics(port);
    }

    if let Err(e) = run(args, policy_cfg).await {
        error!(%e, "run failed");
        std::process::exit(1);
    }
}

async fn run(args: Args, policy_cfg: PolicyConfig) -> Result<()> {
    let assets: Vec<Asset> = args
        .symbols
        .iter()
        .map(|s| Asset::new(s.clone(), args.base_currency.clone()))
        .collect();

    let strategy: Box<dyn Strategy> = match args.strategy_mode {
        StrategyMode::MeanReversion => Box::new(MeanReversion::default()),
        StrategyMode::MACrossover => Box::new(MaCrossover::default()),
    };
    let policy = FlexPolicy::new(policy_cfg)?;
    let broker = SimBroker::new(args.base_currency.clone(), args.initial_cash);

    // ---- Recorder (optional) ----
    let mut recorder = None;
    let logger: Box<dyn MetricsLogger> = match args.record_file.clone() {
        Some(path) => {
            let (logger, handle) = JsonlLogger::spawn(path, RECORDER_BUFFER);
            recorder = Some(handle);
            Box::new(logger)
        }
        None => Box::new(ConsoleLogger::default()),
    };

    let mut runner = Runner::new(strategy, policy, broker, logger)
        .with_metric(AccountMetric)
        .with_metric(ProgressMetric::default())
        .with_channel_capacity(args.channel_capacity);

    match args.feed_mode {
        FeedMode::Historic => {
            let end = Utc::now();
            let tf = Timeframe::new(end - ChronoDuration::days(args.days.max(1)), end);
            let (main_tf, validation) = match args.validation_ratio {
                Some(ratio) => {
                    let (main_tf, tail) = tf.split(ratio);
                    (main_tf, Some(tail))
                }
                None => (tf, None),
            };
            let feed: Arc<dyn Feed> =
                Arc::new(RandomWalkFeed::new(assets, tf, ChronoDuration::hours(1), args.seed));
            runner.run(feed, main_tf, validation, args.episodes).await?;
        }
        FeedMode::Live => {
            if args.episodes > 1 {
                warn!(episodes = args.episodes, "live mode runs a single episode");
            }
            let tf = Timeframe::next(ChronoDuration::seconds(args.live_seconds.max(1)));
            let live = Arc::new(LiveFeed::new(HeartbeatSource::new(args.heartbeat)).with_timeframe(tf));
            let ticker = tokio::spawn(mock_ticker(live.clone(), assets, args.seed));
            let res = runner.run(live, tf, None, 1).await;
            ticker.abort();
            res?;
        }
    }

    let info = runner.info();
    info!(run = %info.run, episodes = info.episode, "done");

    // dropping the runner drops the recorder sender, which lets the task flush and stop
    drop(runner);
    if let Some(handle) = recorder {
        let _ = handle.await;
    }
    Ok(())
}

/// Random-walk trades pushed into the live feed while it plays.
async fn mock_ticker(feed: Arc<LiveFeed>, assets: Vec<Asset>, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut prices = vec![100.0_f64; assets.len()];
    let mut tick = interval(LIVE_TICK);
    loop {
        tick.tick().await;
        if !feed.is_active() {
            continue;
        }
        let items = assets
            .iter()
            .zip(prices.iter_mut())
            .map(|(asset, px)| {
                *px = (*px * (1.0 + rng.gen_range(-0.002..=0.002))).max(0.01);
                PriceItem::Trade { asset: asset.clone(), price: *px, volume: rng.gen_range(0.1..=5.0) }
            })
            .collect();
        if let Err(e) = feed.send(Event::new(Utc::now(), items)).await {
            debug!(%e, "live tick not delivered");
        }
    }
}
