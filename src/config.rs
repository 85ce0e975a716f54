// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : event_runner_rust — async backtest / live step engine in Rust
Module  : config.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Replays (random-walk) or streams (heartbeat live feed) market events
          through strategy -> policy -> simulated broker, one step per event,
          across episodes and main/validation phases; logs run metrics and
          exposes Prometheus process metrics.

=============================================================================
*/
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::policy::PolicyConfig;

/// Source of market events for the demo run
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedMode {
    /// Seeded random-walk bars over a fixed historic timeframe
    Historic,
    /// Heartbeat live feed with a mock random-walk ticker pushing into it
    Live,
}

impl FeedMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "historic" | "backtest" | "mock" => Some(FeedMode::Historic),
            "live" => Some(FeedMode::Live),
            _ => None,
        }
    }
}

// ===== Strategi =====
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StrategyMode {
    MeanReversion,
    MACrossover,
}

impl StrategyMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mean_reversion" | "meanreversion" | "mr" => Some(StrategyMode::MeanReversion),
            "ma_crossover" | "macrossover" | "ma" => Some(StrategyMode::MACrossover),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    pub symbols: Vec<String>,
    pub base_currency: String,
    pub initial_cash: f64,

    pub feed_mode: FeedMode,
    pub strategy_mode: StrategyMode,

    // run shape
    pub episodes: u32,
    pub channel_capacity: usize,
    pub days: i64,
    pub validation_ratio: Option<f64>,
    pub heartbeat: Duration,
    pub live_seconds: i64,
    pub seed: u64,

    // output
    pub record_file: Option<String>,
    pub metrics_port: Option<u16>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key).unwrap_or_default().trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

/// Comma separated symbols, upper-cased, empty entries removed.
pub fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_ascii_uppercase())
        .collect()
}

pub fn policy_from_env() -> PolicyConfig {
    let d = PolicyConfig::default();
    PolicyConfig {
        min_amount: env_or("MIN_AMOUNT", d.min_amount),
        max_amount: env_or("MAX_AMOUNT", d.max_amount),
        shorting: env_flag("SHORTING", d.shorting),
        increase_position: env_flag("INCREASE_POSITION", d.increase_position),
        one_order_per_asset: env_flag("ONE_ORDER_PER_ASSET", d.one_order_per_asset),
    }
}

pub fn load() -> (Args, PolicyConfig) {
    // .env first so it can fill in anything not set in the environment
    let _ = dotenv();

    let symbols = env::var("SYMBOLS")
        .ok()
        .map(|s| parse_symbols(&s))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec!["BTCUSDT".to_string()]);

    let feed_mode = env::var("FEED_MODE")
        .ok()
        .and_then(|s| FeedMode::parse(&s))
        .unwrap_or(FeedMode::Historic);
    let strategy_mode = env::var("STRATEGY")
        .ok()
        .and_then(|s| StrategyMode::parse(&s))
        .unwrap_or(StrategyMode::MeanReversion);

    let validation_ratio = env::var("VALIDATION_RATIO")
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|r| *r > 0.0 && *r < 1.0);

    let metrics_port = env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.trim().parse::<u16>().ok())
        .filter(|p| *p != 0);

    let args = Args {
        symbols,
        base_currency: env::var("BASE_CURRENCY").unwrap_or_else(|_| "USD".to_string()),
        initial_cash: env_or("INITIAL_CASH", 100_000.0),
        feed_mode,
        strategy_mode,
        episodes: env_or("EPISODES", 1),
        channel_capacity: env_or("CHANNEL_CAPACITY", crate::channel::DEFAULT_CAPACITY),
        days: env_or("DAYS", 30),
        validation_ratio,
        heartbeat: Duration::from_millis(env_or("HEARTBEAT_MS", 10_000)),
        live_seconds: env_or("LIVE_SECONDS", 60),
        seed: env_or("SEED", 42),
        record_file: env::var("RECORD_FILE").ok().filter(|s| !s.trim().is_empty()),
        metrics_port,
    };

    (args, policy_from_env())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_symbol_list() {
        assert_eq!(parse_symbols(" btcusdt, ,ethusdt "), vec!["BTCUSDT", "ETHUSDT"]);
        assert!(parse_symbols(",,").is_empty());
    }

    #[test]
    fn parses_modes() {
        assert_eq!(FeedMode::parse("LIVE"), Some(FeedMode::Live));
        assert_eq!(FeedMode::parse("backtest"), Some(FeedMode::Historic));
        assert_eq!(FeedMode::parse("paper"), None);
        assert_eq!(StrategyMode::parse("ma"), Some(StrategyMode::MACrossover));
        assert_eq!(StrategyMode::parse(" Mean_Reversion "), Some(StrategyMode::MeanReversion));
    }

    #[test]
    fn policy_defaults_without_env() {
        // keys are unlikely to be set in a test environment
        if env::var("MIN_AMOUNT").is_err() && env::var("MAX_AMOUNT").is_err() {
            let cfg = policy_from_env();
            assert_eq!(cfg.min_amount, 5_000.0);
            assert_eq!(cfg.max_amount, 20_000.0);
        }
    }
}
