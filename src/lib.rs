// ===============================
// src/lib.rs
// ===============================
//
// Event-driven step engine: a feed fills a bounded, timeframe-scoped channel, the
// runner drains it one event at a time through broker -> metrics -> strategy -> policy.
//
pub mod broker;
pub mod channel;
pub mod config;
pub mod domain;
pub mod error;
pub mod feed;
pub mod heartbeat;
pub mod logger;
pub mod metrics;
pub mod policy;
pub mod recorder;
pub mod runner;
pub mod strategy;

pub use error::{EngineError, Result};
pub use runner::Runner;
