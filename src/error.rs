// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Normal end of a phase: the event channel was closed or its timeframe ran out.
    #[error("Event channel closed")]
    ChannelClosed,
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Metric {metric} failed: {reason}")]
    Metric { metric: String, reason: String },
    #[error("Feed failed: {0}")]
    Feed(String),
    #[error("Broker failed: {0}")]
    Broker(String),
    #[error("Strategy failed: {0}")]
    Strategy(String),
    #[error("Policy failed: {0}")]
    Policy(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn is_closed(&self) -> bool {
        matches!(self, EngineError::ChannelClosed)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
