// ===============================
// src/heartbeat.rs
// ===============================
//
// Keeps a live channel moving when no market data arrives: wait one interval,
// send an empty event, stop once the channel is done.
//
// Shutdown latency: a close that happens while the loop is sleeping is only noticed
// at the next send attempt, so a live feed may run up to one interval after close.
//
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::channel::EventChannel;
use crate::domain::Event;
use crate::metrics::HEARTBEATS;

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSource {
    pub interval: Duration,
}

impl Default for HeartbeatSource {
    fn default() -> Self {
        Self { interval: DEFAULT_INTERVAL }
    }
}

impl HeartbeatSource {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Run until the channel is done or closed. Consumes the channel handle so it is
    /// released when the loop ends. Returns the number of heartbeats sent.
    pub async fn run(&self, channel: Arc<EventChannel>) -> u64 {
        let mut sent: u64 = 0;
        loop {
            sleep(self.interval).await;
            match channel.send(Event::empty(Utc::now())).await {
                Ok(()) => {
                    sent += 1;
                    HEARTBEATS.inc();
                    if channel.done() {
                        debug!(sent, "channel done, heartbeat stopped");
                        break;
                    }
                }
                Err(e) => {
                    // closure is the normal way to stop a live feed
                    debug!(%e, sent, "heartbeat stopped");
                    break;
                }
            }
        }
        drop(channel);
        sent
    }
}
