// ===============================
// src/feed.rs
// ===============================
//
// Market data sources. Every feed pushes into an EventChannel and must stop once the
// channel is done (cooperative cancellation):
// - HistoricFeed   : in-memory events, replayed in time order
// - RandomWalkFeed : seeded random-walk bars per asset (mock data)
// - LiveFeed       : open-ended feed kept alive by heartbeats; adapters push events
//                    with `send` while it plays
//
use async_trait::async_trait;
use chrono::Duration;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::{debug, info};

use crate::channel::EventChannel;
use crate::domain::{Asset, Event, PriceItem, Timeframe};
use crate::error::{EngineError, Result};
use crate::heartbeat::HeartbeatSource;

#[async_trait]
pub trait Feed: Send + Sync {
    /// Period this feed can produce events for.
    fn timeframe(&self) -> Timeframe;

    /// Push events into `channel` until exhausted or the channel is done.
    async fn play(&self, channel: Arc<EventChannel>) -> Result<()>;
}

// -----------------------------------------------------------------------------
// Historic
// -----------------------------------------------------------------------------

pub struct HistoricFeed {
    events: Vec<Event>,
}

impl HistoricFeed {
    pub fn new(mut events: Vec<Event>) -> Self {
        events.sort_by_key(|e| e.time);
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[async_trait]
impl Feed for HistoricFeed {
    fn timeframe(&self) -> Timeframe {
        match (self.events.first(), self.events.last()) {
            // end is exclusive, stretch it just past the last event
            (Some(first), Some(last)) => Timeframe::new(first.time, last.time + Duration::nanoseconds(1)),
            _ => Timeframe::new(chrono::DateTime::<chrono::Utc>::MIN_UTC, chrono::DateTime::<chrono::Utc>::MIN_UTC),
        }
    }

    async fn play(&self, channel: Arc<EventChannel>) -> Result<()> {
        let tf = channel.timeframe();
        for event in self.events.iter().filter(|e| e.time >= tf.start) {
            channel.send(event.clone()).await?;
            if channel.done() {
                break;
            }
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Random walk (mock)
// -----------------------------------------------------------------------------

const START_PRICE: f64 = 100.0;

pub struct RandomWalkFeed {
    assets: Vec<Asset>,
    timeframe: Timeframe,
    step: Duration,
    seed: u64,
}

impl RandomWalkFeed {
    pub fn new(assets: Vec<Asset>, timeframe: Timeframe, step: Duration, seed: u64) -> Self {
        Self { assets, timeframe, step, seed }
    }
}

#[async_trait]
impl Feed for RandomWalkFeed {
    fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    async fn play(&self, channel: Arc<EventChannel>) -> Result<()> {
        if self.step <= Duration::zero() {
            return Err(EngineError::Feed("random walk step must be positive".into()));
        }
        // same seed -> same path, whatever the channel's timeframe
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut prices: Vec<f64> = vec![START_PRICE; self.assets.len()];
        let tf = channel.timeframe();
        let mut time = self.timeframe.start;
        let mut produced: u64 = 0;

        while time < self.timeframe.end {
            let mut items = Vec::with_capacity(self.assets.len());
            for (asset, px) in self.assets.iter().zip(prices.iter_mut()) {
                let open = *px;
                let close = (open * (1.0 + rng.gen_range(-0.01..=0.01))).max(0.01);
                let high = open.max(close) * (1.0 + rng.gen_range(0.0..=0.005));
                let low = open.min(close) * (1.0 - rng.gen_range(0.0..=0.005));
                let volume = rng.gen_range(1_000.0..=10_000.0);
                *px = close;
                items.push(PriceItem::Bar { asset: asset.clone(), open, high, low, close, volume });
            }
            if time >= tf.start {
                channel.send(Event::new(time, items)).await?;
                produced += 1;
                if channel.done() {
                    break;
                }
            }
            time += self.step;
        }
        debug!(produced, "random walk finished");
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Live
// -----------------------------------------------------------------------------

/// Open-ended feed. While playing it holds the channel and emits heartbeats; adapters
/// push real data through [`LiveFeed::send`]. Outside of `play` sends are no-ops.
pub struct LiveFeed {
    timeframe: Timeframe,
    heartbeat: HeartbeatSource,
    channel: Mutex<Option<Arc<EventChannel>>>,
}

impl LiveFeed {
    pub fn new(heartbeat: HeartbeatSource) -> Self {
        Self { timeframe: Timeframe::INFINITE, heartbeat, channel: Mutex::new(None) }
    }

    pub fn with_timeframe(mut self, timeframe: Timeframe) -> Self {
        self.timeframe = timeframe;
        self
    }

    pub fn is_active(&self) -> bool {
        self.channel.lock().is_some()
    }

    /// Push an event into the active channel. Returns ChannelClosed when not playing
    /// or when the channel was closed.
    pub async fn send(&self, event: Event) -> Result<()> {
        // clone the handle out, never hold the lock across .await
        let channel = self.channel.lock().clone();
        match channel {
            Some(ch) => ch.send(event).await,
            None => Err(EngineError::ChannelClosed),
        }
    }
}

#[async_trait]
impl Feed for LiveFeed {
    fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    async fn play(&self, channel: Arc<EventChannel>) -> Result<()> {
        info!(timeframe = %channel.timeframe(), interval_ms = self.heartbeat.interval.as_millis() as u64, "live feed started");
        *self.channel.lock() = Some(channel.clone());
        let beats = self.heartbeat.run(channel).await;
        self.channel.lock().take();
        info!(beats, "live feed stopped");
        Ok(())
    }
}
