// ===============================
// src/channel.rs
// ===============================
//
// Bounded SPSC transport between one feed (producer) and the runner (consumer).
//
// - Capacity bounded: `send` suspends while the buffer is full (backpressure).
// - Timeframe scoped: events before the timeframe are dropped, the first event at or
//   after its end closes the channel so a live feed can stop early.
// - `close()` is idempotent, callable from either side, and wakes every suspended
//   caller. Buffered events stay receivable after close; once drained, `receive`
//   fails with ChannelClosed.
//
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tracing::debug;

use crate::domain::{Event, Timeframe};
use crate::error::{EngineError, Result};
use crate::metrics::EVENTS_DROPPED;

pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<Event>,
    closed: bool,
}

#[derive(Debug)]
pub struct EventChannel {
    timeframe: Timeframe,
    capacity: usize,
    state: Mutex<State>,
    not_empty: Notify,
    not_full: Notify,
}

impl EventChannel {
    pub fn new(timeframe: Timeframe, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            timeframe,
            capacity,
            state: Mutex::new(State { queue: VecDeque::with_capacity(capacity), closed: false }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the channel accepts no further events (timeframe exhausted or closed).
    pub fn done(&self) -> bool {
        self.state.lock().closed
    }

    /// Push an event, suspending while the buffer is full.
    ///
    /// Events outside the timeframe are not delivered and do not fail the call.
    pub async fn send(&self, event: Event) -> Result<()> {
        if !self.timeframe.contains(event.time) {
            if event.time >= self.timeframe.end {
                debug!(time = %event.time, "event past timeframe end, closing channel");
                self.close();
            } else {
                EVENTS_DROPPED.inc();
            }
            return Ok(());
        }

        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            // register before inspecting state so a close/receive in between is not missed
            notified.as_mut().enable();
            {
                let mut st = self.state.lock();
                if st.closed {
                    return Err(EngineError::ChannelClosed);
                }
                if st.queue.len() < self.capacity {
                    st.queue.push_back(event);
                    drop(st);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Take the next event, suspending until one is available or the channel is closed.
    pub async fn receive(&self) -> Result<Event> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock();
                if let Some(event) = st.queue.pop_front() {
                    drop(st);
                    self.not_full.notify_one();
                    return Ok(event);
                }
                if st.closed {
                    return Err(EngineError::ChannelClosed);
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    use crate::domain::Timestamp;

    fn t(min: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::minutes(min)
    }

    fn tf() -> Timeframe {
        Timeframe::new(t(10), t(20))
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let ch = EventChannel::new(tf(), 10);
        for m in 10..15 {
            ch.send(Event::empty(t(m))).await.unwrap();
        }
        for m in 10..15 {
            assert_eq!(ch.receive().await.unwrap().time, t(m));
        }
    }

    #[test]
    fn capacity_is_at_least_one() {
        assert_eq!(EventChannel::new(tf(), 0).capacity(), 1);
        assert_eq!(EventChannel::new(tf(), DEFAULT_CAPACITY).capacity(), 100);
    }

    #[tokio::test]
    async fn send_suspends_when_full() {
        let ch = Arc::new(EventChannel::new(tf(), 2));
        ch.send(Event::empty(t(10))).await.unwrap();
        ch.send(Event::empty(t(11))).await.unwrap();

        let third = timeout(Duration::from_millis(50), ch.send(Event::empty(t(12)))).await;
        assert!(third.is_err(), "third send must suspend at capacity 2");

        let producer = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.send(Event::empty(t(12))).await })
        };
        sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(ch.receive().await.unwrap().time, t(10));
        producer.await.unwrap().unwrap();
        assert_eq!(ch.len(), 2);
    }

    #[tokio::test]
    async fn drops_events_outside_timeframe() {
        let ch = EventChannel::new(tf(), 10);
        ch.send(Event::empty(t(5))).await.unwrap();
        assert!(!ch.done());
        ch.send(Event::empty(t(15))).await.unwrap();
        assert_eq!(ch.len(), 1);

        // boundary event: not delivered, channel is done
        ch.send(Event::empty(t(20))).await.unwrap();
        assert!(ch.done());

        assert_eq!(ch.receive().await.unwrap().time, t(15));
        assert!(ch.receive().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let ch = EventChannel::new(tf(), 10);
        ch.close();
        ch.close();
        let err = ch.send(Event::empty(t(12))).await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn close_wakes_suspended_receive() {
        let ch = Arc::new(EventChannel::new(tf(), 10));
        let consumer = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.receive().await })
        };
        sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        ch.close();
        let res = timeout(Duration::from_secs(1), consumer).await.expect("receive must not hang");
        assert!(res.unwrap().unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn close_wakes_suspended_send() {
        let ch = Arc::new(EventChannel::new(tf(), 1));
        ch.send(Event::empty(t(10))).await.unwrap();
        let producer = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.send(Event::empty(t(11))).await })
        };
        sleep(Duration::from_millis(20)).await;

        ch.close();
        let res = timeout(Duration::from_secs(1), producer).await.expect("send must not hang");
        assert!(res.unwrap().unwrap_err().is_closed());

        // buffered event survives the close
        assert_eq!(ch.receive().await.unwrap().time, t(10));
    }
}
