//! Election and heartbeat timers. Expirations are never handled in the timer
//! task itself: each fire is enqueued as an `Event` and consumed by the node
//! loop. A reset bumps the epoch counter, which orphans any pending fire;
//! both the firing task and the handler compare epochs to discard stale shots.

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::consensus::types::Event;

pub struct ElectionTimer {
    epoch: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<Event>,
    min: Duration,
    max: Duration,
}

impl ElectionTimer {
    pub fn new(events: mpsc::UnboundedSender<Event>, min: Duration, max: Duration) -> Self {
        Self {
            epoch: Arc::new(AtomicU64::new(0)),
            events,
            min,
            max,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Schedule a fresh randomized timeout, cancelling any pending one.
    pub fn reset(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.random_delay();
        let current = Arc::clone(&self.epoch);
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if current.load(Ordering::SeqCst) == epoch {
                let _ = events.send(Event::ElectionTimeout { epoch });
            }
        });
    }

    /// Cancel without rescheduling (leaders don't run election timers).
    pub fn cancel(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn random_delay(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

pub struct HeartbeatTimer {
    epoch: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<Event>,
    interval: Duration,
}

impl HeartbeatTimer {
    pub fn new(events: mpsc::UnboundedSender<Event>, interval: Duration) -> Self {
        Self {
            epoch: Arc::new(AtomicU64::new(0)),
            events,
            interval,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.interval;
        let current = Arc::clone(&self.epoch);
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if current.load(Ordering::SeqCst) == epoch {
                let _ = events.send(Event::HeartbeatTimeout { epoch });
            }
        });
    }

    pub fn cancel(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}
