//! Simulated Price Watcher
//!
//! A `Watcher` that produces a random-walk price per key at irregular
//! intervals, with optional fault injection. The shipped binary uses it in
//! place of a real page-scraping collaborator; it is also handy for load
//! testing the pool and the throttle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ResourceHandle, WatchedResource, Watcher, WatcherError};
use crate::domain::subscription::SubscriptionKey;
use crate::infrastructure::broadcast::EventHub;
use crate::infrastructure::config::SimulationSettings;

/// Largest relative move per tick.
const MAX_STEP: f64 = 0.002;

/// Feed timing and fault injection.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    /// Shortest interval between ticks.
    pub tick_min: Duration,
    /// Longest interval between ticks.
    pub tick_max: Duration,
    /// Probability that a tick is a fault instead of a price.
    pub fault_rate: f64,
    /// Simulated time to open a feed.
    pub open_delay: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_min: Duration::from_millis(50),
            tick_max: Duration::from_millis(750),
            fault_rate: 0.0,
            open_delay: Duration::from_millis(250),
        }
    }
}

impl From<&SimulationSettings> for SimulationConfig {
    fn from(settings: &SimulationSettings) -> Self {
        Self {
            tick_min: settings.tick_min,
            tick_max: settings.tick_max,
            fault_rate: settings.fault_rate,
            ..Self::default()
        }
    }
}

/// Watcher backed by an in-process random walk.
#[derive(Debug)]
pub struct SimulatedWatcher {
    config: SimulationConfig,
    shutdown: CancellationToken,
    feeds_started: AtomicU64,
}

impl SimulatedWatcher {
    /// Create a watcher.
    #[must_use]
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            feeds_started: AtomicU64::new(0),
        }
    }

    /// Stop every running feed and refuse new opens.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Feeds started since creation.
    #[must_use]
    pub fn feeds_started(&self) -> u64 {
        self.feeds_started.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Watcher for SimulatedWatcher {
    async fn open(&self, key: &SubscriptionKey) -> Result<WatchedResource, WatcherError> {
        if self.shutdown.is_cancelled() {
            return Err(WatcherError::Closed);
        }

        tokio::select! {
            () = self.shutdown.cancelled() => return Err(WatcherError::Closed),
            () = tokio::time::sleep(self.config.open_delay) => {}
        }

        let hub = EventHub::new();
        let cancel = self.shutdown.child_token();
        let feed = Feed {
            key: key.clone(),
            hub: hub.clone(),
            cancel: cancel.clone(),
            config: self.config.clone(),
            price: initial_price(key),
        };
        tokio::spawn(feed.run());
        self.feeds_started.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(key = %key, "Simulated feed started");
        Ok(WatchedResource::new(
            Box::new(FeedHandle {
                key: key.clone(),
                cancel,
            }),
            Arc::new(hub),
        ))
    }
}

/// Deterministic starting price so a key always starts near the same level.
fn initial_price(key: &SubscriptionKey) -> f64 {
    let seed: u32 = key.as_str().bytes().map(u32::from).sum();
    f64::from(seed % 900 + 100)
}

struct Feed {
    key: SubscriptionKey,
    hub: EventHub,
    cancel: CancellationToken,
    config: SimulationConfig,
    price: f64,
}

impl Feed {
    async fn run(mut self) {
        let mut rng = StdRng::from_rng(&mut rand::rng());
        let fault_rate = self.config.fault_rate.clamp(0.0, 1.0);
        let min_ms = duration_millis(self.config.tick_min);
        let max_ms = duration_millis(self.config.tick_max).max(min_ms);

        loop {
            let wait = Duration::from_millis(rng.random_range(min_ms..=max_ms));
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }

            if rng.random_bool(fault_rate) {
                self.hub.publish_fault("simulated feed glitch");
                continue;
            }

            let step = rng.random_range(-MAX_STEP..=MAX_STEP);
            self.price = ((self.price * (1.0 + step)) * 100.0).round() / 100.0;
            self.hub.publish_update(self.price);
        }

        self.hub.clear();
        tracing::debug!(key = %self.key, "Simulated feed stopped");
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

struct FeedHandle {
    key: SubscriptionKey,
    cancel: CancellationToken,
}

#[async_trait]
impl ResourceHandle for FeedHandle {
    async fn close(&self) -> Result<(), WatcherError> {
        if !self.cancel.is_cancelled() {
            tracing::debug!(key = %self.key, "Stopping simulated feed");
            self.cancel.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::application::ports::{Listener, Unsubscribe, WatcherEvent};

    fn key(raw: &str) -> SubscriptionKey {
        SubscriptionKey::parse(raw).unwrap()
    }

    fn fast(fault_rate: f64) -> SimulationConfig {
        SimulationConfig {
            tick_min: Duration::from_millis(10),
            tick_max: Duration::from_millis(20),
            fault_rate,
            open_delay: Duration::from_millis(5),
        }
    }

    fn record(resource: &WatchedResource) -> (Arc<Mutex<Vec<WatcherEvent>>>, Unsubscribe) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let listener: Listener =
            Arc::new(move |event: &WatcherEvent| sink.lock().push(event.clone()));
        let handle = resource.events.subscribe(listener);
        (events, handle)
    }

    #[test]
    fn initial_price_is_stable_per_key() {
        let upper = initial_price(&key("BTCUSDT"));
        let lower = initial_price(&key("btcusdt"));
        assert!((upper - lower).abs() < f64::EPSILON);
        let price = initial_price(&key("ETHUSDT"));
        assert!((100.0..1000.0).contains(&price));
    }

    #[tokio::test(start_paused = true)]
    async fn feed_publishes_updates_until_closed() {
        let watcher = SimulatedWatcher::new(fast(0.0));
        let resource = watcher.open(&key("BTCUSDT")).await.unwrap();
        let (events, _handle) = record(&resource);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let seen = events.lock().len();
        assert!(seen > 10, "only {seen} events");
        assert!(events.lock().iter().all(|e| matches!(e, WatcherEvent::Update(_))));

        resource.handle.close().await.unwrap();
        resource.handle.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let after_close = events.lock().len();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(events.lock().len(), after_close);
        assert_eq!(watcher.feeds_started(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_fault_rate_only_publishes_faults() {
        let watcher = SimulatedWatcher::new(fast(1.0));
        let resource = watcher.open(&key("SOLUSDT")).await.unwrap();
        let (events, _handle) = record(&resource);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let events = events.lock();
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| matches!(e, WatcherEvent::Fault(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_refuses_new_opens() {
        let watcher = SimulatedWatcher::new(fast(0.0));
        watcher.shutdown();
        assert_eq!(
            watcher.open(&key("BTCUSDT")).await.unwrap_err(),
            WatcherError::Closed
        );
    }
}
