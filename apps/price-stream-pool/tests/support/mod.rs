//! Shared fixtures for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use price_stream_pool::{
    EventHub, PoolConfig, ResourceHandle, ResourcePool, StreamConfig, StreamDriver,
    SubscriptionKey, WatchedResource, Watcher, WatcherError,
};

/// Parse a key that is known to be valid.
pub fn key(raw: &str) -> SubscriptionKey {
    SubscriptionKey::parse(raw).unwrap()
}

/// Watcher double that counts opens and closes and exposes one hub per key.
#[derive(Default)]
pub struct FakeWatcher {
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
    failing: AtomicBool,
    open_delay: Mutex<Duration>,
    close_delay: Mutex<Duration>,
    hubs: Mutex<HashMap<SubscriptionKey, EventHub>>,
}

impl FakeWatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_open_delay(delay: Duration) -> Arc<Self> {
        let watcher = Self::default();
        *watcher.open_delay.lock() = delay;
        Arc::new(watcher)
    }

    /// Make every handle opened from now on take `delay` to close.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock() = delay;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Completed handle closes.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Hub of the most recent open for `key`.
    pub fn hub(&self, key: &SubscriptionKey) -> EventHub {
        self.hubs.lock().get(key).cloned().expect("key was never opened")
    }

    pub fn publish(&self, key: &SubscriptionKey, value: f64) -> usize {
        self.hub(key).publish_update(value)
    }

    pub fn fault(&self, key: &SubscriptionKey, message: &str) -> usize {
        self.hub(key).publish_fault(message)
    }
}

#[async_trait]
impl Watcher for FakeWatcher {
    async fn open(&self, key: &SubscriptionKey) -> Result<WatchedResource, WatcherError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(WatcherError::OpenFailed {
                key: key.clone(),
                reason: "price element not found".to_string(),
            });
        }

        let hub = EventHub::new();
        self.hubs.lock().insert(key.clone(), hub.clone());
        Ok(WatchedResource::new(
            Box::new(FakeHandle {
                closes: Arc::clone(&self.closes),
                closed: AtomicBool::new(false),
                delay: *self.close_delay.lock(),
            }),
            Arc::new(hub),
        ))
    }
}

struct FakeHandle {
    closes: Arc<AtomicUsize>,
    closed: AtomicBool,
    delay: Duration,
}

#[async_trait]
impl ResourceHandle for FakeHandle {
    async fn close(&self) -> Result<(), WatcherError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn pool(watcher: &Arc<FakeWatcher>, capacity: usize, grace: Duration) -> ResourcePool {
    ResourcePool::new(
        Arc::clone(watcher) as Arc<dyn Watcher>,
        PoolConfig::default()
            .with_capacity(capacity)
            .with_grace_period(grace),
    )
}

pub fn driver(watcher: &Arc<FakeWatcher>) -> StreamDriver {
    StreamDriver::new(
        pool(watcher, 6, Duration::from_secs(10)),
        StreamConfig::default(),
    )
}
