//! Event Fan-Out
//!
//! Implements the `EventSource` port as a listener registry: a watcher
//! publishes each update or fault once and every attached listener is
//! invoked with it.
//!
//! # Architecture
//!
//! One `EventHub` exists per opened resource. Stream drivers attach through
//! [`EventSource::subscribe`] and detach by dropping or calling the returned
//! [`Unsubscribe`] handle. Publishing takes a snapshot of the listeners
//! first, so a listener may detach itself (or others) while being invoked.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::application::ports::{EventSource, Listener, Unsubscribe, WatcherEvent};

// =============================================================================
// Event Hub
// =============================================================================

#[derive(Default)]
struct Registry {
    listeners: RwLock<BTreeMap<u64, Listener>>,
    next_id: AtomicU64,
    updates_published: AtomicU64,
    faults_published: AtomicU64,
    attached_total: AtomicU64,
    detached_total: AtomicU64,
}

/// Listener registry for one resource's events.
///
/// Cloning is cheap; clones share the same listeners.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use price_stream_pool::application::ports::{EventSource, WatcherEvent};
/// use price_stream_pool::infrastructure::broadcast::EventHub;
///
/// let hub = EventHub::new();
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&seen);
///
/// let handle = hub.subscribe(Arc::new(move |event: &WatcherEvent| {
///     if matches!(event, WatcherEvent::Update(_)) {
///         counter.fetch_add(1, Ordering::SeqCst);
///     }
/// }));
///
/// assert_eq!(hub.publish_update(101.25), 1);
/// handle.unsubscribe();
/// assert_eq!(hub.publish_update(101.50), 0);
/// assert_eq!(seen.load(Ordering::SeqCst), 1);
/// ```
#[derive(Clone, Default)]
pub struct EventHub {
    registry: Arc<Registry>,
}

impl EventHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every attached listener.
    ///
    /// Returns the number of listeners invoked.
    pub fn publish(&self, event: &WatcherEvent) -> usize {
        match event {
            WatcherEvent::Update(_) => &self.registry.updates_published,
            WatcherEvent::Fault(_) => &self.registry.faults_published,
        }
        .fetch_add(1, Ordering::Relaxed);

        let listeners: Vec<Listener> = self.registry.listeners.read().values().cloned().collect();
        for listener in &listeners {
            listener(event);
        }
        listeners.len()
    }

    /// Deliver a price update.
    pub fn publish_update(&self, value: f64) -> usize {
        self.publish(&WatcherEvent::Update(value))
    }

    /// Deliver a fault.
    pub fn publish_fault(&self, message: impl Into<String>) -> usize {
        self.publish(&WatcherEvent::Fault(message.into()))
    }

    /// Number of attached listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.registry.listeners.read().len()
    }

    /// Detach every listener.
    ///
    /// Outstanding [`Unsubscribe`] handles become no-ops.
    pub fn clear(&self) {
        let removed = {
            let mut listeners = self.registry.listeners.write();
            let removed = listeners.len();
            listeners.clear();
            removed
        };
        self.registry
            .detached_total
            .fetch_add(removed as u64, Ordering::Relaxed);
    }

    /// Get statistics about the hub.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            listeners: self.listener_count(),
            updates_published: self.registry.updates_published.load(Ordering::Relaxed),
            faults_published: self.registry.faults_published.load(Ordering::Relaxed),
            attached_total: self.registry.attached_total.load(Ordering::Relaxed),
            detached_total: self.registry.detached_total.load(Ordering::Relaxed),
        }
    }
}

impl EventSource for EventHub {
    fn subscribe(&self, listener: Listener) -> Unsubscribe {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.listeners.write().insert(id, listener);
        self.registry.attached_total.fetch_add(1, Ordering::Relaxed);

        let registry: Weak<Registry> = Arc::downgrade(&self.registry);
        Unsubscribe::new(move || {
            if let Some(registry) = registry.upgrade()
                && registry.listeners.write().remove(&id).is_some()
            {
                registry.detached_total.fetch_add(1, Ordering::Relaxed);
            }
        })
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Statistics about an event hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Currently attached listeners.
    pub listeners: usize,
    /// Updates published since creation.
    pub updates_published: u64,
    /// Faults published since creation.
    pub faults_published: u64,
    /// Listeners ever attached.
    pub attached_total: u64,
    /// Listeners ever detached.
    pub detached_total: u64,
}

// =============================================================================
// Tests
// =============================================================================
