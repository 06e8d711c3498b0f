//! Price Streaming Types
//!
//! Core types for the per-subscriber output stream: the records handed to
//! subscribers, the single-slot latest-value cell, and the throttle that
//! decides when the next record may go out.
//!
//! # Latest-value semantics
//!
//! Upstream watchers push updates at whatever rate the page produces them.
//! Subscribers get at most one record per `min_gap`, and that record always
//! carries the freshest value observed so far. Values that arrive while the
//! throttle window is closed overwrite each other in the cell; they are
//! never queued.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::domain::subscription::SubscriptionKey;

// =============================================================================
// Stream Records
// =============================================================================

/// A price handed to one subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceUpdate {
    /// Subscription key the value belongs to.
    pub key: SubscriptionKey,
    /// Observed value.
    pub value: f64,
    /// Wall-clock emission time.
    pub timestamp: DateTime<Utc>,
}

impl PriceUpdate {
    /// Create a record stamped with the current time.
    #[must_use]
    pub fn now(key: SubscriptionKey, value: f64) -> Self {
        Self {
            key,
            value,
            timestamp: Utc::now(),
        }
    }

    /// Emission time as Unix milliseconds.
    #[must_use]
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// A non-fatal upstream fault forwarded to one subscriber.
///
/// Faults do not end the stream and do not affect other subscribers of
/// the same session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultNotification {
    /// Subscription key of the faulting session.
    pub key: SubscriptionKey,
    /// Message reported by the watcher.
    pub message: String,
}

/// Item yielded by a subscriber's stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StreamEvent {
    /// A throttled price update.
    Price(PriceUpdate),
    /// An out-of-band fault notification.
    Fault(FaultNotification),
}

impl StreamEvent {
    /// Get the price update, if this is one.
    #[must_use]
    pub const fn as_price(&self) -> Option<&PriceUpdate> {
        match self {
            Self::Price(update) => Some(update),
            Self::Fault(_) => None,
        }
    }

    /// Get the fault notification, if this is one.
    #[must_use]
    pub const fn as_fault(&self) -> Option<&FaultNotification> {
        match self {
            Self::Price(_) => None,
            Self::Fault(fault) => Some(fault),
        }
    }
}

/// Lifecycle of one subscription's stream driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverState {
    /// Listener attached, emitting values.
    Attached,
    /// Cancellation observed, cleanup in progress.
    Draining,
    /// Listener detached and session released.
    Closed,
}

// =============================================================================
// Latest Value Cell
// =============================================================================

/// Single-slot cell holding the most recent unsent value.
///
/// Written by the event-source listener (any thread), drained by the
/// stream driver.
#[derive(Debug, Default)]
pub struct LatestValue {
    slot: Mutex<Slot>,
}

#[derive(Debug, Default)]
struct Slot {
    value: Option<f64>,
    superseded: u64,
}

impl LatestValue {
    /// Create an empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, overwriting any unsent one.
    ///
    /// Returns the overwritten value, if any.
    pub fn store(&self, value: f64) -> Option<f64> {
        let mut slot = self.slot.lock();
        let previous = slot.value.replace(value);
        if previous.is_some() {
            slot.superseded += 1;
        }
        previous
    }

    /// Take the pending value, leaving the cell empty.
    pub fn take(&self) -> Option<f64> {
        self.slot.lock().value.take()
    }

    /// Check whether a value is pending.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.slot.lock().value.is_some()
    }

    /// Number of values overwritten before they could be sent.
    #[must_use]
    pub fn superseded(&self) -> u64 {
        self.slot.lock().superseded
    }
}

// =============================================================================
// Throttle
// =============================================================================

/// What the stream driver should do next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThrottleDecision {
    /// Hand this value to the subscriber now.
    Emit(f64),
    /// A value is pending but the window is closed until this instant.
    WaitUntil(Instant),
    /// Nothing pending.
    Idle,
}

/// Enforces the minimum gap between two records for one subscriber.
#[derive(Debug, Clone)]
pub struct Throttle {
    min_gap: Duration,
    last_sent: Option<Instant>,
}

impl Throttle {
    /// Create a throttle with the given minimum gap.
    #[must_use]
    pub const fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last_sent: None,
        }
    }

    /// Minimum gap between two emissions.
    #[must_use]
    pub const fn min_gap(&self) -> Duration {
        self.min_gap
    }

    /// Time of the last emission, if any.
    #[must_use]
    pub const fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    /// Earliest instant at which the next emission is allowed.
    #[must_use]
    pub fn opens_at(&self) -> Option<Instant> {
        self.last_sent.map(|sent| sent + self.min_gap)
    }

    /// Decide the next step given the cell contents at `now`.
    ///
    /// On [`ThrottleDecision::Emit`] the value is taken out of the cell and
    /// `now` becomes the new last-sent time.
    pub fn poll(&mut self, now: Instant, cell: &LatestValue) -> ThrottleDecision {
        if !cell.is_pending() {
            return ThrottleDecision::Idle;
        }

        if let Some(opens_at) = self.opens_at()
            && now < opens_at
        {
            return ThrottleDecision::WaitUntil(opens_at);
        }

        match cell.take() {
            Some(value) => {
                self.last_sent = Some(now);
                ThrottleDecision::Emit(value)
            }
            None => ThrottleDecision::Idle,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SubscriptionKey {
        SubscriptionKey::parse("BTCUSDT").unwrap()
    }

    #[test]
    fn latest_value_overwrites() {
        let cell = LatestValue::new();
        assert_eq!(cell.store(1.0), None);
        assert_eq!(cell.store(2.0), Some(1.0));
        assert_eq!(cell.store(3.0), Some(2.0));
        assert_eq!(cell.superseded(), 2);
        assert_eq!(cell.take(), Some(3.0));
        assert_eq!(cell.take(), None);
        assert!(!cell.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn first_value_emits_immediately() {
        let cell = LatestValue::new();
        let mut throttle = Throttle::new(Duration::from_millis(200));

        cell.store(10.0);
        let now = Instant::now();
        assert_eq!(throttle.poll(now, &cell), ThrottleDecision::Emit(10.0));
        assert_eq!(throttle.last_sent(), Some(now));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_cell_is_idle() {
        let cell = LatestValue::new();
        let mut throttle = Throttle::new(Duration::from_millis(200));
        assert_eq!(throttle.poll(Instant::now(), &cell), ThrottleDecision::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn value_inside_window_waits_for_window() {
        let cell = LatestValue::new();
        let mut throttle = Throttle::new(Duration::from_millis(200));
        let start = Instant::now();

        cell.store(10.0);
        assert_eq!(throttle.poll(start, &cell), ThrottleDecision::Emit(10.0));

        cell.store(11.0);
        let now = start + Duration::from_millis(50);
        assert_eq!(
            throttle.poll(now, &cell),
            ThrottleDecision::WaitUntil(start + Duration::from_millis(200))
        );
        // Still pending: nothing was consumed while waiting.
        assert!(cell.is_pending());

        cell.store(12.0);
        let reopened = start + Duration::from_millis(200);
        assert_eq!(throttle.poll(reopened, &cell), ThrottleDecision::Emit(12.0));
    }

    #[tokio::test(start_paused = true)]
    async fn exact_gap_boundary_emits() {
        let cell = LatestValue::new();
        let mut throttle = Throttle::new(Duration::from_millis(200));
        let start = Instant::now();

        cell.store(1.0);
        let _ = throttle.poll(start, &cell);
        cell.store(2.0);
        assert_eq!(
            throttle.poll(start + Duration::from_millis(200), &cell),
            ThrottleDecision::Emit(2.0)
        );
    }

    #[test]
    fn stream_event_accessors() {
        let price = StreamEvent::Price(PriceUpdate::now(key(), 1.5));
        assert!(price.as_price().is_some());
        assert!(price.as_fault().is_none());

        let fault = StreamEvent::Fault(FaultNotification {
            key: key(),
            message: "page crashed".to_string(),
        });
        assert_eq!(fault.as_fault().unwrap().message, "page crashed");
        assert!(fault.as_price().is_none());
    }

    #[test]
    fn stream_event_serialization_is_tagged() {
        let fault = StreamEvent::Fault(FaultNotification {
            key: key(),
            message: "boom".to_string(),
        });
        let json = serde_json::to_value(&fault).unwrap();
        assert_eq!(json["kind"], "fault");
        assert_eq!(json["key"], "BTCUSDT");
    }

    #[test]
    fn driver_state_serialization() {
        assert_eq!(
            serde_json::to_string(&DriverState::Draining).unwrap(),
            "\"draining\""
        );
    }
}
