//! Prometheus Metrics Module
//!
//! Exposes pool and stream metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Sessions**: Opens, closes by reason, open failures, open latency
//! - **Coalescing**: Acquisitions that joined an in-flight open
//! - **Streams**: Active subscriber streams, updates emitted, faults
//! - **Capacity**: Evictions blocked because every session was pinned
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are safe to call before [`init_metrics`]; the `metrics` facade
//! discards samples until a recorder is installed.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Session lifecycle
    describe_counter!(
        "price_pool_sessions_opened_total",
        "Total watcher sessions opened"
    );
    describe_counter!(
        "price_pool_sessions_closed_total",
        "Total watcher sessions closed by reason"
    );
    describe_counter!(
        "price_pool_open_failures_total",
        "Total failed watcher opens"
    );
    describe_gauge!(
        "price_pool_open_sessions",
        "Number of sessions currently held by the pool"
    );
    describe_histogram!(
        "price_pool_open_seconds",
        "Time to open a watcher session"
    );

    // Coalescing
    describe_counter!(
        "price_pool_coalesced_waits_total",
        "Total acquisitions that joined an in-flight open"
    );

    // Streams
    describe_gauge!(
        "price_pool_active_streams",
        "Number of active subscriber streams"
    );
    describe_counter!(
        "price_pool_updates_emitted_total",
        "Total throttled price updates delivered to subscribers"
    );
    describe_counter!(
        "price_pool_faults_total",
        "Total fault notifications delivered to subscribers"
    );

    // Capacity
    describe_counter!(
        "price_pool_overflow_total",
        "Total times the pool stayed above capacity because every session was pinned"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Grace period elapsed with no subscribers.
    Grace,
    /// Evicted to bring the pool back within capacity.
    Evicted,
    /// Pool shutdown.
    Shutdown,
}

impl CloseReason {
    /// Label value for this reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Grace => "grace",
            Self::Evicted => "evicted",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Record a successful session open and how long it took.
pub fn record_session_opened(elapsed: Duration) {
    counter!("price_pool_sessions_opened_total").increment(1);
    histogram!("price_pool_open_seconds").record(elapsed.as_secs_f64());
}

/// Record a session close.
pub fn record_session_closed(reason: CloseReason) {
    counter!(
        "price_pool_sessions_closed_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record a failed session open.
pub fn record_open_failure() {
    counter!("price_pool_open_failures_total").increment(1);
}

/// Record an acquisition that joined an in-flight open.
pub fn record_coalesced_wait() {
    counter!("price_pool_coalesced_waits_total").increment(1);
}

/// Update the open session count.
#[allow(clippy::cast_precision_loss)]
pub fn set_open_sessions(count: usize) {
    gauge!("price_pool_open_sessions").set(count as f64);
}

/// Update the active stream count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_streams(count: usize) {
    gauge!("price_pool_active_streams").set(count as f64);
}

/// Record a price update delivered to a subscriber.
pub fn record_update_emitted() {
    counter!("price_pool_updates_emitted_total").increment(1);
}

/// Record a fault delivered to a subscriber.
pub fn record_fault() {
    counter!("price_pool_faults_total").increment(1);
}

/// Record that eviction could not bring the pool within capacity.
pub fn record_overflow() {
    counter!("price_pool_overflow_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================
