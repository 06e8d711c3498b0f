#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_possible_truncation
    )
)]

//! Price Stream Pool - Pooled Live Price Watchers
//!
//! Shares a small, capacity-bounded set of expensive live-data watchers
//! (one per ticker) across many concurrent subscribers, and streams each
//! subscriber a throttled, latest-value view of its ticker.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `subscription`: Key validation and normalization
//!   - `streaming`: Price events, latest-value cell, throttle
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: The `Watcher` collaborator and its event source
//!   - `services`: Resource pool, open coalescing, stream driver
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `watcher`: Simulated feed and retrying decorator
//!   - `broadcast`: Listener fan-out per opened resource
//!   - `sse`: Server-sent events endpoint
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                        +--------------+
//!   Watcher (per key) -->|  EventHub    |--> listener --> LatestValue --+
//!                        +--------------+                                |
//!                              ^                                         v
//!                              |                               Throttle (min gap)
//!                   ResourcePool (refcounted,                            |
//!                   grace close, LRU eviction)                           v
//!                                                              PriceStream --> client
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{DriverState, FaultNotification, PriceUpdate, StreamEvent};
pub use domain::subscription::{InvalidKeyError, SubscriptionKey};

// Ports
pub use application::ports::{
    EventSource, Listener, ResourceHandle, Unsubscribe, WatchedResource, Watcher, WatcherError,
    WatcherEvent,
};

// Services
pub use application::services::{
    PoolConfig, PoolError, PoolSnapshot, PriceStream, ResourcePool, Session, StreamConfig,
    StreamDriver,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, ProxyConfig};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::sse::{StreamServer, StreamServerError, StreamServerState};

// Adapters
pub use infrastructure::broadcast::{EventHub, HubStats};
pub use infrastructure::watcher::{RetryingWatcher, SimulatedWatcher, SimulationConfig};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
