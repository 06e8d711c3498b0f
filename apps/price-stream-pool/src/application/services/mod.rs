//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `ResourcePool`: Shares one watcher session per key, with grace-period
//!   close and capacity eviction
//! - `Coalescer`: Deduplicates concurrent opens of the same key
//! - `StreamDriver`: Throttled per-subscriber streams over pooled sessions
//! - `ScheduledTask`: Cancellable delayed work (grace timers)

pub mod coalescer;
pub mod driver;
pub mod pool;
pub mod schedule;

pub use coalescer::{Coalescer, Pending, SharedOpen};
pub use driver::{DEFAULT_IDLE_POLL, DEFAULT_MIN_GAP, PriceStream, StreamConfig, StreamDriver};
pub use pool::{
    DEFAULT_CAPACITY, DEFAULT_GRACE_PERIOD, PoolConfig, PoolError, PoolSnapshot, ResourcePool,
    Session, SessionSummary,
};
pub use schedule::ScheduledTask;
