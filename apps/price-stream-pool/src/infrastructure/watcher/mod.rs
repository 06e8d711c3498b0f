//! Watcher Adapters
//!
//! Implementations of the `Watcher` port.
//!
//! - `SimulatedWatcher`: random-walk feed used by the binary
//! - `RetryingWatcher`: decorator adding per-attempt timeouts and backoff

pub mod retry;
pub mod simulated;

pub use retry::{RetryConfig, RetryPolicy, RetryingWatcher};
pub use simulated::{SimulatedWatcher, SimulationConfig};
