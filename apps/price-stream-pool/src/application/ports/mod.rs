//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Watcher`: opens one live-data resource per subscription key
//! - `ResourceHandle`: exclusive ownership of an opened resource
//! - `EventSource`: listener registration for `update` / `fault` events
//!
//! The pool never looks inside a resource. It only opens it, attaches
//! listeners to its event source, and closes it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::subscription::SubscriptionKey;

// =============================================================================
// Events
// =============================================================================

/// Event pushed by a watcher.
#[derive(Debug, Clone, PartialEq)]
pub enum WatcherEvent {
    /// A new value was observed.
    Update(f64),
    /// The resource reported a non-fatal error.
    Fault(String),
}

/// Callback invoked for every event of a source.
///
/// Listeners run on the publisher's thread and must not block.
pub type Listener = Arc<dyn Fn(&WatcherEvent) + Send + Sync>;

/// Handle returned by [`EventSource::subscribe`].
///
/// Detaches the listener on [`Unsubscribe::unsubscribe`] or on drop,
/// whichever happens first. Detaching twice is impossible by construction.
#[must_use = "dropping the handle detaches the listener immediately"]
pub struct Unsubscribe {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Unsubscribe {
    /// Create a handle that runs `detach` exactly once.
    pub fn new(detach: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// Create a handle with nothing to detach.
    pub fn noop() -> Self {
        Self { detach: None }
    }

    /// Detach the listener now.
    pub fn unsubscribe(mut self) {
        self.run();
    }

    /// Check whether the listener is still attached through this handle.
    #[must_use]
    pub const fn is_attached(&self) -> bool {
        self.detach.is_some()
    }

    fn run(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Source of `update` / `fault` events for one opened resource.
///
/// Must be safe to subscribe and unsubscribe from many subscribers that
/// share the same session.
pub trait EventSource: Send + Sync {
    /// Register a listener; the returned handle detaches it.
    fn subscribe(&self, listener: Listener) -> Unsubscribe;
}

// =============================================================================
// Resources
// =============================================================================

/// Exclusive ownership of one externally opened resource.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceHandle: Send + Sync {
    /// Close the resource.
    ///
    /// Implementations must tolerate repeated calls. Errors are reported
    /// for logging only; callers never retry.
    async fn close(&self) -> Result<(), WatcherError>;
}

/// An opened resource together with its event source.
pub struct WatchedResource {
    /// Ownership of the resource.
    pub handle: Box<dyn ResourceHandle>,
    /// Events pushed by the resource.
    pub events: Arc<dyn EventSource>,
}

impl WatchedResource {
    /// Bundle a handle and its event source.
    #[must_use]
    pub fn new(handle: Box<dyn ResourceHandle>, events: Arc<dyn EventSource>) -> Self {
        Self { handle, events }
    }
}

impl fmt::Debug for WatchedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchedResource").finish_non_exhaustive()
    }
}

/// Opens live-data resources by key.
///
/// Implementations own their retry policy; the pool calls `open` once
/// per cold acquisition and treats any error as final.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Open the resource for `key`.
    async fn open(&self, key: &SubscriptionKey) -> Result<WatchedResource, WatcherError>;
}

#[async_trait]
impl<W: Watcher + ?Sized> Watcher for Arc<W> {
    async fn open(&self, key: &SubscriptionKey) -> Result<WatchedResource, WatcherError> {
        (**self).open(key).await
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Watcher and resource errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatcherError {
    /// The resource could not be opened.
    #[error("failed to open {key}: {reason}")]
    OpenFailed {
        /// Key being opened.
        key: SubscriptionKey,
        /// Collaborator-specific reason.
        reason: String,
    },
    /// An open attempt did not finish in time.
    #[error("opening {key} timed out after {}ms", .after.as_millis())]
    Timeout {
        /// Key being opened.
        key: SubscriptionKey,
        /// Per-attempt timeout.
        after: Duration,
    },
    /// The watcher itself has been shut down.
    #[error("watcher is closed")]
    Closed,
    /// Any other failure (including close errors).
    #[error("{0}")]
    Other(String),
}

// =============================================================================
// Tests
// =============================================================================
