//! Open Coalescing
//!
//! Deduplicates concurrent "open" operations for the same key into one
//! in-flight future. The first caller for a key starts the operation;
//! every caller that arrives before it is finished joins it and receives
//! a clone of the same result.
//!
//! Each entry counts its waiters. A waiter that gives up leaves the entry
//! without affecting the operation, and whoever completes the operation
//! learns how many waiters are still attached when it calls
//! [`Coalescer::finish`].
//!
//! The coalescer does no locking of its own. It lives inside the pool's
//! state, so checking for an entry and inserting one happen in the same
//! critical section as the session-map lookup.

use std::collections::HashMap;
use std::hash::Hash;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

/// The shared future every waiter of one open awaits.
pub type SharedOpen<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// A caller's view of an in-flight open.
#[derive(Clone)]
pub struct Pending<T, E> {
    id: u64,
    joined: bool,
    future: SharedOpen<T, E>,
}

impl<T: Clone, E: Clone> Pending<T, E> {
    /// Generation of the in-flight entry this caller is attached to.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// `true` if this caller joined an open started by someone else.
    #[must_use]
    pub const fn joined(&self) -> bool {
        self.joined
    }

    /// Get an awaitable clone of the shared open.
    #[must_use]
    pub fn future(&self) -> SharedOpen<T, E> {
        self.future.clone()
    }
}

impl<T, E> std::fmt::Debug for Pending<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("id", &self.id)
            .field("joined", &self.joined)
            .finish_non_exhaustive()
    }
}

struct InFlight<T, E> {
    pending: Pending<T, E>,
    waiters: usize,
}

/// Tracks at most one in-flight open per key.
pub struct Coalescer<K, T, E> {
    in_flight: HashMap<K, InFlight<T, E>>,
    next_id: u64,
    started: u64,
    joined: u64,
}

impl<K, T, E> Default for Coalescer<K, T, E> {
    fn default() -> Self {
        Self {
            in_flight: HashMap::new(),
            next_id: 0,
            started: 0,
            joined: 0,
        }
    }
}

impl<K, T, E> Coalescer<K, T, E>
where
    K: Eq + Hash + Clone,
    T: Clone,
    E: Clone,
{
    /// Create an empty coalescer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight open for `key`, or start one with `open`.
    ///
    /// `open` is invoked only when no entry exists for `key`, and receives
    /// the generation of the new entry.
    pub fn start_or_join<F>(&mut self, key: K, open: F) -> Pending<T, E>
    where
        F: FnOnce(u64) -> BoxFuture<'static, Result<T, E>>,
    {
        if let Some(existing) = self.in_flight.get_mut(&key) {
            existing.waiters += 1;
            self.joined += 1;
            return Pending {
                joined: true,
                ..existing.pending.clone()
            };
        }

        self.next_id += 1;
        self.started += 1;
        let pending = Pending {
            id: self.next_id,
            joined: false,
            future: open(self.next_id).shared(),
        };
        self.in_flight.insert(
            key,
            InFlight {
                pending: pending.clone(),
                waiters: 1,
            },
        );
        pending
    }

    /// Detach one waiter from generation `id` of `key`.
    ///
    /// Returns `false` if that generation is no longer in flight.
    pub fn leave(&mut self, key: &K, id: u64) -> bool {
        match self.in_flight.get_mut(key) {
            Some(current) if current.pending.id == id => {
                current.waiters = current.waiters.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    /// Remove generation `id` of `key`, returning its remaining waiters.
    ///
    /// Returns `None` if the entry was already removed or replaced.
    pub fn finish(&mut self, key: &K, id: u64) -> Option<usize> {
        match self.in_flight.get(key) {
            Some(current) if current.pending.id == id => {
                self.in_flight.remove(key).map(|entry| entry.waiters)
            }
            _ => None,
        }
    }

    /// Waiters attached to the in-flight open for `key`.
    #[must_use]
    pub fn waiters(&self, key: &K) -> usize {
        self.in_flight.get(key).map_or(0, |entry| entry.waiters)
    }

    /// Check whether an open is in flight for `key`.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Number of in-flight opens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    /// Check whether nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Total opens started.
    #[must_use]
    pub const fn started(&self) -> u64 {
        self.started
    }

    /// Total callers that joined an existing open.
    #[must_use]
    pub const fn joined(&self) -> u64 {
        self.joined
    }

    /// Forget every in-flight entry.
    ///
    /// Callers already awaiting a shared future keep their clone and still
    /// observe its result.
    pub fn clear(&mut self) {
        self.in_flight.clear();
    }
}
