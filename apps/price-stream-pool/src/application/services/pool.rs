//! Resource Pool
//!
//! Owns at most one watcher session per subscription key and shares it
//! between every subscriber of that key.
//!
//! # Lifecycle
//!
//! ```text
//!  acquire (cold) ──► opening ──► open(ref>0) ◄──► idle(ref=0, grace timer)
//!                        │              │                    │
//!                        ▼              ▼                    ▼
//!                     failed     evicted / shutdown     grace elapsed
//!                                       └──────► closed ◄────┘
//! ```
//!
//! - Concurrent cold acquisitions of one key share a single open.
//! - When the last subscriber releases, the session stays warm for the
//!   grace period; re-acquiring inside it cancels the close.
//! - After every insertion, least-recently-touched sessions with no
//!   subscribers are evicted until the pool is back within capacity.
//!   Pinned sessions are never evicted, so the pool may stay above
//!   capacity while every session is in use.
//!
//! Opens run on their own task. A caller that stops waiting only detaches
//! from the open; the result still lands in the pool, with one reference
//! per caller still attached, or idle under a grace timer if none are.
//!
//! All bookkeeping lives behind one lock that is never held across an
//! `.await`. Watcher opens and closes always run outside it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use super::coalescer::{Coalescer, Pending};
use super::schedule::ScheduledTask;
use crate::application::ports::{
    EventSource, Listener, ResourceHandle, Unsubscribe, WatchedResource, Watcher,
};
use crate::domain::subscription::{InvalidKeyError, SubscriptionKey};
use crate::infrastructure::metrics::{self, CloseReason};

// =============================================================================
// Configuration
// =============================================================================

/// Default maximum number of sessions kept by the pool.
pub const DEFAULT_CAPACITY: usize = 6;

/// Default time an unused session stays open.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Pool sizing and timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Soft cap on the number of sessions.
    pub capacity: usize,
    /// How long a session with no subscribers stays open.
    pub grace_period: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl PoolConfig {
    /// Set the capacity.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the grace period.
    #[must_use]
    pub const fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

// =============================================================================
// Session
// =============================================================================

/// One opened watcher resource shared by every subscriber of its key.
pub struct Session {
    id: u64,
    key: SubscriptionKey,
    handle: Box<dyn ResourceHandle>,
    events: Arc<dyn EventSource>,
    opened_at: DateTime<Utc>,
    retired: AtomicBool,
    closed: AtomicBool,
}

impl Session {
    fn new(id: u64, key: SubscriptionKey, resource: WatchedResource) -> Self {
        Self {
            id,
            key,
            handle: resource.handle,
            events: resource.events,
            opened_at: Utc::now(),
            retired: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Pool-unique session id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Key this session watches.
    #[must_use]
    pub const fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Event source of the underlying resource.
    #[must_use]
    pub fn events(&self) -> Arc<dyn EventSource> {
        Arc::clone(&self.events)
    }

    /// Attach a listener to the session's event source.
    pub fn subscribe(&self, listener: Listener) -> Unsubscribe {
        self.events.subscribe(listener)
    }

    /// When the session was opened.
    #[must_use]
    pub const fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Check whether the underlying resource has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the session as removed from the pool. Called under the pool lock.
    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Close the resource. Only the first call reaches the handle.
    async fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::info!(
            key = %self.key,
            session_id = self.id,
            reason = reason.as_str(),
            "Closing watcher session"
        );
        if let Err(e) = self.handle.close().await {
            tracing::warn!(key = %self.key, session_id = self.id, error = %e, "Watcher close failed");
        }
        metrics::record_session_closed(reason);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("opened_at", &self.opened_at)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Pool State
// =============================================================================

struct PendingClose {
    ticket: u64,
    _task: ScheduledTask,
}

struct PoolEntry {
    session: Arc<Session>,
    /// Coalescer generation whose open produced the session.
    origin: u64,
    ref_count: usize,
    last_touched: u64,
    pending_close: Option<PendingClose>,
}

#[derive(Default)]
struct PoolState {
    sessions: HashMap<SubscriptionKey, PoolEntry>,
    opening: Coalescer<SubscriptionKey, Arc<Session>, PoolError>,
    clock: u64,
    next_ticket: u64,
    last_error: Option<String>,
    shut_down: bool,
}

impl PoolState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// Take another reference on an existing session, cancelling any
    /// pending grace close.
    fn reuse(&mut self, key: &SubscriptionKey) -> Option<Arc<Session>> {
        let now = self.tick();
        let entry = self.sessions.get_mut(key)?;
        entry.ref_count += 1;
        entry.last_touched = now;
        if entry.pending_close.take().is_some() {
            tracing::debug!(key = %key, session_id = entry.session.id(), "Grace close cancelled");
        }
        Some(Arc::clone(&entry.session))
    }

    fn insert(&mut self, session: Arc<Session>, origin: u64, ref_count: usize) {
        let now = self.tick();
        self.sessions.insert(
            session.key().clone(),
            PoolEntry {
                session,
                origin,
                ref_count,
                last_touched: now,
                pending_close: None,
            },
        );
    }

    /// Remove unpinned sessions, least recently touched first, until the
    /// pool is within `capacity`.
    fn evict(&mut self, capacity: usize) -> Vec<Arc<Session>> {
        if self.sessions.len() <= capacity {
            return Vec::new();
        }

        let mut order: Vec<(u64, SubscriptionKey)> = self
            .sessions
            .iter()
            .filter(|(_, entry)| entry.ref_count == 0)
            .map(|(key, entry)| (entry.last_touched, key.clone()))
            .collect();
        order.sort_unstable_by_key(|(touched, _)| *touched);

        let mut evicted = Vec::new();
        for (_, key) in order {
            if self.sessions.len() <= capacity {
                break;
            }
            if let Some(entry) = self.sessions.remove(&key) {
                entry.session.retire();
                tracing::info!(key = %key, session_id = entry.session.id(), "Evicting idle session");
                evicted.push(entry.session);
            }
        }

        if self.sessions.len() > capacity {
            tracing::warn!(
                open = self.sessions.len(),
                capacity,
                "Pool above capacity, every remaining session is in use"
            );
            metrics::record_overflow();
        }

        evicted
    }

    fn retire_all(&mut self) -> Vec<Arc<Session>> {
        self.sessions
            .drain()
            .map(|(_, entry)| {
                entry.session.retire();
                entry.session
            })
            .collect()
    }
}

// =============================================================================
// Resource Pool
// =============================================================================

struct PoolInner {
    watcher: Arc<dyn Watcher>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    sessions_created: Arc<AtomicU64>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let sessions = self.state.get_mut().retire_all();
        if sessions.is_empty() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    join_all(sessions.iter().map(|s| s.close(CloseReason::Shutdown))).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    count = sessions.len(),
                    "Pool dropped outside a runtime, sessions left unclosed"
                );
            }
        }
    }
}

enum Lookup {
    Ready(Arc<Session>),
    Opening(Pending<Arc<Session>, PoolError>),
}

enum Landing {
    Inserted {
        session: Arc<Session>,
        evicted: Vec<Arc<Session>>,
    },
    Discarded(Arc<Session>),
    Failed(PoolError),
}

/// An acquirer attached to an in-flight open.
///
/// Dropped before the open resolves, it detaches from the open, or hands
/// back the reference the open reserved for it if the open already landed.
struct Waiter<'a> {
    pool: &'a ResourcePool,
    key: &'a SubscriptionKey,
    generation: u64,
    armed: bool,
}

impl Waiter<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.abandon(self.key, self.generation);
        }
    }
}

/// Reference-counted, capacity-bounded pool of watcher sessions.
///
/// Cloning is cheap; every clone shares the same sessions.
#[derive(Clone)]
pub struct ResourcePool {
    inner: Arc<PoolInner>,
}

impl ResourcePool {
    /// Create an empty pool over `watcher`.
    #[must_use]
    pub fn new(watcher: Arc<dyn Watcher>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                watcher,
                config,
                state: Mutex::new(PoolState::default()),
                sessions_created: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get a session for `key`, opening one if needed.
    ///
    /// Each successful call must be paired with exactly one
    /// [`release`](Self::release).
    ///
    /// # Errors
    ///
    /// - [`PoolError::Open`] if the watcher failed to open the resource.
    ///   Every caller waiting on the same open receives the same error.
    /// - [`PoolError::ShutDown`] after [`shutdown`](Self::shutdown).
    ///
    /// Cancelling the returned future never leaks a reference: the caller
    /// either holds none yet, or the one reserved for it is released.
    pub async fn acquire(&self, key: &SubscriptionKey) -> Result<Arc<Session>, PoolError> {
        let pending = match self.reuse_or_join(key)? {
            Lookup::Ready(session) => return Ok(session),
            Lookup::Opening(pending) => pending,
        };

        let mut waiter = Waiter {
            pool: self,
            key,
            generation: pending.id(),
            armed: true,
        };
        let result = pending.future().await;
        waiter.disarm();

        let session = result?;
        // Shutdown ran between the open landing and this caller resuming.
        if session.is_retired() {
            return Err(PoolError::ShutDown);
        }
        Ok(session)
    }

    /// Drop one reference on the session for `key`.
    ///
    /// When the last reference goes, the session is closed after the grace
    /// period unless it is acquired again first. Releasing a key the pool
    /// does not hold, or one with no references left, is a no-op.
    pub fn release(&self, key: &SubscriptionKey) {
        let mut state = self.inner.state.lock();
        self.release_locked(&mut state, key);
    }

    fn release_locked(&self, state: &mut PoolState, key: &SubscriptionKey) {
        let Some(entry) = state.sessions.get_mut(key) else {
            tracing::debug!(key = %key, "Release for unknown key ignored");
            return;
        };
        if entry.ref_count == 0 {
            tracing::warn!(key = %key, "Release without matching acquire ignored");
            return;
        }

        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            tracing::debug!(key = %key, ref_count = entry.ref_count, "Subscriber released session");
            return;
        }

        self.schedule_close(state, key, "Last subscriber left, close scheduled");
    }

    /// Arm the grace timer of an idle session.
    fn schedule_close(
        &self,
        state: &mut PoolState,
        key: &SubscriptionKey,
        reason: &'static str,
    ) {
        let ticket = state.ticket();
        let Some(entry) = state.sessions.get_mut(key) else {
            return;
        };

        let session_id = entry.session.id();
        let grace = self.inner.config.grace_period;
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let task_key = key.clone();

        let task = ScheduledTask::try_spawn(grace, async move {
            if let Some(inner) = weak.upgrade() {
                Self { inner }.expire(&task_key, session_id, ticket).await;
            }
        });

        match task {
            Some(task) => {
                entry.pending_close = Some(PendingClose {
                    ticket,
                    _task: task,
                });
                tracing::debug!(
                    key = %key,
                    session_id,
                    grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                    "{reason}"
                );
            }
            None => {
                tracing::warn!(key = %key, "No runtime to schedule close, session kept until evicted");
            }
        }
    }

    /// Close every session and refuse further acquisitions.
    ///
    /// Idempotent; later calls return immediately.
    pub async fn shutdown(&self) {
        let sessions = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                tracing::debug!("Resource pool already shut down");
                return;
            }
            state.shut_down = true;
            state.opening.clear();
            let sessions = state.retire_all();
            metrics::set_open_sessions(0);
            sessions
        };

        tracing::info!(count = sessions.len(), "Shutting down resource pool");
        join_all(sessions.iter().map(|s| s.close(CloseReason::Shutdown))).await;
    }

    /// Current reference count for `key`, if the pool holds it.
    #[must_use]
    pub fn ref_count(&self, key: &SubscriptionKey) -> Option<usize> {
        self.inner
            .state
            .lock()
            .sessions
            .get(key)
            .map(|entry| entry.ref_count)
    }

    /// Check whether the pool holds a session for `key`.
    #[must_use]
    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.inner.state.lock().sessions.contains_key(key)
    }

    /// Check whether an open is in flight for `key`.
    #[must_use]
    pub fn is_opening(&self, key: &SubscriptionKey) -> bool {
        self.inner.state.lock().opening.contains(key)
    }

    /// Number of sessions held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    /// Check whether the pool holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().sessions.is_empty()
    }

    /// Check whether [`shutdown`](Self::shutdown) has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shut_down
    }

    /// Point-in-time view of the pool for health reporting.
    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.inner.state.lock();

        let mut entries: Vec<&PoolEntry> = state.sessions.values().collect();
        entries.sort_unstable_by_key(|entry| std::cmp::Reverse(entry.last_touched));

        let sessions: Vec<SessionSummary> = entries
            .into_iter()
            .map(|entry| SessionSummary {
                key: entry.session.key().clone(),
                session_id: entry.session.id(),
                ref_count: entry.ref_count,
                closing: entry.pending_close.is_some(),
                opened_at: entry.session.opened_at(),
            })
            .collect();

        PoolSnapshot {
            capacity: self.inner.config.capacity,
            open_sessions: sessions.len(),
            pinned_sessions: sessions.iter().filter(|s| s.ref_count > 0).count(),
            pending_closes: sessions.iter().filter(|s| s.closing).count(),
            in_flight_opens: state.opening.len(),
            sessions_created: self.inner.sessions_created.load(Ordering::Relaxed),
            coalesced_waits: state.opening.joined(),
            last_error: state.last_error.clone(),
            shut_down: state.shut_down,
            sessions,
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn reuse_or_join(&self, key: &SubscriptionKey) -> Result<Lookup, PoolError> {
        let mut state = self.inner.state.lock();
        if state.shut_down {
            return Err(PoolError::ShutDown);
        }

        if let Some(session) = state.reuse(key) {
            tracing::debug!(key = %key, session_id = session.id(), "Reusing session");
            return Ok(Lookup::Ready(session));
        }

        let pending = state
            .opening
            .start_or_join(key.clone(), |generation| self.spawn_open(key, generation));

        if pending.joined() {
            metrics::record_coalesced_wait();
            tracing::debug!(key = %key, "Joining in-flight open");
        }
        Ok(Lookup::Opening(pending))
    }

    /// Run the open for `generation` on its own task and land the result.
    ///
    /// The returned future only observes the task; dropping it does not
    /// stop the open.
    fn spawn_open(
        &self,
        key: &SubscriptionKey,
        generation: u64,
    ) -> BoxFuture<'static, Result<Arc<Session>, PoolError>> {
        let watcher = Arc::clone(&self.inner.watcher);
        let created = Arc::clone(&self.inner.sessions_created);
        let weak = Arc::downgrade(&self.inner);
        let task_key = key.clone();

        let task = tokio::spawn(async move {
            let result = open_session(watcher, created, task_key.clone()).await;
            match weak.upgrade() {
                Some(inner) => Self { inner }.land(&task_key, generation, result).await,
                None => {
                    if let Ok(session) = result {
                        session.close(CloseReason::Shutdown).await;
                    }
                    Err(PoolError::ShutDown)
                }
            }
        });

        let weak = Arc::downgrade(&self.inner);
        let key = key.clone();
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "Open task failed");
                    if let Some(inner) = weak.upgrade() {
                        inner.state.lock().opening.finish(&key, generation);
                    }
                    Err(PoolError::Open {
                        key,
                        reason: format!("open task failed: {e}"),
                    })
                }
            }
        }
        .boxed()
    }

    async fn land(
        &self,
        key: &SubscriptionKey,
        generation: u64,
        result: Result<Arc<Session>, PoolError>,
    ) -> Result<Arc<Session>, PoolError> {
        match self.settle(key, generation, result) {
            Landing::Inserted { session, evicted } => {
                join_all(evicted.iter().map(|s| s.close(CloseReason::Evicted))).await;
                Ok(session)
            }
            Landing::Discarded(session) => {
                session.close(CloseReason::Shutdown).await;
                Err(PoolError::ShutDown)
            }
            Landing::Failed(err) => Err(err),
        }
    }

    fn settle(
        &self,
        key: &SubscriptionKey,
        generation: u64,
        result: Result<Arc<Session>, PoolError>,
    ) -> Landing {
        let mut state = self.inner.state.lock();
        let waiters = state.opening.finish(key, generation);

        let session = match result {
            Ok(session) => session,
            Err(err) => {
                state.last_error = Some(err.to_string());
                return Landing::Failed(err);
            }
        };

        // A missing entry means shutdown cleared it.
        let Some(waiters) = waiters.filter(|_| !state.shut_down) else {
            session.retire();
            return Landing::Discarded(session);
        };

        // No open starts while the key is held, so nothing is replaced here.
        state.insert(Arc::clone(&session), generation, waiters);
        if waiters == 0 {
            self.schedule_close(&mut state, key, "Open landed with no waiters, close scheduled");
        }
        let evicted = state.evict(self.inner.config.capacity);
        metrics::set_open_sessions(state.sessions.len());

        Landing::Inserted { session, evicted }
    }

    /// Detach a cancelled acquirer from generation `generation` of `key`.
    fn abandon(&self, key: &SubscriptionKey, generation: u64) {
        let mut state = self.inner.state.lock();
        if state.opening.leave(key, generation) {
            tracing::debug!(key = %key, "Waiter left in-flight open");
            return;
        }

        let landed = state
            .sessions
            .get(key)
            .is_some_and(|entry| entry.origin == generation);
        if landed {
            tracing::debug!(key = %key, "Waiter gone after open landed, releasing its reference");
            self.release_locked(&mut state, key);
        }
    }

    async fn expire(&self, key: &SubscriptionKey, session_id: u64, ticket: u64) {
        let Some(session) = self.take_expired(key, session_id, ticket) else {
            tracing::debug!(key = %key, session_id, "Grace close superseded");
            return;
        };

        tracing::info!(key = %key, session_id, "Grace period elapsed");
        session.close(CloseReason::Grace).await;
    }

    fn take_expired(
        &self,
        key: &SubscriptionKey,
        session_id: u64,
        ticket: u64,
    ) -> Option<Arc<Session>> {
        let mut state = self.inner.state.lock();

        let due = state.sessions.get(key).is_some_and(|entry| {
            entry.session.id() == session_id
                && entry.ref_count == 0
                && entry
                    .pending_close
                    .as_ref()
                    .is_some_and(|pending| pending.ticket == ticket)
        });
        if !due {
            return None;
        }

        let entry = state.sessions.remove(key)?;
        entry.session.retire();
        metrics::set_open_sessions(state.sessions.len());
        Some(entry.session)
    }
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

async fn open_session(
    watcher: Arc<dyn Watcher>,
    created: Arc<AtomicU64>,
    key: SubscriptionKey,
) -> Result<Arc<Session>, PoolError> {
    let started = Instant::now();
    tracing::info!(key = %key, "Opening watcher session");

    match watcher.open(&key).await {
        Ok(resource) => {
            let id = created.fetch_add(1, Ordering::Relaxed) + 1;
            let elapsed = started.elapsed();
            metrics::record_session_opened(elapsed);
            tracing::info!(
                key = %key,
                session_id = id,
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "Watcher session opened"
            );
            Ok(Arc::new(Session::new(id, key, resource)))
        }
        Err(e) => {
            metrics::record_open_failure();
            tracing::warn!(key = %key, error = %e, "Failed to open watcher session");
            Err(PoolError::Open {
                reason: e.to_string(),
                key,
            })
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Health view of one pooled session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    /// Session key.
    pub key: SubscriptionKey,
    /// Pool-unique session id.
    pub session_id: u64,
    /// Active subscribers.
    pub ref_count: usize,
    /// A grace close is scheduled.
    pub closing: bool,
    /// When the session was opened.
    pub opened_at: DateTime<Utc>,
}

/// Health view of the whole pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    /// Configured soft capacity.
    pub capacity: usize,
    /// Sessions currently held.
    pub open_sessions: usize,
    /// Sessions with at least one subscriber.
    pub pinned_sessions: usize,
    /// Sessions waiting out their grace period.
    pub pending_closes: usize,
    /// Opens currently in flight.
    pub in_flight_opens: usize,
    /// Sessions opened since start.
    pub sessions_created: u64,
    /// Acquisitions that joined an in-flight open.
    pub coalesced_waits: u64,
    /// Most recent open failure.
    pub last_error: Option<String>,
    /// Whether the pool has been shut down.
    pub shut_down: bool,
    /// Held sessions, most recently touched first.
    pub sessions: Vec<SessionSummary>,
}

// =============================================================================
// Errors
// =============================================================================

/// Errors returned to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The raw subscription key was rejected.
    #[error(transparent)]
    InvalidKey(#[from] InvalidKeyError),

    /// The watcher could not open the resource.
    #[error("could not open session for {key}: {reason}")]
    Open {
        /// Key being opened.
        key: SubscriptionKey,
        /// Watcher error message.
        reason: String,
    },

    /// The pool no longer accepts acquisitions.
    #[error("resource pool is shut down")]
    ShutDown,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::application::ports::{MockResourceHandle, WatcherError};

    struct NoEvents;

    impl EventSource for NoEvents {
        fn subscribe(&self, _listener: Listener) -> Unsubscribe {
            Unsubscribe::noop()
        }
    }

    struct CountingHandle(Arc<AtomicUsize>);

    #[async_trait]
    impl ResourceHandle for CountingHandle {
        async fn close(&self) -> Result<(), WatcherError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingWatcher {
        opens: AtomicUsize,
        closes: Arc<AtomicUsize>,
        fail: AtomicBool,
    }

    impl CountingWatcher {
        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Watcher for CountingWatcher {
        async fn open(&self, key: &SubscriptionKey) -> Result<WatchedResource, WatcherError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(WatcherError::OpenFailed {
                    key: key.clone(),
                    reason: "page did not load".to_string(),
                });
            }
            Ok(WatchedResource::new(
                Box::new(CountingHandle(Arc::clone(&self.closes))),
                Arc::new(NoEvents),
            ))
        }
    }

    fn key(raw: &str) -> SubscriptionKey {
        SubscriptionKey::parse(raw).unwrap()
    }

    fn pool(watcher: &Arc<CountingWatcher>, capacity: usize) -> ResourcePool {
        let watcher: Arc<dyn Watcher> = watcher.clone();
        ResourcePool::new(
            watcher,
            PoolConfig::default()
                .with_capacity(capacity)
                .with_grace_period(Duration::from_secs(10)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn release_closes_after_grace() {
        let watcher = Arc::new(CountingWatcher::default());
        let pool = pool(&watcher, 6);
        let btc = key("BTCUSDT");

        pool.acquire(&btc).await.unwrap();
        pool.release(&btc);
        assert_eq!(pool.ref_count(&btc), Some(0));

        tokio::time::sleep(Duration::from_millis(9_900)).await;
        assert!(pool.contains(&btc));
        assert_eq!(watcher.closes(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!pool.contains(&btc));
        assert_eq!(watcher.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reacquire_within_grace_reuses_session() {
        let watcher = Arc::new(CountingWatcher::default());
        let pool = pool(&watcher, 6);
        let btc = key("BTCUSDT");

        let first = pool.acquire(&btc).await.unwrap();
        pool.release(&btc);
        tokio::time::sleep(Duration::from_secs(5)).await;

        let second = pool.acquire(&btc).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(watcher.opens(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(watcher.closes(), 0);
        assert_eq!(pool.ref_count(&btc), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_timer_does_not_close_early() {
        let watcher = Arc::new(CountingWatcher::default());
        let pool = pool(&watcher, 6);
        let btc = key("BTCUSDT");

        pool.acquire(&btc).await.unwrap();
        pool.release(&btc);
        tokio::time::sleep(Duration::from_secs(5)).await;

        pool.acquire(&btc).await.unwrap();
        pool.release(&btc);

        // The first timer would have fired at 10s.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(pool.contains(&btc));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!pool.contains(&btc));
        assert_eq!(watcher.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_share_one_open() {
        let watcher = Arc::new(CountingWatcher::default());
        let pool = pool(&watcher, 6);
        let btc = key("BTCUSDT");

        let sessions = join_all((0..5).map(|_| pool.acquire(&btc))).await;

        assert_eq!(watcher.opens(), 1);
        assert_eq!(pool.ref_count(&btc), Some(5));
        let ids: Vec<u64> = sessions.into_iter().map(|s| s.unwrap().id()).collect();
        assert!(ids.iter().all(|id| *id == ids[0]));

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.coalesced_waits, 4);
        assert_eq!(snapshot.in_flight_opens, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_reaches_every_waiter() {
        let watcher = Arc::new(CountingWatcher::default());
        watcher.fail.store(true, Ordering::SeqCst);
        let pool = pool(&watcher, 6);
        let btc = key("BTCUSDT");

        let results = join_all((0..3).map(|_| pool.acquire(&btc))).await;
        assert_eq!(watcher.opens(), 1);
        for result in results {
            assert!(matches!(result, Err(PoolError::Open { .. })));
        }
        assert!(!pool.contains(&btc));
        assert!(!pool.is_opening(&btc));
        assert!(pool.snapshot().last_error.is_some());

        // Nothing cached: the next caller tries again.
        watcher.fail.store(false, Ordering::SeqCst);
        pool.acquire(&btc).await.unwrap();
        assert_eq!(watcher.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_removes_least_recently_touched_idle_session() {
        let watcher = Arc::new(CountingWatcher::default());
        let pool = pool(&watcher, 2);
        let (a, b, c) = (key("AAA"), key("BBB"), key("CCC"));

        pool.acquire(&a).await.unwrap();
        pool.acquire(&b).await.unwrap();
        pool.release(&a);
        pool.release(&b);

        pool.acquire(&c).await.unwrap();

        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&a));
        assert!(pool.contains(&b));
        assert!(pool.contains(&c));
        assert_eq!(watcher.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pinned_sessions_are_never_evicted() {
        let watcher = Arc::new(CountingWatcher::default());
        let pool = pool(&watcher, 1);
        let (a, b) = (key("AAA"), key("BBB"));

        pool.acquire(&a).await.unwrap();
        pool.acquire(&b).await.unwrap();

        assert_eq!(pool.len(), 2);
        assert_eq!(watcher.closes(), 0);
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.pinned_sessions, 2);
        assert_eq!(snapshot.capacity, 1);

        // Once A is idle, the next insertion evicts it.
        pool.release(&a);
        pool.acquire(&key("CCC")).await.unwrap();
        assert!(!pool.contains(&a));
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_skips_pinned_least_recently_touched() {
        let watcher = Arc::new(CountingWatcher::default());
        let pool = pool(&watcher, 2);
        let (a, b, c) = (key("AAA"), key("BBB"), key("CCC"));

        pool.acquire(&a).await.unwrap();
        pool.acquire(&b).await.unwrap();
        pool.release(&b);
        pool.acquire(&c).await.unwrap();

        assert!(pool.contains(&a));
        assert!(!pool.contains(&b));
        assert!(pool.contains(&c));
        assert_eq!(watcher.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn release_of_unknown_or_idle_key_is_noop() {
        let watcher = Arc::new(CountingWatcher::default());
        let pool = pool(&watcher, 6);
        let btc = key("BTCUSDT");

        pool.release(&btc);
        pool.acquire(&btc).await.unwrap();
        pool.release(&btc);
        let tickets = pool.inner.state.lock().next_ticket;

        pool.release(&btc);
        pool.release(&key("ETHUSDT"));
        assert_eq!(pool.ref_count(&btc), Some(0));
        assert_eq!(pool.inner.state.lock().next_ticket, tickets);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_detaches_from_open() {
        let watcher = Arc::new(CountingWatcher::default());
        let pool = pool(&watcher, 6);
        let btc = key("BTCUSDT");

        let first = tokio::time::timeout(Duration::from_millis(1), pool.acquire(&btc)).await;
        assert!(first.is_err());
        assert_eq!(pool.inner.state.lock().opening.waiters(&btc), 0);

        // The open lands idle and closes after the grace period.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pool.is_opening(&btc));
        assert_eq!(pool.ref_count(&btc), Some(0));
        assert_eq!(pool.snapshot().pending_closes, 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!pool.contains(&btc));
        assert_eq!(watcher.opens(), 1);
        assert_eq!(watcher.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_open_discards_the_result() {
        let watcher = Arc::new(CountingWatcher::default());
        let pool = pool(&watcher, 6);
        let btc = key("BTCUSDT");

        let waiter = {
            let pool = pool.clone();
            let btc = btc.clone();
            tokio::spawn(async move { pool.acquire(&btc).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(pool.is_opening(&btc));

        pool.shutdown().await;
        assert_eq!(waiter.await.unwrap().unwrap_err(), PoolError::ShutDown);
        assert!(pool.is_empty());
        assert_eq!(watcher.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_everything_once() {
        let watcher = Arc::new(CountingWatcher::default());
        let pool = pool(&watcher, 6);

        pool.acquire(&key("AAA")).await.unwrap();
        pool.acquire(&key("BBB")).await.unwrap();
        pool.release(&key("BBB"));

        pool.shutdown().await;
        pool.shutdown().await;

        assert_eq!(watcher.closes(), 2);
        assert!(pool.is_empty());
        assert!(pool.is_shut_down());
        assert_eq!(
            pool.acquire(&key("AAA")).await.unwrap_err(),
            PoolError::ShutDown
        );

        // The cancelled grace timer never closes again.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(watcher.closes(), 2);
    }

    struct OneShotWatcher(parking_lot::Mutex<Option<WatchedResource>>);

    #[async_trait]
    impl Watcher for OneShotWatcher {
        async fn open(&self, _key: &SubscriptionKey) -> Result<WatchedResource, WatcherError> {
            self.0.lock().take().ok_or(WatcherError::Closed)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_closes_handle_exactly_once() {
        let mut handle = MockResourceHandle::new();
        handle.expect_close().times(1).returning(|| Ok(()));
        let watcher = OneShotWatcher(parking_lot::Mutex::new(Some(WatchedResource::new(
            Box::new(handle),
            Arc::new(NoEvents),
        ))));

        let pool = ResourcePool::new(Arc::new(watcher), PoolConfig::default());
        let btc = key("BTCUSDT");

        pool.acquire(&btc).await.unwrap();
        pool.release(&btc);
        tokio::time::sleep(DEFAULT_GRACE_PERIOD + Duration::from_secs(1)).await;
        pool.shutdown().await;

        assert!(!pool.contains(&btc));
    }

    #[test]
    fn error_messages() {
        let err = PoolError::Open {
            key: key("BTCUSDT"),
            reason: "timeout".to_string(),
        };
        assert_eq!(err.to_string(), "could not open session for BTCUSDT: timeout");
        assert_eq!(PoolError::ShutDown.to_string(), "resource pool is shut down");
    }
}
