//! Stream Driver
//!
//! Turns a pooled session into a throttled per-subscriber stream.
//!
//! # Flow
//!
//! 1. Validate the raw key (fails before the pool is touched).
//! 2. Acquire the session from the pool.
//! 3. Attach a listener that writes updates into a [`LatestValue`] cell and
//!    forwards faults over a small bounded channel.
//! 4. A spawned task polls the [`Throttle`] and pushes records into the
//!    subscriber's channel, sleeping until the window reopens or for the
//!    idle poll interval when nothing is pending.
//!
//! The stream ends only when the subscriber drops it, calls
//! [`PriceStream::stop`], or a parent cancellation token fires. Faults are
//! delivered in-band and never end the stream.
//!
//! Cleanup (detach listener, release session) lives in a drop guard owned
//! by the task, so it runs exactly once on every exit path.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::pool::{PoolError, ResourcePool};
use crate::application::ports::{Listener, Unsubscribe, WatcherEvent};
use crate::domain::streaming::{
    DriverState, FaultNotification, LatestValue, PriceUpdate, StreamEvent, Throttle,
    ThrottleDecision,
};
use crate::domain::subscription::SubscriptionKey;
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Default minimum gap between two records for one subscriber.
pub const DEFAULT_MIN_GAP: Duration = Duration::from_millis(200);

/// Default wake-up interval while no value is pending.
pub const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(80);

/// Stream driver timing and buffering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Minimum gap between two records.
    pub min_gap: Duration,
    /// Sleep between polls while the cell is empty.
    pub idle_poll: Duration,
    /// Faults buffered per subscriber before new ones are dropped.
    pub fault_buffer: usize,
    /// Records buffered per subscriber before the driver waits.
    pub output_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            min_gap: DEFAULT_MIN_GAP,
            idle_poll: DEFAULT_IDLE_POLL,
            fault_buffer: 16,
            output_buffer: 16,
        }
    }
}

impl StreamConfig {
    /// Set the minimum gap.
    #[must_use]
    pub const fn with_min_gap(mut self, min_gap: Duration) -> Self {
        self.min_gap = min_gap;
        self
    }

    /// Set the idle poll interval.
    #[must_use]
    pub const fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }
}

// =============================================================================
// Stream Driver
// =============================================================================

/// Creates throttled subscriber streams over a [`ResourcePool`].
#[derive(Debug, Clone)]
pub struct StreamDriver {
    pool: ResourcePool,
    config: StreamConfig,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl StreamDriver {
    /// Create a driver over `pool`.
    #[must_use]
    pub fn new(pool: ResourcePool, config: StreamConfig) -> Self {
        Self {
            pool,
            config,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// Driver configuration.
    #[must_use]
    pub const fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Number of streams whose cleanup has not run yet.
    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Open a throttled stream for `raw_key`.
    ///
    /// # Errors
    ///
    /// - [`PoolError::InvalidKey`] if the key fails validation. The pool is
    ///   not touched.
    /// - Any error from [`ResourcePool::acquire`].
    pub async fn subscribe(&self, raw_key: &str) -> Result<PriceStream, PoolError> {
        self.subscribe_with_cancel(raw_key, &CancellationToken::new())
            .await
    }

    /// Open a throttled stream that also ends when `parent` is cancelled.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub async fn subscribe_with_cancel(
        &self,
        raw_key: &str,
        parent: &CancellationToken,
    ) -> Result<PriceStream, PoolError> {
        let key = SubscriptionKey::parse(raw_key)?;
        self.attach(key, parent.child_token()).await
    }

    /// Cancel every stream, then shut the pool down.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.pool.shutdown().await;
    }

    async fn attach(
        &self,
        key: SubscriptionKey,
        cancel: CancellationToken,
    ) -> Result<PriceStream, PoolError> {
        let session = self.pool.acquire(&key).await?;
        let stream_id = uuid::Uuid::new_v4().as_u64_pair().0;

        let cell = Arc::new(LatestValue::new());
        let (fault_tx, fault_rx) = mpsc::channel(self.config.fault_buffer.max(1));
        let listener = make_listener(&key, stream_id, Arc::clone(&cell), fault_tx);
        let unsubscribe = session.subscribe(listener);

        let (state_tx, state_rx) = watch::channel(DriverState::Attached);
        let (tx, rx) = mpsc::channel(self.config.output_buffer.max(1));

        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::set_active_streams(active);
        tracing::info!(key = %key, stream_id, session_id = session.id(), "Stream attached");

        let guard = Cleanup {
            pool: self.pool.clone(),
            key: key.clone(),
            stream_id,
            unsubscribe: Some(unsubscribe),
            state: state_tx,
            active: Arc::clone(&self.active),
        };

        let task = DriveTask {
            key: key.clone(),
            stream_id,
            cell,
            faults: fault_rx,
            tx,
            throttle: Throttle::new(self.config.min_gap),
            idle_poll: self.config.idle_poll,
            cancel: cancel.clone(),
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(task.run(guard));

        Ok(PriceStream {
            key,
            stream_id,
            inner: ReceiverStream::new(rx),
            cancel,
            state: state_rx,
        })
    }
}

fn make_listener(
    key: &SubscriptionKey,
    stream_id: u64,
    cell: Arc<LatestValue>,
    faults: mpsc::Sender<String>,
) -> Listener {
    let key = key.clone();
    Arc::new(move |event: &WatcherEvent| match event {
        WatcherEvent::Update(value) => {
            cell.store(*value);
        }
        WatcherEvent::Fault(message) => {
            if faults.try_send(message.clone()).is_err() {
                tracing::warn!(key = %key, stream_id, "Fault buffer full, dropping fault");
            }
        }
    })
}

// =============================================================================
// Drive Loop
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum ExitReason {
    Cancelled,
    Disconnected,
}

impl ExitReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Disconnected => "disconnected",
        }
    }
}

struct DriveTask {
    key: SubscriptionKey,
    stream_id: u64,
    cell: Arc<LatestValue>,
    faults: mpsc::Receiver<String>,
    tx: mpsc::Sender<StreamEvent>,
    throttle: Throttle,
    idle_poll: Duration,
    cancel: CancellationToken,
    shutdown: CancellationToken,
}

impl DriveTask {
    async fn run(mut self, guard: Cleanup) {
        let _guard = guard;
        let reason = self.drive().await;
        tracing::debug!(
            key = %self.key,
            stream_id = self.stream_id,
            reason = reason.as_str(),
            superseded = self.cell.superseded(),
            "Stream driver exiting"
        );
    }

    async fn drive(&mut self) -> ExitReason {
        loop {
            let until = match self.throttle.poll(Instant::now(), &self.cell) {
                ThrottleDecision::Emit(value) => {
                    let record = StreamEvent::Price(PriceUpdate::now(self.key.clone(), value));
                    if let Err(reason) = self.deliver(record).await {
                        return reason;
                    }
                    metrics::record_update_emitted();
                    continue;
                }
                ThrottleDecision::WaitUntil(opens_at) => opens_at,
                ThrottleDecision::Idle => Instant::now() + self.idle_poll,
            };

            tokio::select! {
                biased;

                () = self.cancel.cancelled() => return ExitReason::Cancelled,
                () = self.shutdown.cancelled() => return ExitReason::Cancelled,
                () = self.tx.closed() => return ExitReason::Disconnected,

                Some(message) = self.faults.recv() => {
                    tracing::debug!(key = %self.key, stream_id = self.stream_id, message = %message, "Forwarding fault");
                    let fault = StreamEvent::Fault(FaultNotification {
                        key: self.key.clone(),
                        message,
                    });
                    if let Err(reason) = self.deliver(fault).await {
                        return reason;
                    }
                    metrics::record_fault();
                }

                () = tokio::time::sleep_until(until) => {}
            }
        }
    }

    async fn deliver(&self, event: StreamEvent) -> Result<(), ExitReason> {
        tokio::select! {
            biased;

            () = self.cancel.cancelled() => Err(ExitReason::Cancelled),
            () = self.shutdown.cancelled() => Err(ExitReason::Cancelled),
            sent = self.tx.send(event) => sent.map_err(|_| ExitReason::Disconnected),
        }
    }
}

/// Detaches the listener and releases the session when the driver exits.
struct Cleanup {
    pool: ResourcePool,
    key: SubscriptionKey,
    stream_id: u64,
    unsubscribe: Option<Unsubscribe>,
    state: watch::Sender<DriverState>,
    active: Arc<AtomicUsize>,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.state.send_replace(DriverState::Draining);

        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe.unsubscribe();
        }
        self.pool.release(&self.key);

        let active = self.active.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        metrics::set_active_streams(active);
        self.state.send_replace(DriverState::Closed);

        tracing::info!(key = %self.key, stream_id = self.stream_id, "Stream detached");
    }
}

// =============================================================================
// Price Stream
// =============================================================================

/// A subscriber's throttled stream of [`StreamEvent`]s.
///
/// Dropping the stream cancels its driver.
#[derive(Debug)]
pub struct PriceStream {
    key: SubscriptionKey,
    stream_id: u64,
    inner: ReceiverStream<StreamEvent>,
    cancel: CancellationToken,
    state: watch::Receiver<DriverState>,
}

impl PriceStream {
    /// Key this stream follows.
    #[must_use]
    pub const fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Random id used to correlate log lines for this stream.
    #[must_use]
    pub const fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Ask the driver to stop. Buffered records can still be read.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Current driver state.
    #[must_use]
    pub fn state(&self) -> DriverState {
        *self.state.borrow()
    }

    /// Watch driver state changes.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<DriverState> {
        self.state.clone()
    }

    /// Wait until the driver has finished cleanup.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        // An error means the sender is gone, which only happens after cleanup.
        let _ = state.wait_for(|s| *s == DriverState::Closed).await;
    }
}

impl Stream for PriceStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for PriceStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================
