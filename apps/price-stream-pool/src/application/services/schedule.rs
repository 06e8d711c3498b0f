//! Deferred Tasks
//!
//! A cancellable "run this after a delay" primitive built on
//! `tokio::time` and a `CancellationToken`. Used for the pool's
//! grace-period close. Because the delay is a `tokio::time::sleep`, tests
//! drive it deterministically with a paused clock.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A task that runs once after a delay unless cancelled first.
///
/// Dropping the handle cancels the task if it has not fired yet. Once the
/// delay has elapsed the task runs to completion regardless of the handle.
#[derive(Debug)]
pub struct ScheduledTask {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ScheduledTask {
    /// Schedule `task` to run after `delay` on the current runtime.
    ///
    /// Returns `None` when called outside a tokio runtime.
    pub fn try_spawn<F>(delay: Duration, task: F) -> Option<Self>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().ok()?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = runtime.spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            task.await;
        });

        Some(Self { cancel, join })
    }

    /// Cancel the task if it has not fired yet.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Check whether the task was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Check whether the task has finished (fired, or observed cancellation).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
