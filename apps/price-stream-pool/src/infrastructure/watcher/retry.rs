//! Open Retry Policy
//!
//! Exponential backoff with jitter for watcher opens, plus a `Watcher`
//! decorator that applies it together with a per-attempt timeout.
//!
//! The pool only ever sees the final outcome: either a resource, or the
//! error of the last attempt.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::application::ports::{WatchedResource, Watcher, WatcherError};
use crate::domain::subscription::SubscriptionKey;
use crate::infrastructure::config::WatcherSettings;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry).
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Retries after the first attempt (0 = never retry).
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_retries: 2,
        }
    }
}

impl RetryConfig {
    /// Create configuration from `WatcherSettings`.
    #[must_use]
    pub const fn from_watcher_settings(settings: &WatcherSettings) -> Self {
        Self {
            initial_delay: settings.retry_delay_initial,
            max_delay: settings.retry_delay_max,
            multiplier: settings.retry_delay_multiplier,
            jitter_factor: 0.1,
            max_retries: settings.open_attempts.saturating_sub(1),
        }
    }
}

/// Retry policy implementing exponential backoff with jitter.
///
/// # Example
///
/// ```rust
/// use price_stream_pool::infrastructure::watcher::{RetryConfig, RetryPolicy};
///
/// let mut policy = RetryPolicy::new(RetryConfig::default());
///
/// assert!(policy.next_delay().is_some());
/// assert!(policy.next_delay().is_some());
/// assert!(policy.next_delay().is_none());
/// ```
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    current_delay: Duration,
    retries: u32,
}

impl RetryPolicy {
    /// Create a new retry policy.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            retries: 0,
        }
    }

    /// Get the delay before the next retry, or `None` once retries are used up.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.config.max_retries {
            return None;
        }
        self.retries += 1;

        let delay_with_jitter = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Some(delay_with_jitter)
    }

    /// Retries handed out so far.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    /// Check whether another retry is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.retries < self.config.max_retries
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(adjusted_millis as u64)
    }
}

// =============================================================================
// Retrying Watcher
// =============================================================================

/// Wraps a watcher with a per-attempt timeout and bounded retries.
#[derive(Debug)]
pub struct RetryingWatcher<W> {
    inner: W,
    retry: RetryConfig,
    attempt_timeout: Duration,
}

impl<W> RetryingWatcher<W> {
    /// Wrap `inner`.
    #[must_use]
    pub const fn new(inner: W, retry: RetryConfig, attempt_timeout: Duration) -> Self {
        Self {
            inner,
            retry,
            attempt_timeout,
        }
    }

    /// Wrap `inner` using service settings.
    #[must_use]
    pub const fn from_settings(inner: W, settings: &WatcherSettings) -> Self {
        Self::new(
            inner,
            RetryConfig::from_watcher_settings(settings),
            settings.open_timeout,
        )
    }

    /// The wrapped watcher.
    #[must_use]
    pub const fn inner(&self) -> &W {
        &self.inner
    }
}

#[async_trait]
impl<W: Watcher> Watcher for RetryingWatcher<W> {
    async fn open(&self, key: &SubscriptionKey) -> Result<WatchedResource, WatcherError> {
        let mut policy = RetryPolicy::new(self.retry.clone());

        loop {
            let error = match tokio::time::timeout(self.attempt_timeout, self.inner.open(key)).await
            {
                Ok(Ok(resource)) => {
                    if policy.retries() > 0 {
                        tracing::info!(key = %key, retries = policy.retries(), "Watcher opened after retry");
                    }
                    return Ok(resource);
                }
                Ok(Err(WatcherError::Closed)) => return Err(WatcherError::Closed),
                Ok(Err(e)) => e,
                Err(_) => WatcherError::Timeout {
                    key: key.clone(),
                    after: self.attempt_timeout,
                },
            };

            let Some(delay) = policy.next_delay() else {
                tracing::warn!(
                    key = %key,
                    attempts = policy.retries() + 1,
                    error = %error,
                    "Giving up on watcher open"
                );
                return Err(error);
            };

            tracing::warn!(
                key = %key,
                retry = policy.retries(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Watcher open failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::application::ports::{EventSource, Listener, ResourceHandle, Unsubscribe};

    fn no_jitter(max_retries: u32) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_retries,
        }
    }

    #[test]
    fn default_config_values() {
        let config = RetryConfig::default();
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(5));
        assert_eq!(config.max_retries, 2);
    }

    #[test]
    fn settings_attempts_become_retries() {
        let settings = WatcherSettings {
            open_attempts: 1,
            ..WatcherSettings::default()
        };
        assert_eq!(RetryConfig::from_watcher_settings(&settings).max_retries, 0);
        assert_eq!(
            RetryConfig::from_watcher_settings(&WatcherSettings::default()).max_retries,
            2
        );
    }

    #[test]
    fn policy_exponential_backoff() {
        let mut policy = RetryPolicy::new(no_jitter(5));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(800)));
    }

    #[test]
    fn policy_max_delay_cap() {
        let mut policy = RetryPolicy::new(RetryConfig {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(2000),
            multiplier: 4.0,
            jitter_factor: 0.0,
            max_retries: 5,
        });

        let _ = policy.next_delay();
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(2000)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn policy_stops_after_max_retries() {
        let mut policy = RetryPolicy::new(no_jitter(2));
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());
        assert_eq!(policy.retries(), 2);
    }

    #[test]
    fn zero_retries_never_retries() {
        let mut policy = RetryPolicy::new(no_jitter(0));
        assert!(policy.next_delay().is_none());
    }

    #[test]
    fn policy_jitter_bounds() {
        for _ in 0..100 {
            let mut policy = RetryPolicy::new(RetryConfig {
                initial_delay: Duration::from_millis(1000),
                jitter_factor: 0.1,
                ..no_jitter(1)
            });
            let millis = policy.next_delay().unwrap().as_millis();
            assert!((900..=1100).contains(&millis), "delay {millis}ms out of bounds");
        }
    }

    struct NoEvents;

    impl EventSource for NoEvents {
        fn subscribe(&self, _listener: Listener) -> Unsubscribe {
            Unsubscribe::noop()
        }
    }

    struct NoopHandle;

    #[async_trait]
    impl ResourceHandle for NoopHandle {
        async fn close(&self) -> Result<(), WatcherError> {
            Ok(())
        }
    }

    /// Fails (or hangs) for the first `failures` attempts, then succeeds.
    struct FlakyWatcher {
        attempts: Arc<AtomicU32>,
        failures: u32,
        hang: bool,
    }

    #[async_trait]
    impl Watcher for FlakyWatcher {
        async fn open(&self, key: &SubscriptionKey) -> Result<WatchedResource, WatcherError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures {
                if self.hang {
                    std::future::pending::<()>().await;
                }
                return Err(WatcherError::OpenFailed {
                    key: key.clone(),
                    reason: format!("attempt {attempt}"),
                });
            }
            Ok(WatchedResource::new(Box::new(NoopHandle), Arc::new(NoEvents)))
        }
    }

    fn flaky(failures: u32, hang: bool) -> (FlakyWatcher, Arc<AtomicU32>) {
        let attempts = Arc::new(AtomicU32::new(0));
        (
            FlakyWatcher {
                attempts: Arc::clone(&attempts),
                failures,
                hang,
            },
            attempts,
        )
    }

    fn key() -> SubscriptionKey {
        SubscriptionKey::parse("BTCUSDT").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let (inner, attempts) = flaky(2, false);
        let watcher = RetryingWatcher::new(inner, no_jitter(2), Duration::from_secs(1));

        assert!(watcher.open(&key()).await.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_when_exhausted() {
        let (inner, attempts) = flaky(10, false);
        let watcher = RetryingWatcher::new(inner, no_jitter(2), Duration::from_secs(1));

        let err = watcher.open(&key()).await.unwrap_err();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(
            err,
            WatcherError::OpenFailed {
                key: key(),
                reason: "attempt 3".to_string(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempt_times_out() {
        let (inner, attempts) = flaky(10, true);
        let watcher = RetryingWatcher::new(inner, no_jitter(1), Duration::from_millis(250));

        let err = watcher.open(&key()).await.unwrap_err();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(matches!(err, WatcherError::Timeout { after, .. } if after == Duration::from_millis(250)));
    }
}
