//! Service Configuration Settings
//!
//! Configuration types for the price stream service, loaded from
//! environment variables.

use std::time::Duration;

use crate::application::services::{PoolConfig, StreamConfig};

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// SSE stream server port.
    pub stream_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
    /// Origin allowed to read the SSE stream cross-site.
    pub cors_origin: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            stream_port: 8080,
            health_port: 8082,
            cors_origin: "http://localhost:3000".to_string(),
        }
    }
}

/// Resource pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Soft cap on open sessions.
    pub max_sessions: usize,
    /// Time an unused session stays open.
    pub grace_period: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_sessions: 6,
            grace_period: Duration::from_secs(10),
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            capacity: settings.max_sessions,
            grace_period: settings.grace_period,
        }
    }
}

/// Per-subscriber stream settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    /// Minimum gap between two price records.
    pub min_gap: Duration,
    /// Wake-up interval while no value is pending.
    pub idle_poll: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            min_gap: Duration::from_millis(200),
            idle_poll: Duration::from_millis(80),
        }
    }
}

impl From<&StreamSettings> for StreamConfig {
    fn from(settings: &StreamSettings) -> Self {
        Self::default()
            .with_min_gap(settings.min_gap)
            .with_idle_poll(settings.idle_poll)
    }
}

/// Watcher open settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WatcherSettings {
    /// Timeout for a single open attempt.
    pub open_timeout: Duration,
    /// Open attempts before giving up.
    pub open_attempts: u32,
    /// Initial delay between attempts.
    pub retry_delay_initial: Duration,
    /// Maximum delay between attempts.
    pub retry_delay_max: Duration,
    /// Delay multiplier for exponential backoff.
    pub retry_delay_multiplier: f64,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(15),
            open_attempts: 3,
            retry_delay_initial: Duration::from_millis(500),
            retry_delay_max: Duration::from_secs(5),
            retry_delay_multiplier: 2.0,
        }
    }
}

/// Simulated feed settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSettings {
    /// Shortest interval between two ticks.
    pub tick_min: Duration,
    /// Longest interval between two ticks.
    pub tick_max: Duration,
    /// Probability that a tick reports a fault instead of a price.
    pub fault_rate: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            tick_min: Duration::from_millis(50),
            tick_max: Duration::from_millis(750),
            fault_rate: 0.0,
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProxyConfig {
    /// Server port settings.
    pub server: ServerSettings,
    /// Resource pool settings.
    pub pool: PoolSettings,
    /// Stream settings.
    pub stream: StreamSettings,
    /// Watcher open settings.
    pub watcher: WatcherSettings,
    /// Simulated feed settings.
    pub simulation: SimulationSettings,
}

impl ProxyConfig {
    /// Create configuration from environment variables.
    ///
    /// Unset or unparsable variables fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is out of range.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            stream_port: env.u16("PRICE_STREAM_PORT", server_defaults.stream_port),
            health_port: env.u16("PRICE_STREAM_HEALTH_PORT", server_defaults.health_port),
            cors_origin: env.string("PRICE_STREAM_CORS_ORIGIN", server_defaults.cors_origin),
        };

        let pool_defaults = PoolSettings::default();
        let pool = PoolSettings {
            max_sessions: env.usize("PRICE_STREAM_MAX_SESSIONS", pool_defaults.max_sessions),
            grace_period: env.millis("PRICE_STREAM_GRACE_MS", pool_defaults.grace_period),
        };

        let stream_defaults = StreamSettings::default();
        let stream = StreamSettings {
            min_gap: env.millis("PRICE_STREAM_MIN_GAP_MS", stream_defaults.min_gap),
            idle_poll: env.millis("PRICE_STREAM_IDLE_POLL_MS", stream_defaults.idle_poll),
        };

        let watcher_defaults = WatcherSettings::default();
        let watcher = WatcherSettings {
            open_timeout: env.millis(
                "PRICE_STREAM_OPEN_TIMEOUT_MS",
                watcher_defaults.open_timeout,
            ),
            open_attempts: env.u32(
                "PRICE_STREAM_OPEN_ATTEMPTS",
                watcher_defaults.open_attempts,
            ),
            retry_delay_initial: env.millis(
                "PRICE_STREAM_RETRY_DELAY_MS",
                watcher_defaults.retry_delay_initial,
            ),
            retry_delay_max: env.millis(
                "PRICE_STREAM_RETRY_DELAY_MAX_MS",
                watcher_defaults.retry_delay_max,
            ),
            retry_delay_multiplier: watcher_defaults.retry_delay_multiplier,
        };

        let simulation_defaults = SimulationSettings::default();
        let simulation = SimulationSettings {
            tick_min: env.millis("PRICE_STREAM_SIM_TICK_MIN_MS", simulation_defaults.tick_min),
            tick_max: env.millis("PRICE_STREAM_SIM_TICK_MAX_MS", simulation_defaults.tick_max),
            fault_rate: env.f64("PRICE_STREAM_SIM_FAULT_RATE", simulation_defaults.fault_rate),
        };

        let config = Self {
            server,
            pool,
            stream,
            watcher,
            simulation,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first bad variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_sessions == 0 {
            return Err(invalid("PRICE_STREAM_MAX_SESSIONS", "must be at least 1"));
        }
        if self.stream.min_gap.is_zero() {
            return Err(invalid("PRICE_STREAM_MIN_GAP_MS", "must be greater than 0"));
        }
        if self.stream.idle_poll.is_zero() {
            return Err(invalid("PRICE_STREAM_IDLE_POLL_MS", "must be greater than 0"));
        }
        if self.watcher.open_attempts == 0 {
            return Err(invalid("PRICE_STREAM_OPEN_ATTEMPTS", "must be at least 1"));
        }
        if self.simulation.tick_min > self.simulation.tick_max {
            return Err(invalid(
                "PRICE_STREAM_SIM_TICK_MIN_MS",
                "must not exceed PRICE_STREAM_SIM_TICK_MAX_MS",
            ));
        }
        if !(0.0..=1.0).contains(&self.simulation.fault_rate) {
            return Err(invalid("PRICE_STREAM_SIM_FAULT_RATE", "must be within 0.0..=1.0"));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable holds a value outside its accepted range.
    #[error("invalid value for {name}: {reason}")]
    InvalidValue {
        /// Variable name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn invalid(name: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        (self.lookup)(key).and_then(|v| v.trim().parse().ok())
    }

    fn u16(&self, key: &str, default: u16) -> u16 {
        self.parse(key).unwrap_or(default)
    }

    fn u32(&self, key: &str, default: u32) -> u32 {
        self.parse(key).unwrap_or(default)
    }

    fn usize(&self, key: &str, default: usize) -> usize {
        self.parse(key).unwrap_or(default)
    }

    fn f64(&self, key: &str, default: f64) -> f64 {
        self.parse(key).unwrap_or(default)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.parse::<u64>(key).map_or(default, Duration::from_millis)
    }

    fn string(&self, key: &str, default: String) -> String {
        (self.lookup)(key)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(default)
    }
}
