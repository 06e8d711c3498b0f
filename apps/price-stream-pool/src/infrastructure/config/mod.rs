//! Configuration Module
//!
//! Configuration loading for the price stream service.

mod settings;

pub use settings::{
    ConfigError, PoolSettings, ProxyConfig, ServerSettings, SimulationSettings, StreamSettings,
    WatcherSettings,
};
