//! Price Stream Pool Binary
//!
//! Serves throttled price streams over server-sent events, backed by a
//! pool of simulated watchers.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin price-stream-pool
//! curl -N http://localhost:8080/prices/BTCUSDT
//! ```
//!
//! # Environment Variables
//!
//! - `PRICE_STREAM_PORT`: SSE server port (default: 8080)
//! - `PRICE_STREAM_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `PRICE_STREAM_MAX_SESSIONS`: Soft pool capacity (default: 6)
//! - `PRICE_STREAM_GRACE_MS`: Idle grace before close (default: 10000)
//! - `PRICE_STREAM_MIN_GAP_MS`: Minimum gap between emitted values (default: 200)
//! - `PRICE_STREAM_CORS_ORIGIN`: Allowed browser origin (default: <http://localhost:3000>)
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: false)
//! - `RUST_LOG`: Log filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use price_stream_pool::application::ports::Watcher;
use price_stream_pool::infrastructure::health::{HealthServer, HealthServerState};
use price_stream_pool::infrastructure::sse::{StreamServer, StreamServerState};
use price_stream_pool::infrastructure::telemetry;
use price_stream_pool::infrastructure::watcher::{
    RetryingWatcher, SimulatedWatcher, SimulationConfig,
};
use price_stream_pool::{PoolConfig, ProxyConfig, ResourcePool, StreamConfig, StreamDriver, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let _telemetry_guard = telemetry::init()?;

    tracing::info!("Starting Price Stream Pool");

    let _metrics_handle = init_metrics();

    let config = ProxyConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let watcher = Arc::new(RetryingWatcher::from_settings(
        SimulatedWatcher::new(SimulationConfig::from(&config.simulation)),
        &config.watcher,
    ));
    let pool = ResourcePool::new(
        Arc::clone(&watcher) as Arc<dyn Watcher>,
        PoolConfig::from(&config.pool),
    );
    let driver = StreamDriver::new(pool, StreamConfig::from(&config.stream));

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        driver.clone(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );

    let stream_state = Arc::new(StreamServerState::new(
        driver.clone(),
        &config.server.cors_origin,
    ));
    let stream_server = StreamServer::new(
        config.server.stream_port,
        stream_state,
        shutdown_token.clone(),
    );

    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let stream_task = tokio::spawn(async move {
        if let Err(e) = stream_server.run().await {
            tracing::error!(error = %e, "Stream server error");
        }
    });

    tracing::info!("Price stream pool ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, driver.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Pool shutdown timed out");
    }
    watcher.inner().shutdown();

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, stream_task)
        .await
        .is_err()
    {
        tracing::warn!("Stream server did not stop in time");
    }

    tracing::info!("Price stream pool stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &ProxyConfig) {
    tracing::info!(
        stream_port = config.server.stream_port,
        health_port = config.server.health_port,
        max_sessions = config.pool.max_sessions,
        grace_ms = u64::try_from(config.pool.grace_period.as_millis()).unwrap_or(u64::MAX),
        min_gap_ms = u64::try_from(config.stream.min_gap.as_millis()).unwrap_or(u64::MAX),
        "Configuration loaded"
    );
    tracing::debug!(
        open_attempts = config.watcher.open_attempts,
        open_timeout_ms = u64::try_from(config.watcher.open_timeout.as_millis()).unwrap_or(u64::MAX),
        fault_rate = config.simulation.fault_rate,
        cors_origin = %config.server.cors_origin,
        "Watcher settings"
    );
}

/// Load .env file from any ancestor directory.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
