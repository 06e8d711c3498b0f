//! Server-Sent Events Endpoint
//!
//! Exposes each throttled price stream over HTTP.
//!
//! # Endpoints
//!
//! - `GET /prices/{ticker}` - `text/event-stream` of price updates
//!
//! Prices are sent as unnamed events whose data is
//! `{"ticker": "...", "price": 123.45, "ts_ms": 1700000000000}`. Watcher
//! faults are sent as `event: fault` with `{"ticker": "...", "message": "..."}`
//! and do not end the stream. Closing the connection cancels the stream,
//! which releases its pool session.
//!
//! Every response carries the configured CORS origin with `Vary: Origin`,
//! and `OPTIONS` preflights are answered without reaching the pool.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE, ORIGIN};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::application::services::{PoolError, StreamDriver};
use crate::domain::streaming::StreamEvent;

/// Interval between keep-alive comments on idle streams.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

// =============================================================================
// Wire Payloads
// =============================================================================

#[derive(Debug, Serialize)]
struct PricePayload<'a> {
    ticker: &'a str,
    price: f64,
    ts_ms: i64,
}

#[derive(Debug, Serialize)]
struct FaultPayload<'a> {
    ticker: &'a str,
    message: &'a str,
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    error: String,
}

fn to_sse_event(event: &StreamEvent) -> Result<Event, axum::Error> {
    match event {
        StreamEvent::Price(update) => Event::default().json_data(PricePayload {
            ticker: update.key.as_str(),
            price: update.value,
            ts_ms: update.timestamp_ms(),
        }),
        StreamEvent::Fault(fault) => Event::default().event("fault").json_data(FaultPayload {
            ticker: fault.key.as_str(),
            message: &fault.message,
        }),
    }
}

// =============================================================================
// Server State
// =============================================================================

/// Shared state for the stream server.
#[derive(Debug)]
pub struct StreamServerState {
    driver: StreamDriver,
    cors_origin: Option<HeaderValue>,
}

impl StreamServerState {
    /// Create state serving streams from `driver`.
    ///
    /// An origin that is not a valid header value is ignored with a warning.
    #[must_use]
    pub fn new(driver: StreamDriver, cors_origin: &str) -> Self {
        let cors_origin = match HeaderValue::from_str(cors_origin) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(origin = cors_origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        };
        Self {
            driver,
            cors_origin,
        }
    }
}

// =============================================================================
// Stream Server
// =============================================================================

/// HTTP server for price streams.
pub struct StreamServer {
    port: u16,
    state: Arc<StreamServerState>,
    cancel: CancellationToken,
}

impl StreamServer {
    /// Create a new stream server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<StreamServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Build the router without binding a socket.
    #[must_use]
    pub fn router(state: Arc<StreamServerState>) -> Router {
        let cors = cors_layer(state.cors_origin.clone());
        Router::new()
            .route("/prices/{ticker}", get(prices_handler))
            .layer(cors)
            .with_state(state)
    }

    /// Run the server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `StreamServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), StreamServerError> {
        let app = Self::router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StreamServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Stream server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| StreamServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Stream server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

fn cors_layer(origin: Option<HeaderValue>) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([ACCEPT, CACHE_CONTROL, CONTENT_TYPE])
        .vary([ORIGIN]);
    match origin {
        Some(origin) => layer.allow_origin(AllowOrigin::exact(origin)),
        None => layer,
    }
}

async fn prices_handler(
    State(state): State<Arc<StreamServerState>>,
    Path(ticker): Path<String>,
) -> Response {
    match state.driver.subscribe(&ticker).await {
        Ok(stream) => {
            tracing::debug!(key = %stream.key(), stream_id = stream.stream_id(), "SSE client connected");
            let events = stream.map(|event| to_sse_event(&event));
            Sse::new(events)
                .keep_alive(
                    KeepAlive::new()
                        .interval(KEEP_ALIVE_INTERVAL)
                        .text("ping"),
                )
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

fn error_response(error: &PoolError) -> Response {
    let status = status_for(error);
    if status.is_server_error() {
        tracing::warn!(error = %error, "Stream request failed");
    }
    (
        status,
        Json(ErrorPayload {
            error: error.to_string(),
        }),
    )
        .into_response()
}

const fn status_for(error: &PoolError) -> StatusCode {
    match error {
        PoolError::InvalidKey(_) => StatusCode::BAD_REQUEST,
        PoolError::Open { .. } => StatusCode::BAD_GATEWAY,
        PoolError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Stream server errors.
#[derive(Debug, thiserror::Error)]
pub enum StreamServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
