//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the process-level plumbing.

/// Listener registry implementing the event source port.
pub mod broadcast;

/// Configuration from environment variables.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Server-sent events endpoint for price streams.
pub mod sse;

/// Logging and OpenTelemetry tracing setup.
pub mod telemetry;

/// Watcher implementations and decorators.
pub mod watcher;
