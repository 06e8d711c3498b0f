//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (watchers, event sources).
pub mod ports;

/// Application services for session pooling and stream driving.
pub mod services;
