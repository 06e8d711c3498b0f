//! Domain Layer - Subscription keys and stream records.
//!
//! Pure types shared by the pool and the stream driver. Nothing here
//! performs I/O or spawns tasks.

/// Per-subscriber stream records, latest-value cell and throttle.
pub mod streaming;

/// Subscription key normalization and validation.
pub mod subscription;
