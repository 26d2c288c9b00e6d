//! Crate-level error type.
//!
//! Each subsystem defines its own `thiserror` enum ([`ConfigError`],
//! [`ConsentError`], [`StorageError`], [`QueueError`]); this module
//! aggregates them into [`AnalyticsError`] for the collector surface.

use thiserror::Error;

use crate::config::ConfigError;
use crate::consent::ConsentError;
use crate::queue::QueueError;
use crate::storage::StorageError;

/// Errors surfaced by collector operations.
///
/// `collect_*` calls never return this type; failures there are logged
/// and counted instead. Lifecycle and maintenance operations
/// (`destroy`, `export_data`, `delete_all_data`, consent handling)
/// propagate it.
#[derive(Error, Debug)]
pub enum AnalyticsError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Consent record load or persistence error.
    #[error("consent error: {0}")]
    Consent(#[from] ConsentError),

    /// Storage engine error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Event queue error.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// A specialized `Result` type for analytics operations.
pub type Result<T> = std::result::Result<T, AnalyticsError>;
