//! Unified error handling for the sync layer.

use crate::api::ApiError;
use crate::config::ConfigError;

/// Errors surfaced by the session facade.
///
/// Per-operation replay failures never appear here; those land on the
/// operation record as `failed`/`conflict` and are observed through
/// `list_pending`/`status`/events.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("engine error: {0}")]
    Engine(#[from] tether_engine::Error),

    #[error("network error: {0}")]
    Api(#[from] ApiError),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for the sync layer.
pub type Result<T> = std::result::Result<T, SyncError>;
