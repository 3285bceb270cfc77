//! Error types for [`crate::CacheStore`] backends.

use thiserror::Error;

/// Result type for `CacheStore` operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Failures a [`crate::CacheStore`] implementation can report. The output
/// cache in `pipeline-core` never treats these as fatal — a failed `put`
/// is logged and the in-memory entry stays authoritative.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("{0}")]
    Custom(String),
}
