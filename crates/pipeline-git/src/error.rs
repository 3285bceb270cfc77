//! Error types for the git remote plugin.

use pipeline_core::{EngineError, Msg};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GitError>;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("http request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected response from {url}: status {status}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("response body from {url} could not be decoded: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("token acquisition failed: {0}")]
    Auth(String),

    #[error("invalid monitor configuration: {0}")]
    Configuration(#[from] EngineError),
}

/// The engine never throws across component boundaries — a plugin
/// converts its own error type into `Msg` at the `Input`/`Operation`
/// boundary rather than leaking it.
impl From<GitError> for Msg {
    fn from(e: GitError) -> Self {
        Msg::new(e.to_string())
    }
}
