//! Error types for engine-internal failures.
//!
//! This is deliberately narrow: a failed computation is represented as
//! `Output::Error` (a *value*, produced and consumed entirely inside the
//! term/analysis machinery) and never as a Rust `Err`. `EngineError` only
//! covers conditions that are fatal to the process — structural bugs
//! rather than things a pipeline author's term can recover from — plus
//! the narrow seam where the cache's persistence hook can fail.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Structural failures that abort the engine loop rather than surface
/// through a term's `Output`.
#[derive(Error, Debug)]
pub enum EngineError {
    /// An analysis graph constructed during evaluation contained a cycle.
    /// This can only happen if a `Bind` continuation closes over its own
    /// input, which the evaluator treats as a programming error in the
    /// pipeline definition, not a recoverable `Output::Error`.
    #[error("analysis graph for {term} contains a cycle through node {node_id}")]
    AnalysisCycle { term: String, node_id: u64 },

    /// The write-through persistence hook on the output cache failed.
    /// The in-memory cache entry is still authoritative, this is surfaced
    /// so an `Engine` can log it, not so it can roll anything back.
    #[error("cache persistence hook failed for key {key_digest}: {source}")]
    Persistence {
        key_digest: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A monitor's configuration was invalid (e.g. a rate-limit window of
    /// zero), caught at `Monitor::new` rather than left to misbehave at
    /// runtime.
    #[error("invalid monitor configuration: {0}")]
    Configuration(String),
}
