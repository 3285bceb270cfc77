//! Write-through persistence for the output cache's entries.
//!
//! The output cache in `pipeline-core` is in-memory authoritative — a
//! durable backend is an optional bolt-on, consulted only to bootstrap
//! the in-memory state on startup. [`CacheStore`] is that seam: state
//! persisted behind a trait object rather than a concrete backend.
//!
//! [`MemoryCacheStore`] is the reference implementation; production
//! deployments plug in their own (Postgres, Redis, ...).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::Result;

/// The outcome half of a persisted cache row. Kept as a loosely-typed
/// JSON payload rather than a generic parameter: the store is a single
/// trait object shared across every operation's cache, so it cannot be
/// generic over each operation's own `Outcome` type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CacheOutcome {
    Pending,
    Ok(serde_json::Value),
    Error(String),
}

/// One row of the persisted cache layout: `{op_id, key_digest, build,
/// value_digest, outcome, job_id, ready_ts, running_ts, finished_ts,
/// rebuild_requested}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheRecord {
    pub op_id: String,
    pub key_digest: String,
    pub build: u64,
    pub value_digest: String,
    pub outcome: CacheOutcome,
    pub job_id: String,
    pub ready_ts: Option<DateTime<Utc>>,
    pub running_ts: Option<DateTime<Utc>>,
    pub finished_ts: Option<DateTime<Utc>>,
    pub rebuild_requested: bool,
}

/// Write-through persistence hook for the output cache. Called on every
/// state transition (`None -> Running`, `Running -> Finished`, rebuild).
/// The cache never blocks waiting on this — failures are logged by the
/// caller and do not affect the in-memory entry, which remains
/// authoritative.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn put(&self, record: CacheRecord) -> Result<()>;

    /// Bootstrap: the engine calls this once at startup to seed the
    /// in-memory cache with whatever a previous process last persisted.
    async fn load_all(&self) -> Result<Vec<CacheRecord>>;
}

/// Reference [`CacheStore`] backed by a `HashMap`, keyed by
/// `(op_id, key_digest)`. Ephemeral — useful for tests and single-process
/// deployments, not for surviving a restart.
#[derive(Default)]
pub struct MemoryCacheStore {
    records: RwLock<HashMap<(String, String), CacheRecord>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove everything. Test isolation helper.
    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn put(&self, record: CacheRecord) -> Result<()> {
        let key = (record.op_id.clone(), record.key_digest.clone());
        self.records.write().await.insert(key, record);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<CacheRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}
