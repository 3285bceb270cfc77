//! The output cache: a deduplicating, at-most-one-in-flight publisher
//! keyed by `digest(operation-id, key)`.
//!
//! Backs side-effecting operations like "POST a status to an external
//! service": repeated `set(k, v)` calls for the same
//! key collapse onto one in-flight job, an external `rebuild()` or a
//! `valid_for` schedule can force a fresh run, and every state
//! transition is optionally mirrored to a [`CacheStore`] for durability.
//! The in-memory entry is always authoritative; the store is consulted
//! only to bootstrap on startup.
//!
//! Each entry is exposed as an [`Input`], the same seam [`Monitor`](crate::monitor::Monitor)
//! uses to back a `Primitive` term — a pipeline reads a cache entry's
//! current status by wrapping the `Input` returned from [`Cache::set`]
//! in `Term::primitive`.

use crate::digest::{Digest, Digestible};
use crate::input::{Input, JobId};
use crate::output::{Msg, Output};
use async_trait::async_trait;
use parking_lot::Mutex;
use pipeline_checkpoint::{CacheOutcome, CacheRecord, CacheStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation switch handed to a running job: the job
/// observes the switch at suspension points and must clean up on its
/// own. Checking it is the job's responsibility — the cache does not
/// forcibly abort the task, since `auto_cancel: false` operations must
/// be allowed to run to completion.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The side-effecting computation an output cache fronts.
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    type Key: Digestible + Clone + Send + Sync + 'static;
    type Value: Digestible + Clone + Send + Sync + 'static;
    type Outcome: Clone + Send + Sync + 'static + serde::Serialize + serde::de::DeserializeOwned;

    /// Globally unique operation name, namespacing this operation's keys
    /// from every other operation sharing the process.
    fn id(&self) -> &str;

    /// If `true`, a new `set(k, v')` while `(k, v)` is running cancels
    /// the in-flight job and starts over immediately. If `false`, the
    /// running job completes and `v'` starts right after.
    fn auto_cancel(&self) -> bool {
        false
    }

    /// How long a successful run stays valid before the entry is treated
    /// as needing a rebuild on the next `set`. `None` means "forever,
    /// until an explicit `rebuild()`".
    fn valid_for(&self) -> Option<Duration> {
        None
    }

    async fn publish(&self, job: JobId, key: &Self::Key, value: &Self::Value, cancel: CancelToken) -> Result<Self::Outcome, Msg>;

    /// Short description for logs and the analysis node's label.
    fn pp(&self, key: &Self::Key, value: &Self::Value) -> String;
}

struct Running<Op: Operation> {
    cancel: CancelToken,
    /// Sticky: the most recent value requested while this job was
    /// in-flight (non-`auto_cancel` path). Run once the current job
    /// finishes.
    queued: Option<Op::Value>,
}

struct Entry<Op: Operation> {
    input: Input<Op::Outcome>,
    build: u64,
    rebuild_requested: bool,
    valid_until: Option<Instant>,
    running: Option<Running<Op>>,
}

impl<Op: Operation> Entry<Op> {
    fn fresh() -> Self {
        Entry {
            input: Input::new(Output::active_running("booting")),
            build: 0,
            rebuild_requested: false,
            valid_until: None,
            running: None,
        }
    }

    fn needs_run(&self) -> bool {
        self.build == 0
            || self.rebuild_requested
            || self.valid_until.map(|t| Instant::now() >= t).unwrap_or(false)
    }
}

/// A deduplicating publisher for one [`Operation`]. Cheap to clone —
/// clones share the same entry table.
pub struct Cache<Op: Operation> {
    operation: Op,
    store: Option<Arc<dyn CacheStore>>,
    entries: Mutex<HashMap<Digest, Entry<Op>>>,
}

impl<Op> Cache<Op>
where
    Op: Operation,
{
    pub fn new(operation: Op) -> Arc<Self> {
        Arc::new(Cache {
            operation,
            store: None,
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_store(operation: Op, store: Arc<dyn CacheStore>) -> Arc<Self> {
        Arc::new(Cache {
            operation,
            store: Some(store),
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Bootstrap the in-memory entries from the persisted layout; this is
    /// read only once, to seed the in-memory cache on startup. Bootstrapped
    /// entries carry their last known outcome but no running job; a
    /// subsequent `set` re-evaluates `needs_run` normally.
    pub async fn bootstrap(self: &Arc<Self>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Some(store) = &self.store else { return Ok(()) };
        for record in store.load_all().await.map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)? {
            if record.op_id != self.operation.id() {
                continue;
            }
            let digest = Digest::from_hex(record.key_digest.clone());
            let output = match record.outcome {
                CacheOutcome::Ok(v) => Output::Ok(
                    serde_json::from_value(v).map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?,
                ),
                CacheOutcome::Error(m) => Output::Error(Msg::new(m)),
                CacheOutcome::Pending => Output::active_running("resumed"),
            };
            let mut entries = self.entries.lock();
            let entry = entries.entry(digest).or_insert_with(Entry::fresh);
            entry.build = record.build;
            entry.rebuild_requested = record.rebuild_requested;
            entry.input.set(output, Some(JobId(record.job_id)));
        }
        Ok(())
    }

    /// Ensure a run exists for `key` using `value` per the entry state
    /// machine above, and return the `Input` a `Primitive` term
    /// reads the key's current status from. Never blocks on the job
    /// itself.
    pub fn set(self: &Arc<Self>, key: Op::Key, value: Op::Value) -> Input<Op::Outcome> {
        let digest = Digest::of(self.operation.id(), &key);
        let mut entries = self.entries.lock();
        let entry = entries.entry(digest.clone()).or_insert_with(Entry::fresh);
        let input = entry.input.clone();

        if let Some(running) = &mut entry.running {
            if self.operation.auto_cancel() {
                running.cancel.cancel();
                entry.running = None;
                drop(entries);
                self.start_run(digest, key, value);
            } else {
                running.queued = Some(value);
            }
            return input;
        }

        let should_run = entry.needs_run();
        drop(entries);
        if should_run {
            self.start_run(digest, key, value);
        }
        input
    }

    /// Mark `key` as needing a rebuild on its next `set`, or — if a job
    /// is already running for it — once that job completes and no
    /// `auto_cancel` restart has already superseded it.
    pub fn rebuild(&self, key: &Op::Key) {
        let digest = Digest::of(self.operation.id(), key);
        if let Some(entry) = self.entries.lock().get_mut(&digest) {
            entry.rebuild_requested = true;
        }
    }

    pub fn build_count(&self, key: &Op::Key) -> u64 {
        let digest = Digest::of(self.operation.id(), key);
        self.entries.lock().get(&digest).map(|e| e.build).unwrap_or(0)
    }

    fn start_run(self: &Arc<Self>, digest: Digest, key: Op::Key, value: Op::Value) {
        let cancel = CancelToken::new();
        let build = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(digest.clone()).or_insert_with(Entry::fresh);
            entry.build += 1;
            entry.rebuild_requested = false;
            entry.valid_until = None;
            entry.running = Some(Running {
                cancel: cancel.clone(),
                queued: None,
            });
            entry.input.set(Output::active_running(self.operation.pp(&key, &value)), None);
            entry.build
        };
        let job_id = JobId(format!("{}-{}-{}", self.operation.id(), digest, build));
        self.record(CacheRecord {
            op_id: self.operation.id().to_string(),
            key_digest: digest.as_str().to_string(),
            build,
            value_digest: Digest::of(self.operation.id(), &value).as_str().to_string(),
            outcome: CacheOutcome::Pending,
            job_id: job_id.0.clone(),
            ready_ts: None,
            running_ts: Some(chrono::Utc::now()),
            finished_ts: None,
            rebuild_requested: false,
        });

        let this = self.clone();
        let cancel_for_job = cancel.clone();
        tokio::spawn(async move {
            let outcome = this.operation.publish(job_id.clone(), &key, &value, cancel_for_job.clone()).await;
            this.finish_run(digest, build, job_id, key, value, outcome, cancel_for_job).await;
        });
    }

    async fn finish_run(
        self: Arc<Self>,
        digest: Digest,
        build: u64,
        job_id: JobId,
        key: Op::Key,
        value: Op::Value,
        outcome: Result<Op::Outcome, Msg>,
        cancel: CancelToken,
    ) {
        if cancel.is_cancelled() {
            // Superseded by an `auto_cancel` restart; the newer job owns
            // this entry's state now.
            return;
        }
        let queued = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&digest) else { return };
            if entry.build != build {
                return;
            }
            let queued = entry.running.take().and_then(|r| r.queued);
            entry.valid_until = self.operation.valid_for().map(|d| Instant::now() + d);
            let output = match &outcome {
                Ok(v) => Output::Ok(v.clone()),
                Err(m) => Output::Error(m.clone()),
            };
            entry.input.set(output, Some(job_id.clone()));
            queued
        };

        let value_digest = Digest::of(self.operation.id(), &value);
        self.record(CacheRecord {
            op_id: self.operation.id().to_string(),
            key_digest: digest.as_str().to_string(),
            build,
            value_digest: value_digest.as_str().to_string(),
            outcome: encode_outcome(&outcome),
            job_id: job_id.0.clone(),
            ready_ts: Some(chrono::Utc::now()),
            running_ts: None,
            finished_ts: Some(chrono::Utc::now()),
            rebuild_requested: false,
        });

        if let Some(queued_value) = queued {
            self.start_run(digest, key, queued_value);
        }
    }

    fn record(self: &Arc<Self>, record: CacheRecord) {
        let Some(store) = self.store.clone() else { return };
        tokio::spawn(async move {
            let key_digest = record.key_digest.clone();
            if let Err(err) = store.put(record).await {
                let err = crate::error::EngineError::Persistence {
                    key_digest,
                    source: Box::new(err),
                };
                tracing::error!(error = %err, "cache persistence hook failed");
            }
        });
    }
}

fn encode_outcome<T: serde::Serialize>(outcome: &Result<T, Msg>) -> CacheOutcome {
    match outcome {
        Ok(v) => match serde_json::to_value(v) {
            Ok(json) => CacheOutcome::Ok(json),
            Err(e) => CacheOutcome::Error(format!("outcome serialization failed: {e}")),
        },
        Err(m) => CacheOutcome::Error(m.to_string()),
    }
}
