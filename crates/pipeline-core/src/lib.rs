//! # pipeline-core — an incremental term engine
//!
//! An OCurrent-style evaluation model: pipelines are described as lazy
//! [`Term`](term::Term) values built from a small DSL (`map`, `pair`,
//! `bind`, `catch`, `gate`, `list_map`, ...), evaluated repeatedly against
//! a set of mutable [`Input`](input::Input) cells. Each evaluation produces
//! a tri-valued [`Output`](output::Output) — `Ok`, `Active`, or `Error` —
//! together with an [`Analysis`](analysis::Analysis) dependency graph
//! explaining how that status was reached.
//!
//! ## Core Concepts
//!
//! ### 1. Output — the tri-valued result
//!
//! [`Output<T>`](output::Output) distinguishes "done" from "not yet" from
//! "failed", which a plain `Result<T, E>` cannot: `Active` carries a reason
//! (`Running` or `ReadyToRerun`) a renderer can show a human while the
//! pipeline converges.
//!
//! ### 2. Input — the only mutable state
//!
//! [`Input<T>`](input::Input) is a subscribable cell with a stable identity
//! across evaluations. [`Monitor<T>`](monitor::Monitor) is the standard way
//! a plugin backs one from a `read`/`watch` pair, driving the
//! Idle → Watching+Fetching → Watching+Ready state machine with
//! rate-limited refresh coalescing and exponential backoff on watch
//! failures.
//!
//! ### 3. Term — lazy, composable computation
//!
//! A [`Term<T>`](term::Term) describes a computation without running it;
//! [`Term::eval`](term::Term::eval) interprets it once against the current
//! input state, returning `(Output<T>, Analysis, depends_on)`. Evaluation
//! is pure: the same term against the same input state always yields the
//! same status and a structurally identical analysis.
//!
//! ### 4. Cache — deduplicated side effects
//!
//! [`Cache<Op>`](cache::Cache) fronts a side-effecting
//! [`Operation`](cache::Operation) (e.g. "POST a status") with a
//! single-flight, digest-keyed publisher: concurrent `set` calls for the
//! same key collapse onto one in-flight job, `auto_cancel` operations
//! restart instead of queuing, and every state transition can be mirrored
//! to a [`pipeline_checkpoint::CacheStore`] for durability.
//!
//! ### 5. Engine — the tick loop
//!
//! [`Engine`](engine::Engine) repeatedly evaluates a pipeline, publishes
//! its `(Output, Analysis)` snapshot, subscribes one-shot refreshes on
//! every input the pass depended on, and suspends until one fires or an
//! external ["rerun now"](engine::WebhookBroadcaster) signal arrives.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pipeline_core::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let input: Input<i32> = Input::new(Output::ok(1));
//!     let pipeline_input = input.clone();
//!
//!     let engine = Engine::create(EngineConfig::default(), move || {
//!         Term::primitive(pipeline_input.clone(), "count").map(|n| n * 2)
//!     });
//!
//!     let mut snapshots = engine.snapshots();
//!     tokio::spawn(engine.clone().thread());
//!
//!     snapshots.changed().await.unwrap();
//!     println!("{:?}", snapshots.borrow().output);
//!
//!     input.set(Output::ok(2), None);
//!     snapshots.changed().await.unwrap();
//!     println!("{:?}", snapshots.borrow().output);
//! }
//! ```

pub mod analysis;
pub mod cache;
pub mod digest;
pub mod engine;
pub mod error;
pub mod input;
pub mod monitor;
pub mod output;
pub mod term;

pub use analysis::{Analysis, Edge, Node, NodeId, NodeKind, NodeState};
pub use cache::{Cache, CancelToken, Operation};
pub use digest::{Digest, Digestible};
pub use engine::{Engine, EngineConfig, Snapshot, WebhookBroadcaster, WebhookSubscription};
pub use error::{EngineError, Result};
pub use input::{Input, InputId, JobId, Subscription};
pub use monitor::{Backoff, Monitor, MonitorConfig};
pub use output::{Active, Msg, Output};
pub use term::{AnySubscribe, Term};

/// Glob-importable surface for consumers building pipelines: `use
/// pipeline_core::prelude::*;` pulls in the types needed to construct
/// inputs, terms, and an engine without reaching into individual modules.
pub mod prelude {
    pub use crate::{
        Active, Analysis, Cache, CancelToken, Digest, Digestible, Engine, EngineConfig, EngineError, Input, InputId,
        JobId, Monitor, MonitorConfig, Msg, Operation, Output, Snapshot, Term, WebhookBroadcaster,
    };
}
