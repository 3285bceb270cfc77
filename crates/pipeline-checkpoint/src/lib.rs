//! # pipeline-checkpoint — durable backing for the output cache
//!
//! `pipeline-core`'s output cache (see its `cache` module) is in-memory
//! authoritative: every entry lives in a `HashMap` for the life of the
//! process, and a durable backend is an optional bolt-on consulted only to
//! bootstrap that map on startup. This crate is that bolt-on's contract.
//!
//! [`CacheStore`] is a small write-through trait — `put` on every state
//! transition, `load_all` once at startup — kept in its own crate so a
//! durable backend (Postgres, Redis, ...) can depend on just this contract
//! without pulling in the evaluator. [`MemoryCacheStore`] is the reference
//! implementation, used by `pipeline-core`'s own tests and as its default
//! when no backend is configured.

pub mod cache_store;
pub mod error;

pub use cache_store::{CacheOutcome, CacheRecord, CacheStore, MemoryCacheStore};
pub use error::{Result, StoreError};
