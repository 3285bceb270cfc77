//! # pipeline-git — a git remote plugin for pipeline-core
//!
//! A concrete example of the plugin shape `pipeline-core` is built around:
//! [`RefsMonitor`] backs an `Input<Vec<GitRef>>` by polling a remote's ref
//! listing (falling back to a webhook-driven refresh when one is wired up
//! via [`pipeline_core::WebhookBroadcaster`]), and [`PublishStatus`] is a
//! [`pipeline_core::cache::Operation`] that POSTs a commit status, cached
//! and deduplicated by `pipeline-core`'s output cache the same way any
//! other side-effecting step would be.
//!
//! Neither type talks to the engine directly — they only produce an
//! `Input` or an `Operation`, which a pipeline wires into a `Term` the
//! usual way.

pub mod error;
pub mod refs;
pub mod status;
pub mod token;

pub use error::{GitError, Result};
pub use refs::{GitRef, RefsMonitor};
pub use status::{CommitKey, PublishStatus, StatusOutcome, StatusState, StatusValue};
pub use token::TokenCache;
