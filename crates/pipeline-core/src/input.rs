//! Mutable cells holding a live, subscribable `Output<T>`.
//!
//! An `Input<T>` is the engine's only mutable state. Its identity (the
//! `InputId` handed out at construction) is stable across term
//! re-evaluations, which is how the engine recognizes "same input as
//! before" when diffing one evaluation's `depends_on` set against the
//! next. Reading is always non-blocking — the cached `Output` is returned
//! immediately; a background refresh (driven by a `Monitor`, see
//! `monitor.rs`) is what keeps it current.

use crate::output::Output;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_INPUT_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of an `Input`, independent of its value type. Used as
/// the element type of a term evaluation's `depends_on` set (§4.4) since
/// that set mixes inputs of unrelated `T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputId(u64);

/// Identifies the job (build, fetch, publish) an input's current value is
/// attributed to, for display on the corresponding analysis node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type RefreshFn = Box<dyn Fn() + Send + Sync>;

struct Subscriber {
    id: u64,
    refresh: RefreshFn,
}

struct InputInner<T> {
    id: InputId,
    current: RwLock<(Output<T>, Option<JobId>)>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber_id: AtomicU64,
    /// Fired whenever the subscriber count transitions between zero and
    /// non-zero. `Monitor` installs this to drive its Idle/Watching state
    /// machine (§4.3): `read`/`watch` only run while at least one
    /// subscriber exists.
    lifecycle_hook: Option<Arc<dyn Fn(bool) + Send + Sync>>,
}

/// A live, subscribable source of values external to the term tree.
/// Cheap to clone — clones share the same underlying cell, which is the
/// mechanism by which a `Primitive` term and a `Monitor`'s background
/// refresh task observe the same state.
pub struct Input<T> {
    inner: Arc<InputInner<T>>,
}

impl<T> Clone for Input<T> {
    fn clone(&self) -> Self {
        Input {
            inner: self.inner.clone(),
        }
    }
}

/// Returned by `Input::subscribe`. Dropping it does *not* unsubscribe —
/// unsubscription is explicit via `unsubscribe()`, matching the contract
/// that callers control the lifetime of their subscription rather than
/// tying it to a guard's drop order (which is easy to get wrong across
/// `tokio::select!` branches).
pub struct Subscription<T> {
    input: Input<T>,
    id: u64,
    active: std::sync::atomic::AtomicBool,
}

impl<T> Subscription<T> {
    /// Remove this subscriber. Idempotent: calling it twice, or after the
    /// input has already dropped the callback internally, is a no-op.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            let became_empty = {
                let mut subs = self.input.inner.subscribers.lock();
                subs.retain(|s| s.id != self.id);
                subs.is_empty()
            };
            if became_empty {
                if let Some(hook) = &self.input.inner.lifecycle_hook {
                    hook(false);
                }
            }
        }
    }
}

impl<T: Clone> Input<T> {
    /// Construct a new input seeded with an initial status and no job
    /// attribution. Plugins normally wrap this behind `Monitor` rather
    /// than calling it directly.
    pub fn new(initial: Output<T>) -> Self {
        Self::with_lifecycle_hook(initial, None)
    }

    /// As `new`, but `on_active` is invoked with `true` when the
    /// subscriber count goes 0 -> 1 and `false` when it goes 1 -> 0.
    /// `pub(crate)` because only `Monitor` has a reason to drive behavior
    /// off this transition; ordinary inputs ignore it.
    pub(crate) fn with_lifecycle_hook(
        initial: Output<T>,
        on_active: Option<Arc<dyn Fn(bool) + Send + Sync>>,
    ) -> Self {
        let id = InputId(NEXT_INPUT_ID.fetch_add(1, Ordering::Relaxed));
        Input {
            inner: Arc::new(InputInner {
                id,
                current: RwLock::new((initial, None)),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber_id: AtomicU64::new(1),
                lifecycle_hook: on_active,
            }),
        }
    }

    pub fn id(&self) -> InputId {
        self.inner.id
    }

    /// `get(env, input) -> (Output<T>, optional job_id)`. Non-blocking:
    /// returns whatever is currently cached. The `env` parameter in the
    /// spec's signature is the evaluation environment (`term::Env`),
    /// which registers this read as a dependency — that bookkeeping
    /// happens in `term::eval`, not here, so `Input::get` itself takes no
    /// environment argument.
    pub fn get(&self) -> (Output<T>, Option<JobId>) {
        self.inner.current.read().clone()
    }

    /// Overwrite the current value and notify subscribers at-least-once.
    /// Called by a `Monitor`'s read/watch loop, never by term evaluation.
    pub fn set(&self, output: Output<T>, job_id: Option<JobId>) {
        *self.inner.current.write() = (output, job_id);
        self.notify();
    }

    /// Re-deliver a change notification without altering the stored
    /// value. Used when a watcher fires but the monitor wants the next
    /// fetch to happen before publishing a new value — the refresh still
    /// needs to reach subscribers so the engine knows to wait for it.
    pub fn notify(&self) {
        let subs = self.inner.subscribers.lock();
        for s in subs.iter() {
            (s.refresh)();
        }
    }

    /// `subscribe(input, refresh_fn) -> unsubscribe_handle`. `refresh_fn`
    /// is called at most once per underlying change notification and
    /// must be safe to call concurrently — callers typically hand in a
    /// oneshot-channel sender or a `Notify::notify_one` closure.
    pub fn subscribe(&self, refresh: impl Fn() + Send + Sync + 'static) -> Subscription<T> {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let became_active = {
            let mut subs = self.inner.subscribers.lock();
            let was_empty = subs.is_empty();
            subs.push(Subscriber {
                id,
                refresh: Box::new(refresh),
            });
            was_empty
        };
        if became_active {
            if let Some(hook) = &self.inner.lifecycle_hook {
                hook(true);
            }
        }
        Subscription {
            input: self.clone(),
            id,
            active: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

impl<T> fmt::Debug for Input<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Input").field("id", &self.inner.id).finish()
    }
}
