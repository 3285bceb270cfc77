//! The evaluation loop driving a `Term<()>` pipeline to convergence.
//!
//! Evaluate the pipeline, publish its output and analysis atomically to
//! observers, reconcile the set of inputs the pass depended on against
//! what the previous tick subscribed to, suspend until one fires (or an
//! external "rerun now" signal arrives), repeat. A coalescing window
//! between ticks (default >= 100ms) is the starvation guard.
//!
//! A dependency that survives unchanged from one tick to the next keeps
//! its subscription open rather than being unsubscribed and immediately
//! re-subscribed: a `Monitor`-backed input treats subscriber count as a
//! keep-alive signal for its background watch, and churning that count
//! every tick would otherwise start and stop the watch on every
//! coalescing window.

use crate::analysis::Analysis;
use crate::error::EngineError;
use crate::input::InputId;
use crate::output::Output;
use crate::term::{AnySubscribe, Term};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Tuning knobs for the tick loop and its graceful-shutdown contract.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identifies this pipeline in diagnostics, including the `term` field
    /// of an `EngineError::AnalysisCycle`.
    pub name: String,
    /// Minimum spacing between ticks, so a burst of simultaneous refreshes
    /// coalesces onto one re-evaluation instead of spinning.
    pub coalescing_window: Duration,
    /// How long `request_shutdown` waits for jobs registered via
    /// `Engine::track_job` to finish before the loop returns anyway.
    pub shutdown_deadline: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            name: "pipeline".to_string(),
            coalescing_window: Duration::from_millis(100),
            shutdown_deadline: Duration::from_secs(30),
        }
    }
}

/// One tick's published result: the pipeline's current top-level status
/// and the dependency graph that produced it, published together so
/// observers never see a status without the analysis that explains it.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub output: Output<()>,
    pub analysis: Analysis,
}

/// Fan-out for an external "something may have changed" signal, such as
/// an HTTP webhook handler. Kept as an explicit object owned by the
/// engine rather than global state, so a process can run more than one
/// engine without their webhook fan-outs colliding. A plugin wires a
/// `Monitor`'s `watch` callback to `subscribe` so several inputs can
/// share one inbound channel instead of each polling on its own
/// schedule.
#[derive(Default)]
pub struct WebhookBroadcaster {
    subscribers: Mutex<Vec<(u64, Arc<dyn Fn() + Send + Sync>)>>,
    next_id: AtomicU64,
}

impl WebhookBroadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(WebhookBroadcaster::default())
    }

    pub fn subscribe(self: &Arc<Self>, refresh: impl Fn() + Send + Sync + 'static) -> WebhookSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().push((id, Arc::new(refresh)));
        WebhookSubscription {
            broadcaster: self.clone(),
            id,
        }
    }

    /// Invoke every currently-registered subscriber once. Fan-out is
    /// one-shot per subscription; missed signals are permissible, since
    /// subsequent signals recover.
    pub fn fire(&self) {
        let subs: Vec<_> = self.subscribers.lock().unwrap().iter().map(|(_, f)| f.clone()).collect();
        tracing::debug!(subscriber_count = subs.len(), "webhook fired");
        for f in subs {
            f();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

pub struct WebhookSubscription {
    broadcaster: Arc<WebhookBroadcaster>,
    id: u64,
}

impl WebhookSubscription {
    pub fn unsubscribe(&self) {
        self.broadcaster.subscribers.lock().unwrap().retain(|(id, _)| *id != self.id);
    }
}

/// Runs one pipeline's tick loop and publishes its snapshots.
pub struct Engine {
    config: EngineConfig,
    pipeline: Box<dyn Fn() -> Term<()> + Send + Sync>,
    tx: watch::Sender<Snapshot>,
    rerun_now: Notify,
    shutdown: AtomicBool,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    /// Fires whenever any currently-live subscription refreshes. Shared
    /// across ticks so a dependency kept alive from one tick to the next
    /// wakes the loop through the same `Notify` it was subscribed with.
    woke: Arc<Notify>,
    /// Subscriptions currently open, keyed by the input they watch, so a
    /// tick can diff its dependency set against what is already live
    /// instead of tearing every subscription down and rebuilding it.
    live_subs: Mutex<HashMap<InputId, Box<dyn FnOnce() + Send>>>,
}

impl Engine {
    /// `create(config, pipeline)`: `pipeline` is called fresh at the start
    /// of every tick, not memoized, since the term tree itself is the
    /// description and evaluating it is what reads the current input
    /// state.
    pub fn create(config: EngineConfig, pipeline: impl Fn() -> Term<()> + Send + Sync + 'static) -> Arc<Self> {
        let (tx, _rx) = watch::channel(Snapshot {
            output: Output::active_running("booting"),
            analysis: Analysis::booting(),
        });
        Arc::new(Engine {
            config,
            pipeline: Box::new(pipeline),
            tx,
            rerun_now: Notify::new(),
            shutdown: AtomicBool::new(false),
            in_flight: Mutex::new(Vec::new()),
            woke: Arc::new(Notify::new()),
            live_subs: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribe to published snapshots. A `watch::Receiver` always has
    /// the most recently published value available without waiting, so a
    /// late subscriber immediately sees the current status rather than
    /// only future ones.
    pub fn snapshots(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    /// Force a re-evaluation on the next coalescing-window boundary,
    /// independent of any input's own change notification. Used by
    /// operator-triggered "rerun now" controls.
    pub fn rerun_now(&self) {
        self.rerun_now.notify_one();
    }

    /// Register a background job (e.g. a cache publish's `tokio::spawn`
    /// handle) the engine should wait for, up to `shutdown_deadline`,
    /// before a graceful shutdown returns. Opportunistically drops handles
    /// for jobs that have already finished so this list does not grow
    /// without bound across a long-running engine.
    pub fn track_job(&self, handle: JoinHandle<()>) {
        let mut jobs = self.in_flight.lock().unwrap();
        jobs.retain(|h| !h.is_finished());
        jobs.push(handle);
    }

    /// Begin a graceful shutdown: the current tick (if any) finishes and
    /// publishes, then the loop drains tracked jobs and returns instead of
    /// starting another tick.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.rerun_now.notify_one();
    }

    /// Runs the tick loop. Terminates only on cancellation — here,
    /// `request_shutdown`. Intended to be driven by
    /// `tokio::spawn(engine.clone().thread())`.
    pub async fn thread(self: Arc<Self>) {
        loop {
            let pipeline = (self.pipeline)();
            let (output, analysis, subs) = pipeline.eval_with_subscriptions();

            if let Err(node_id) = analysis.assert_acyclic() {
                let err = EngineError::AnalysisCycle {
                    term: self.config.name.clone(),
                    node_id: node_id.0,
                };
                tracing::error!(error = %err, "engine tick aborted");
                self.sync_subscriptions(&[]);
                return;
            }

            tracing::info!(
                node_count = analysis.nodes().len(),
                dep_count = subs.len(),
                status = ?output,
                "engine tick"
            );

            let _ = self.tx.send(Snapshot {
                output,
                analysis,
            });

            if self.shutdown.load(Ordering::SeqCst) {
                self.sync_subscriptions(&[]);
                self.drain_shutdown().await;
                return;
            }

            self.sync_subscriptions(&subs);

            tokio::select! {
                _ = self.woke.notified() => {}
                _ = self.rerun_now.notified() => {}
            }

            if self.shutdown.load(Ordering::SeqCst) {
                self.sync_subscriptions(&[]);
                self.drain_shutdown().await;
                return;
            }

            tokio::time::sleep(self.config.coalescing_window).await;
        }
    }

    /// Reconcile the live subscription table against `subs`, the current
    /// tick's dependency set. A dependency present in both the table and
    /// `subs` is left untouched — not unsubscribed and re-subscribed —
    /// so a `Monitor`-backed input's subscriber count never drops to
    /// zero while it remains a dependency across ticks. Only genuinely
    /// dropped dependencies are unsubscribed and only genuinely new ones
    /// are subscribed, both keyed by `InputId` rather than by the
    /// `Arc<dyn AnySubscribe>` handle's own identity, since a fresh
    /// evaluation pass constructs a new handle object for the same
    /// underlying input on every tick.
    fn sync_subscriptions(&self, subs: &[Arc<dyn AnySubscribe>]) {
        let current: HashMap<InputId, &Arc<dyn AnySubscribe>> = subs.iter().map(|handle| (handle.input_id(), handle)).collect();
        let mut live = self.live_subs.lock().unwrap();

        let dropped: Vec<InputId> = live.keys().copied().filter(|id| !current.contains_key(id)).collect();
        for id in dropped {
            if let Some(unsub) = live.remove(&id) {
                unsub();
            }
        }

        for (id, handle) in current {
            if live.contains_key(&id) {
                continue;
            }
            let woke = self.woke.clone();
            let unsub = handle.subscribe_refresh(Arc::new(move || woke.notify_one()));
            live.insert(id, unsub);
        }
    }

    async fn drain_shutdown(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.in_flight.lock().unwrap());
        if handles.is_empty() {
            return;
        }
        tracing::info!(count = handles.len(), "engine shutting down, draining in-flight jobs");
        if tokio::time::timeout(self.config.shutdown_deadline, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!("graceful shutdown deadline elapsed with jobs still in flight");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Input;
    use crate::monitor::{BoxFuture, Monitor, MonitorConfig};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    fn boxed_ready<T: Send + 'static>(v: T) -> BoxFuture<'static, T> {
        Box::pin(async move { v })
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_a_snapshot_before_suspending() {
        let engine = Engine::create(EngineConfig::default(), || Term::from_value(()));
        let mut snapshots = engine.snapshots();

        let task = tokio::spawn(engine.clone().thread());
        tokio::time::sleep(Duration::from_millis(10)).await;

        snapshots.changed().await.unwrap();
        assert_eq!(snapshots.borrow().output, Output::ok(()));

        engine.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn s2_mutating_a_dependency_triggers_a_new_tick() {
        let input: Input<i32> = Input::new(Output::ok(1));
        let tick_count = Arc::new(AtomicUsize::new(0));
        let tick_count2 = tick_count.clone();
        let input_for_pipeline = input.clone();

        let engine = Engine::create(EngineConfig::default(), move || {
            tick_count2.fetch_add(1, Ordering::SeqCst);
            Term::primitive(input_for_pipeline.clone(), "value").map(|_| ())
        });
        let mut snapshots = engine.snapshots();
        let task = tokio::spawn(engine.clone().thread());

        snapshots.changed().await.unwrap();
        assert_eq!(tick_count.load(Ordering::SeqCst), 1);

        input.set(Output::ok(2), None);
        tokio::time::timeout(Duration::from_secs(1), snapshots.changed()).await.unwrap().unwrap();
        assert!(tick_count.load(Ordering::SeqCst) >= 2);

        engine.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_now_forces_a_tick_without_a_dependency_change() {
        let tick_count = Arc::new(AtomicUsize::new(0));
        let tick_count2 = tick_count.clone();
        let engine = Engine::create(EngineConfig::default(), move || {
            tick_count2.fetch_add(1, Ordering::SeqCst);
            Term::from_value(())
        });
        let mut snapshots = engine.snapshots();
        let task = tokio::spawn(engine.clone().thread());

        snapshots.changed().await.unwrap();
        let after_first = tick_count.load(Ordering::SeqCst);

        engine.rerun_now();
        tokio::time::timeout(Duration::from_secs(1), snapshots.changed()).await.unwrap().unwrap();
        assert!(tick_count.load(Ordering::SeqCst) > after_first);

        engine.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn webhook_broadcaster_fans_out_to_every_subscriber() {
        let broadcaster = WebhookBroadcaster::new();
        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_a2 = calls_a.clone();
        let calls_b = Arc::new(AtomicUsize::new(0));
        let calls_b2 = calls_b.clone();

        let sub_a = broadcaster.subscribe(move || {
            calls_a2.fetch_add(1, Ordering::SeqCst);
        });
        let _sub_b = broadcaster.subscribe(move || {
            calls_b2.fetch_add(1, Ordering::SeqCst);
        });

        broadcaster.fire();
        assert_eq!(calls_a.load(Ordering::SeqCst), 1);
        assert_eq!(calls_b.load(Ordering::SeqCst), 1);

        sub_a.unsubscribe();
        broadcaster.fire();
        assert_eq!(calls_a.load(Ordering::SeqCst), 1);
        assert_eq!(calls_b.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_keeps_a_monitor_subscription_alive_across_ticks() {
        let read_calls = Arc::new(AtomicUsize::new(0));
        let read_calls2 = read_calls.clone();
        let monitor = Monitor::with_config(
            move || {
                read_calls2.fetch_add(1, Ordering::SeqCst);
                boxed_ready(Ok(1))
            },
            |_refresh| boxed_ready(Ok(Box::new(|| {}) as Box<dyn FnOnce() + Send>)),
            "engine-driven monitor",
            MonitorConfig {
                refresh_rate_limit: Duration::from_secs(3600),
                ..MonitorConfig::default()
            },
        )
        .unwrap();
        let monitor_input = monitor.input();

        let engine = Engine::create(EngineConfig::default(), move || {
            Term::primitive(monitor_input.clone(), "monitored").map(|_| ())
        });
        let mut snapshots = engine.snapshots();
        let task = tokio::spawn(engine.clone().thread());

        snapshots.changed().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(read_calls.load(Ordering::SeqCst), 1);

        // Force several ticks while the dependency set stays the same.
        // If the engine tore the monitor's subscription down and rebuilt
        // it every tick, each teardown would abort and restart the
        // driver task, triggering another `read` call.
        for _ in 0..5 {
            engine.rerun_now();
            tokio::time::timeout(Duration::from_secs(1), snapshots.changed()).await.unwrap().unwrap();
        }
        assert_eq!(read_calls.load(Ordering::SeqCst), 1);

        engine.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[derive(Clone, Default)]
    struct CapturingWriter(Arc<StdMutex<Vec<u8>>>);

    impl std::io::Write for CapturingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturingWriter {
        type Writer = CapturingWriter;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn engine_tick_is_observable_through_tracing() {
        let buffer = CapturingWriter::default();
        let subscriber = tracing_subscriber::fmt().with_writer(buffer.clone()).with_ansi(false).finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let engine = Engine::create(EngineConfig::default(), || Term::from_value(()));
        let mut snapshots = engine.snapshots();
        let task = tokio::spawn(engine.clone().thread());
        snapshots.changed().await.unwrap();

        engine.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        let captured = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert!(captured.contains("engine tick"), "expected a captured tick log, got: {captured}");
    }
}
