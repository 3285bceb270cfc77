//! Generic input driver: wraps a `read`/`watch` pair into an `Input`.
//!
//! A `Monitor<T>` is the standard way plugins back a `Primitive` term.
//! Three user-supplied callbacks:
//!
//! - `read()` fetches the current external state.
//! - `watch(refresh)` installs an external-change listener and must call
//!   `refresh()` whenever that state *may* have changed; it resolves to
//!   either an unsubscribe closure or a setup failure.
//! - `pp` is a short description used on the analysis node.
//!
//! Together these drive the Idle/Watching+Fetching/Watching+Ready state
//! machine. The driver task only exists while at
//! least one subscriber is registered on the underlying `Input` (wired
//! through `Input::with_lifecycle_hook`); it is torn down (cancelling
//! `watch`) after the last unsubscribe.

use crate::error::EngineError;
use crate::input::Input;
use crate::output::{Msg, Output};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type ReadFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, Msg>> + Send + Sync>;
type UnsubscribeFn = Box<dyn FnOnce() + Send>;
type WatchFn =
    Arc<dyn Fn(Arc<dyn Fn() + Send + Sync>) -> BoxFuture<'static, Result<UnsubscribeFn, Msg>> + Send + Sync>;

/// Exponential backoff for a failing `watch` setup: retries with
/// exponential backoff, starting at 1s and capped at 60s.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2.0,
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Minimum spacing between fetches triggered by `watch` refreshes.
    /// Defaults to 10 seconds.
    pub refresh_rate_limit: Duration,
    pub watch_backoff: Backoff,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            refresh_rate_limit: Duration::from_secs(10),
            watch_backoff: Backoff::default(),
        }
    }
}

struct Driver<T> {
    read: ReadFn<T>,
    watch: WatchFn,
    config: MonitorConfig,
    input: Input<T>,
    /// Coalescing: set while a refresh has fired during the rate-limit
    /// window, so the fetch loop knows to run one more pass once the
    /// window elapses rather than blocking on the next external signal.
    refresh_pending: AtomicBool,
    refresh_notify: Notify,
    running: AtomicBool,
}

/// A standard `Input` implementation built from `read` + `watch`.
pub struct Monitor<T> {
    input: Input<T>,
    driver: Arc<Driver<T>>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T> Monitor<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        read: impl Fn() -> BoxFuture<'static, Result<T, Msg>> + Send + Sync + 'static,
        watch: impl Fn(Arc<dyn Fn() + Send + Sync>) -> BoxFuture<'static, Result<UnsubscribeFn, Msg>>
            + Send
            + Sync
            + 'static,
        pp: impl Into<String>,
    ) -> Result<Arc<Self>, EngineError> {
        Self::with_config(read, watch, pp, MonitorConfig::default())
    }

    /// Fails with `EngineError::Configuration` if `config` describes a
    /// rate limit that could never let a watcher catch up (zero), rather
    /// than leaving the driver loop to busy-spin at runtime.
    pub fn with_config(
        read: impl Fn() -> BoxFuture<'static, Result<T, Msg>> + Send + Sync + 'static,
        watch: impl Fn(Arc<dyn Fn() + Send + Sync>) -> BoxFuture<'static, Result<UnsubscribeFn, Msg>>
            + Send
            + Sync
            + 'static,
        pp: impl Into<String>,
        config: MonitorConfig,
    ) -> Result<Arc<Self>, EngineError> {
        if config.refresh_rate_limit.is_zero() {
            return Err(EngineError::Configuration("refresh_rate_limit must be greater than zero".to_string()));
        }
        let _pp = pp.into(); // description is carried by the Primitive term, not stored here
        Ok(Arc::new_cyclic(|weak: &std::sync::Weak<Monitor<T>>| {
            let weak = weak.clone();
            let input = Input::with_lifecycle_hook(
                Output::active_running("booting"),
                Some(Arc::new(move |active| {
                    if let Some(monitor) = weak.upgrade() {
                        if active {
                            monitor.start();
                        } else {
                            monitor.stop();
                        }
                    }
                })),
            );
            Monitor {
                input: input.clone(),
                driver: Arc::new(Driver {
                    read: Arc::new(read),
                    watch: Arc::new(watch),
                    config,
                    input,
                    refresh_pending: AtomicBool::new(false),
                    refresh_notify: Notify::new(),
                    running: AtomicBool::new(false),
                }),
                handle: std::sync::Mutex::new(None),
            }
        }))
    }

    /// The `Input` a `Primitive` term reads from.
    pub fn input(&self) -> Input<T> {
        self.input.clone()
    }

    fn start(&self) {
        if self.driver.running.swap(true, Ordering::SeqCst) {
            return; // already driving
        }
        let driver = self.driver.clone();
        let task = tokio::spawn(async move { driver_loop(driver).await });
        *self.handle.lock().unwrap() = Some(task);
    }

    fn stop(&self) {
        self.driver.running.store(false, Ordering::SeqCst);
        self.driver.refresh_notify.notify_one();
        if let Some(task) = self.handle.lock().unwrap().take() {
            task.abort();
        }
    }
}

async fn driver_loop<T>(driver: Arc<Driver<T>>)
where
    T: Clone + Send + Sync + 'static,
{
    let unsubscribe = watch_with_retry(&driver).await;

    loop {
        if !driver.running.load(Ordering::SeqCst) {
            break;
        }
        fetch_once(&driver).await;

        tokio::time::sleep(driver.config.refresh_rate_limit).await;
        if !driver.refresh_pending.swap(false, Ordering::SeqCst) {
            // No refresh arrived during the rate-limit window: wait for
            // the next one (or for teardown) before fetching again.
            driver.refresh_notify.notified().await;
        }
    }

    unsubscribe();
}

/// Repeatedly call `watch` until it succeeds, sleeping for an
/// exponentially increasing backoff between attempts: watch failures are
/// logged, and the monitor retries with exponential backoff.
async fn watch_with_retry<T>(driver: &Arc<Driver<T>>) -> UnsubscribeFn
where
    T: Clone + Send + Sync + 'static,
{
    let mut attempt = 0u32;
    loop {
        let signal_driver = driver.clone();
        let refresh: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            signal_driver.refresh_pending.store(true, Ordering::SeqCst);
            signal_driver.refresh_notify.notify_one();
        });
        match (driver.watch)(refresh).await {
            Ok(unsubscribe) => return unsubscribe,
            Err(msg) => {
                tracing::warn!(attempt, error = %msg, "monitor watch setup failed, retrying with backoff");
                let delay = driver.config.watch_backoff.delay(attempt);
                attempt = attempt.saturating_add(1);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn fetch_once<T>(driver: &Arc<Driver<T>>)
where
    T: Clone + Send + Sync + 'static,
{
    match (driver.read)().await {
        Ok(value) => driver.input.set(Output::Ok(value), None),
        Err(msg) => {
            // A read failure sets the current output to Error; it does
            // not terminate the watcher.
            tracing::warn!(error = %msg, "monitor read failed");
            driver.input.set(Output::Error(msg), None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    fn boxed_ready<T: Send + 'static>(v: T) -> BoxFuture<'static, T> {
        Box::pin(async move { v })
    }

    #[tokio::test(start_paused = true)]
    async fn idle_until_first_subscribe() {
        let read_calls = Arc::new(AtomicUsize::new(0));
        let read_calls2 = read_calls.clone();
        let watch_calls = Arc::new(AtomicUsize::new(0));
        let watch_calls2 = watch_calls.clone();

        let monitor = Monitor::new(
            move || {
                read_calls2.fetch_add(1, Ordering::SeqCst);
                boxed_ready(Ok("a".to_string()))
            },
            move |_refresh| {
                watch_calls2.fetch_add(1, Ordering::SeqCst);
                boxed_ready(Ok(Box::new(|| {}) as UnsubscribeFn))
            },
            "test monitor",
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(read_calls.load(Ordering::SeqCst), 0);
        assert_eq!(watch_calls.load(Ordering::SeqCst), 0);

        let sub = monitor.input().subscribe(|| {});
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(read_calls.load(Ordering::SeqCst) >= 1);
        assert!(watch_calls.load(Ordering::SeqCst) >= 1);

        sub.unsubscribe();
    }

    #[tokio::test(start_paused = true)]
    async fn read_failure_sets_error_without_killing_watch() {
        let fail_next = Arc::new(StdMutex::new(true));
        let fail_next2 = fail_next.clone();

        let monitor = Monitor::new(
            move || {
                let mut flag = fail_next2.lock().unwrap();
                let should_fail = *flag;
                *flag = false;
                if should_fail {
                    boxed_ready(Err(Msg::new("upstream unavailable")))
                } else {
                    boxed_ready(Ok("recovered".to_string()))
                }
            },
            |_refresh| boxed_ready(Ok(Box::new(|| {}) as UnsubscribeFn)),
            "flaky monitor",
        )
        .unwrap();

        let sub = monitor.input().subscribe(|| {});
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(monitor.input().get().0.is_error());

        sub.unsubscribe();
    }

    #[tokio::test(start_paused = true)]
    async fn watch_failure_retries_with_backoff_then_recovers() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = attempts.clone();

        let monitor = Monitor::new(
            || boxed_ready(Ok("a".to_string())),
            move |_refresh| {
                let n = attempts2.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    boxed_ready(Err(Msg::new("watch setup failed")))
                } else {
                    boxed_ready(Ok(Box::new(|| {}) as UnsubscribeFn))
                }
            },
            "eventually watchable",
        )
        .unwrap();

        let sub = monitor.input().subscribe(|| {});
        // advance past the 1s + 2s backoff sleeps
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(monitor.input().get().0.is_ok());

        sub.unsubscribe();
    }

    #[tokio::test(start_paused = true)]
    async fn s6_a_burst_of_refreshes_collapses_to_one_fetch_per_window() {
        let read_calls = Arc::new(AtomicUsize::new(0));
        let read_calls2 = read_calls.clone();
        let refresh_fn: Arc<std::sync::Mutex<Option<Arc<dyn Fn() + Send + Sync>>>> = Arc::new(std::sync::Mutex::new(None));
        let refresh_fn2 = refresh_fn.clone();

        let monitor = Monitor::new(
            move || {
                read_calls2.fetch_add(1, Ordering::SeqCst);
                boxed_ready(Ok(0u32))
            },
            move |refresh| {
                *refresh_fn2.lock().unwrap() = Some(refresh);
                boxed_ready(Ok(Box::new(|| {}) as UnsubscribeFn))
            },
            "burst monitor",
        )
        .unwrap();

        let sub = monitor.input().subscribe(|| {});
        tokio::time::sleep(Duration::from_millis(1)).await;
        let after_initial_fetch = read_calls.load(Ordering::SeqCst);

        let refresh = refresh_fn.lock().unwrap().clone().expect("watch installed a refresh callback");
        for _ in 0..100 {
            refresh();
        }
        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(
            read_calls.load(Ordering::SeqCst),
            after_initial_fetch,
            "100 refreshes inside the 10s rate-limit window must not trigger an extra fetch yet"
        );

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            read_calls.load(Ordering::SeqCst),
            after_initial_fetch + 1,
            "the burst collapses onto exactly one fetch once the window elapses"
        );

        sub.unsubscribe();
    }

    #[test]
    fn zero_refresh_rate_limit_is_rejected_as_a_configuration_error() {
        let result = Monitor::with_config(
            || boxed_ready(Ok(0u32)),
            |_refresh| boxed_ready(Ok(Box::new(|| {}) as UnsubscribeFn)),
            "misconfigured monitor",
            MonitorConfig {
                refresh_rate_limit: Duration::ZERO,
                ..MonitorConfig::default()
            },
        );
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }
}
