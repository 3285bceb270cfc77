//! Bearer-token caching: a mutex around a cached `{value, expiry}` pair.
//!
//! Token acquisition is serialized behind the mutex so concurrent callers
//! never issue overlapping fetches; a failed fetch is cached too, for a
//! short negative-expiry window, so a downed auth endpoint doesn't get
//! hit again on every poll tick.

use crate::error::GitError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(String, Duration), GitError>> + Send + Sync>;

struct Cached {
    value: std::result::Result<String, String>,
    expires_at: Instant,
}

pub struct TokenCache {
    fetch: FetchFn,
    negative_ttl: Duration,
    cached: Mutex<Option<Cached>>,
}

impl TokenCache {
    pub fn new(fetch: impl Fn() -> BoxFuture<'static, Result<(String, Duration), GitError>> + Send + Sync + 'static) -> Self {
        TokenCache {
            fetch: Arc::new(fetch),
            negative_ttl: Duration::from_secs(60),
            cached: Mutex::new(None),
        }
    }

    /// Returns the cached token if still valid, otherwise calls `fetch`
    /// under the lock and caches whatever it returns (success or
    /// failure) before releasing it.
    pub async fn get(&self) -> Result<String, GitError> {
        let mut guard = self.cached.lock().await;
        if let Some(entry) = guard.as_ref() {
            if Instant::now() < entry.expires_at {
                return entry.value.clone().map_err(GitError::Auth);
            }
        }
        match (self.fetch)().await {
            Ok((token, ttl)) => {
                *guard = Some(Cached {
                    value: Ok(token.clone()),
                    expires_at: Instant::now() + ttl,
                });
                Ok(token)
            }
            Err(e) => {
                let msg = e.to_string();
                *guard = Some(Cached {
                    value: Err(msg.clone()),
                    expires_at: Instant::now() + self.negative_ttl,
                });
                Err(GitError::Auth(msg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn successful_fetch_is_reused_until_expiry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let cache = TokenCache::new(move || {
            let calls = calls2.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(("tok-1".to_string(), Duration::from_secs(300)))
            })
        });

        assert_eq!(cache.get().await.unwrap(), "tok-1");
        assert_eq!(cache.get().await.unwrap(), "tok-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_is_cached_for_the_negative_ttl() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let cache = TokenCache::new(move || {
            let calls = calls2.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GitError::Auth("no credentials".into()))
            })
        });

        assert!(cache.get().await.is_err());
        assert!(cache.get().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "second call reuses the cached failure");

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2, "negative cache expired, fetch retried");
    }
}
