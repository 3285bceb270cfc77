//! Polling input provider over a git remote's refs.
//!
//! Wraps a `Monitor<Vec<GitRef>>`: `read()` lists refs via the remote's
//! HTTP API, `watch()` subscribes to a [`WebhookBroadcaster`] so a push
//! notification can trigger an immediate re-read instead of waiting out
//! the monitor's poll-rate coalescing window.

use crate::error::GitError;
use crate::token::TokenCache;
use pipeline_core::{Input, Monitor, MonitorConfig, Msg, WebhookBroadcaster};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GitRef {
    pub name: String,
    pub sha: String,
}

#[derive(Deserialize)]
struct RemoteRef {
    #[serde(rename = "ref")]
    name: String,
    object: RemoteRefObject,
}

#[derive(Deserialize)]
struct RemoteRefObject {
    sha: String,
}

/// A remote repository's ref listing, refreshed on a poll timer and on
/// webhook fan-out.
pub struct RefsMonitor {
    monitor: Arc<Monitor<Vec<GitRef>>>,
}

impl RefsMonitor {
    pub fn new(
        client: reqwest::Client,
        api_base: &str,
        owner_repo: &str,
        token: Option<Arc<TokenCache>>,
        webhooks: Arc<WebhookBroadcaster>,
    ) -> Result<Self, GitError> {
        let url = format!("{api_base}/repos/{owner_repo}/git/refs");
        let description = format!("refs({owner_repo})");

        let read_client = client.clone();
        let read_url = url.clone();
        let read_token = token.clone();
        let read = move || {
            let client = read_client.clone();
            let url = read_url.clone();
            let token = read_token.clone();
            Box::pin(async move { fetch_refs(&client, &url, token.as_deref()).await.map_err(Into::into) })
                as pipeline_core::monitor::BoxFuture<'static, Result<Vec<GitRef>, Msg>>
        };

        let watch = move |refresh: Arc<dyn Fn() + Send + Sync>| {
            let webhooks = webhooks.clone();
            Box::pin(async move {
                let sub = webhooks.subscribe(move || refresh());
                let unsub: Box<dyn FnOnce() + Send> = Box::new(move || sub.unsubscribe());
                Ok(unsub)
            }) as pipeline_core::monitor::BoxFuture<'static, Result<Box<dyn FnOnce() + Send>, Msg>>
        };

        let monitor = Monitor::with_config(read, watch, description, MonitorConfig::default())?;

        Ok(RefsMonitor { monitor })
    }

    pub fn input(&self) -> Input<Vec<GitRef>> {
        self.monitor.input()
    }
}

async fn fetch_refs(client: &reqwest::Client, url: &str, token: Option<&TokenCache>) -> Result<Vec<GitRef>, GitError> {
    let mut request = client.get(url);
    if let Some(token) = token {
        let bearer = token.get().await?;
        request = request.bearer_auth(bearer);
    }

    let response = request.send().await.map_err(|source| GitError::Http { url: url.to_string(), source })?;
    let status = response.status();
    if !status.is_success() {
        return Err(GitError::UnexpectedStatus { url: url.to_string(), status: status.as_u16() });
    }

    let body = response.text().await.map_err(|source| GitError::Http { url: url.to_string(), source })?;
    let remote_refs: Vec<RemoteRef> =
        serde_json::from_str(&body).map_err(|source| GitError::Decode { url: url.to_string(), source })?;

    // TODO: paginate. GitHub's refs endpoint caps a single page at 100
    // entries; repos with more branches/tags than that silently lose the
    // tail until pagination is wired through `Link` response headers.
    Ok(remote_refs
        .into_iter()
        .map(|r| GitRef { name: r.name, sha: r.object.sha })
        .collect())
}
