//! Cache-backed operation that publishes a commit status to the remote.
//!
//! Wraps `pipeline_core::cache::Cache` around a POST to the remote's
//! statuses API: repeated `set` calls for the same `(sha, context)` key
//! collapse onto one in-flight request, and a later call with a
//! different `StatusValue` supersedes it once the in-flight POST
//! completes.

use crate::error::GitError;
use crate::token::TokenCache;
use async_trait::async_trait;
use pipeline_core::cache::{CancelToken, Operation};
use pipeline_core::input::JobId;
use pipeline_core::{Digestible, Msg};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CommitKey {
    pub sha: String,
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
}

impl StatusState {
    fn as_str(&self) -> &'static str {
        match self {
            StatusState::Pending => "pending",
            StatusState::Success => "success",
            StatusState::Failure => "failure",
            StatusState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusValue {
    pub state: StatusState,
    pub description: String,
    pub target_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusOutcome {
    pub id: u64,
}

#[derive(Serialize)]
struct StatusRequest<'a> {
    state: &'a str,
    description: &'a str,
    target_url: Option<&'a str>,
    context: &'a str,
}

pub struct PublishStatus {
    client: reqwest::Client,
    api_base: String,
    owner_repo: String,
    token: Option<Arc<TokenCache>>,
}

impl PublishStatus {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>, owner_repo: impl Into<String>, token: Option<Arc<TokenCache>>) -> Self {
        PublishStatus {
            client,
            api_base: api_base.into(),
            owner_repo: owner_repo.into(),
            token,
        }
    }
}

#[async_trait]
impl Operation for PublishStatus {
    type Key = CommitKey;
    type Value = StatusValue;
    type Outcome = StatusOutcome;

    fn id(&self) -> &str {
        "git-publish-status"
    }

    /// A status POST is idempotent-ish but not cheap to abandon mid-flight
    /// on the remote's side; let an in-flight POST finish and run the
    /// latest queued value next rather than cancelling it.
    fn auto_cancel(&self) -> bool {
        false
    }

    async fn publish(&self, _job: JobId, key: &CommitKey, value: &StatusValue, _cancel: CancelToken) -> Result<StatusOutcome, Msg> {
        let url = format!("{}/repos/{}/statuses/{}", self.api_base, self.owner_repo, key.sha);
        let body = StatusRequest {
            state: value.state.as_str(),
            description: &value.description,
            target_url: value.target_url.as_deref(),
            context: &key.context,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(token) = &self.token {
            let bearer = token.get().await.map_err(Msg::from)?;
            request = request.bearer_auth(bearer);
        }

        let response = request
            .send()
            .await
            .map_err(|source| GitError::Http { url: url.clone(), source })
            .map_err(Msg::from)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Msg::from(GitError::UnexpectedStatus { url, status: status.as_u16() }));
        }

        let text = response
            .text()
            .await
            .map_err(|source| GitError::Http { url: url.clone(), source })
            .map_err(Msg::from)?;
        let outcome: StatusOutcome =
            serde_json::from_str(&text).map_err(|source| Msg::from(GitError::Decode { url: url.clone(), source }))?;
        tracing::debug!(url = %url, status_id = outcome.id, context = %key.context, sha = %key.sha, "commit status published");
        Ok(outcome)
    }

    fn pp(&self, key: &CommitKey, value: &StatusValue) -> String {
        format!("{}@{} -> {}", key.context, &key.sha[..key.sha.len().min(8)], value.state.as_str())
    }
}
