//! GitHub API client for commit statuses, protected branches and pull requests.

use async_trait::async_trait;
use refwatch_core::{
    ExternalStatus, MergeRequestInfo, RemoteServiceError, RemoteStatusClient, Repository,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use crate::{PAGE_SIZE, ensure_success, target_url};

const STATUS_CONTEXT: &str = "ci/refwatch";

/// GitHub API client.
pub struct GitHubClient {
    client: reqwest::Client,
    status_url: Option<String>,
}

impl GitHubClient {
    pub fn new(status_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            status_url,
        }
    }

    /// `https://api.github.com/repos/<owner>/<name>`, or `/api/v3` on GitHub Enterprise.
    fn repo_url(repository: &Repository) -> Result<String, RemoteServiceError> {
        let endpoint = repository.endpoint()?;
        let api = if endpoint.domain == "https://github.com" {
            "https://api.github.com".to_string()
        } else {
            format!("{}/api/v3", endpoint.domain)
        };
        Ok(format!("{}/repos/{}", api, endpoint.project))
    }

    fn request(
        &self,
        method: reqwest::Method,
        repository: &Repository,
        url: &str,
    ) -> reqwest::RequestBuilder {
        let request = self
            .client
            .request(method, url)
            .header("User-Agent", "refwatch")
            .header("Accept", "application/vnd.github+json");
        match &repository.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    /// GitHub has no `running` status; running builds stay `pending`.
    fn state(status: ExternalStatus) -> &'static str {
        match status {
            ExternalStatus::Pending | ExternalStatus::Running => "pending",
            ExternalStatus::Success => "success",
            ExternalStatus::Failed => "failure",
        }
    }
}

#[async_trait]
impl RemoteStatusClient for GitHubClient {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn set_commit_status(
        &self,
        repository: &Repository,
        commit_id: &str,
        status: ExternalStatus,
        description: &str,
    ) -> Result<(), RemoteServiceError> {
        let url = format!("{}/statuses/{}", Self::repo_url(repository)?, commit_id);
        let body = CreateStatus {
            state: Self::state(status),
            target_url: target_url(self.status_url.as_deref(), commit_id),
            description,
            context: STATUS_CONTEXT,
        };

        let response = self
            .request(reqwest::Method::POST, repository, &url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RemoteServiceError::Request(e.to_string()))?;
        ensure_success(response).await?;

        debug!(repo = %repository.url, sha = %commit_id, state = %status, "Updated GitHub status");
        Ok(())
    }

    async fn list_protected_branches(
        &self,
        repository: &Repository,
    ) -> Result<HashSet<String>, RemoteServiceError> {
        let base = Self::repo_url(repository)?;
        let mut protected = HashSet::new();
        let mut page = 1;

        loop {
            let url = format!(
                "{}/branches?protected=true&per_page={}&page={}",
                base, PAGE_SIZE, page
            );
            let response = self
                .request(reqwest::Method::GET, repository, &url)
                .send()
                .await
                .map_err(|e| RemoteServiceError::Request(e.to_string()))?;
            let branches: Vec<GitHubBranch> = ensure_success(response)
                .await?
                .json()
                .await
                .map_err(|e| RemoteServiceError::Parse(e.to_string()))?;

            let count = branches.len();
            protected.extend(branches.into_iter().map(|b| b.name));

            if count < PAGE_SIZE {
                break;
            }
            page += 1;
        }

        Ok(protected)
    }

    async fn resolve_merge_request(
        &self,
        repository: &Repository,
        number: u64,
    ) -> Result<Option<MergeRequestInfo>, RemoteServiceError> {
        let url = format!("{}/pulls/{}", Self::repo_url(repository)?, number);
        let response = self
            .request(reqwest::Method::GET, repository, &url)
            .send()
            .await
            .map_err(|e| RemoteServiceError::Request(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let pull: GitHubPull = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|e| RemoteServiceError::Parse(e.to_string()))?;
        Ok(Some(pull.into()))
    }
}

#[derive(Debug, Serialize)]
struct CreateStatus<'a> {
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_url: Option<String>,
    description: &'a str,
    context: &'static str,
}

#[derive(Debug, Deserialize)]
struct GitHubBranch {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GitHubPull {
    state: String,
    base: GitHubPullRef,
    head: GitHubPullRef,
}

#[derive(Debug, Deserialize)]
struct GitHubPullRef {
    #[serde(rename = "ref")]
    ref_name: String,
}

impl From<GitHubPull> for MergeRequestInfo {
    fn from(pull: GitHubPull) -> Self {
        MergeRequestInfo {
            base_ref: pull.base.ref_name,
            head_ref: pull.head.ref_name,
            state: pull.state,
        }
    }
}
