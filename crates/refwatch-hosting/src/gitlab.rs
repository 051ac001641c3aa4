//! GitLab API client for commit statuses, protected branches and merge requests.

use async_trait::async_trait;
use refwatch_core::{
    ExternalStatus, MergeRequestInfo, RemoteServiceError, RemoteStatusClient, Repository,
};
use serde::Deserialize;
use std::collections::HashSet;
use tracing::debug;

use crate::{PAGE_SIZE, ensure_success, target_url};

/// Context name statuses are published under.
const STATUS_NAME: &str = "ci/refwatch";

/// GitLab API (v4) client.
pub struct GitLabClient {
    client: reqwest::Client,
    /// Base URL of the refwatch UI, used as the status target.
    status_url: Option<String>,
}

impl GitLabClient {
    pub fn new(status_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            status_url,
        }
    }

    /// `https://host/api/v4/projects/<url-encoded namespace/name>`
    fn project_url(repository: &Repository) -> Result<String, RemoteServiceError> {
        let endpoint = repository.endpoint()?;
        Ok(format!(
            "{}/api/v4/projects/{}",
            endpoint.domain,
            urlencoding::encode(&endpoint.project)
        ))
    }

    fn get(&self, repository: &Repository, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &repository.token {
            Some(token) => request.header("PRIVATE-TOKEN", token),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteStatusClient for GitLabClient {
    fn name(&self) -> &'static str {
        "gitlab"
    }

    async fn set_commit_status(
        &self,
        repository: &Repository,
        commit_id: &str,
        status: ExternalStatus,
        description: &str,
    ) -> Result<(), RemoteServiceError> {
        let url = format!("{}/statuses/{}", Self::project_url(repository)?, commit_id);

        let mut form = vec![
            ("state", status.as_str().to_string()),
            ("name", STATUS_NAME.to_string()),
            ("description", description.to_string()),
        ];
        if let Some(target) = target_url(self.status_url.as_deref(), commit_id) {
            form.push(("target_url", target));
        }

        let mut request = self.client.post(&url).form(&form);
        if let Some(token) = &repository.token {
            request = request.header("PRIVATE-TOKEN", token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RemoteServiceError::Request(e.to_string()))?;
        ensure_success(response).await?;

        debug!(repo = %repository.url, sha = %commit_id, state = %status, "Updated GitLab status");
        Ok(())
    }

    async fn list_protected_branches(
        &self,
        repository: &Repository,
    ) -> Result<HashSet<String>, RemoteServiceError> {
        let base = Self::project_url(repository)?;
        let mut protected = HashSet::new();
        let mut page = 1;

        loop {
            let url = format!(
                "{}/repository/branches?per_page={}&page={}",
                base, PAGE_SIZE, page
            );
            let response = self
                .get(repository, &url)
                .send()
                .await
                .map_err(|e| RemoteServiceError::Request(e.to_string()))?;
            let branches: Vec<GitLabBranch> = ensure_success(response)
                .await?
                .json()
                .await
                .map_err(|e| RemoteServiceError::Parse(e.to_string()))?;

            let count = branches.len();
            protected.extend(branches.into_iter().filter(|b| b.protected).map(|b| b.name));

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
        let url = format!(
            "{}/merge_requests?iids[]={}",
            Self::project_url(repository)?,
            number
        );
        let response = self
            .get(repository, &url)
            .send()
            .await
            .map_err(|e| RemoteServiceError::Request(e.to_string()))?;
        let requests: Vec<GitLabMergeRequest> = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|e| RemoteServiceError::Parse(e.to_string()))?;

        Ok(requests.into_iter().next().map(MergeRequestInfo::from))
    }
}

/// Branch as returned by `GET /projects/:id/repository/branches`.
#[derive(Debug, Deserialize)]
struct GitLabBranch {
    name: String,
    #[serde(default)]
    protected: bool,
}

/// Merge request as returned by `GET /projects/:id/merge_requests`.
#[derive(Debug, Deserialize)]
struct GitLabMergeRequest {
    target_branch: String,
    source_branch: String,
    state: String,
}

impl From<GitLabMergeRequest> for MergeRequestInfo {
    fn from(mr: GitLabMergeRequest) -> Self {
        MergeRequestInfo {
            base_ref: mr.target_branch,
            head_ref: mr.source_branch,
            state: mr.state,
        }
    }
}
