//! Git and hosting-service backends for refwatch.
//!
//! Refs are listed from local bare mirrors with the git CLI. Commit statuses,
//! protected branches and merge requests go through the GitLab or GitHub API.

pub mod git;
pub mod github;
pub mod gitlab;
pub mod noop;

pub use git::GitRefFetcher;
pub use github::GitHubClient;
pub use gitlab::GitLabClient;
pub use noop::NoopRemote;

use refwatch_core::{
    Backends, Provider, RefFetcher, RemoteServiceError, RemoteStatusClient, Repository,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Page size for paginated API listings.
pub(crate) const PAGE_SIZE: usize = 100;

/// Turn a non-2xx response into [`RemoteServiceError::Api`].
pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, RemoteServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteServiceError::Api {
        status: status.as_u16(),
        body,
    })
}

/// Link shown next to a commit status.
pub(crate) fn target_url(status_url: Option<&str>, commit_id: &str) -> Option<String> {
    status_url.map(|base| format!("{}/commit/{}", base.trim_end_matches('/'), commit_id))
}

/// Backends selected by repository provider.
pub struct HostingBackends {
    fetcher: Arc<GitRefFetcher>,
    gitlab: Arc<GitLabClient>,
    github: Arc<GitHubClient>,
    noop: Arc<NoopRemote>,
}

impl HostingBackends {
    pub fn new(work_dir: impl Into<PathBuf>, status_url: Option<String>) -> Self {
        Self {
            fetcher: Arc::new(GitRefFetcher::new(work_dir)),
            gitlab: Arc::new(GitLabClient::new(status_url.clone())),
            github: Arc::new(GitHubClient::new(status_url)),
            noop: Arc::new(NoopRemote),
        }
    }
}

impl Backends for HostingBackends {
    fn fetcher(&self, _repository: &Repository) -> Arc<dyn RefFetcher> {
        self.fetcher.clone()
    }

    fn remote(&self, repository: &Repository) -> Arc<dyn RemoteStatusClient> {
        match repository.provider {
            Provider::Gitlab => self.gitlab.clone(),
            Provider::Github => self.github.clone(),
            Provider::Plain => self.noop.clone(),
        }
    }
}
