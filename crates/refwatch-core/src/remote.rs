//! Hosting service contract: commit statuses, protected branches and merge requests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::build::{Build, BuildResult, BuildState};
use crate::error::RemoteServiceError;
use crate::repository::Repository;

/// Commit status vocabulary of the hosting service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl ExternalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalStatus::Pending => "pending",
            ExternalStatus::Running => "running",
            ExternalStatus::Success => "success",
            ExternalStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ExternalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a build to the status the hosting service should show, if any.
///
/// Running and done builds report their result; anything but `ok` counts
/// as a failure. Skipped and duplicate builds are not reported.
pub fn external_status(build: &Build) -> Option<ExternalStatus> {
    match build.state {
        BuildState::Pending => Some(ExternalStatus::Pending),
        BuildState::Testing => Some(ExternalStatus::Running),
        BuildState::Running | BuildState::Done => match build.result {
            Some(BuildResult::Ok) => Some(ExternalStatus::Success),
            _ => Some(ExternalStatus::Failed),
        },
        BuildState::Skipped | BuildState::Duplicate => None,
    }
}

/// Human description sent along with a commit status.
pub fn status_description(build: &Build, branch_name: &str) -> String {
    let mut description = format!("build {}", build.dest(branch_name));
    if matches!(build.state, BuildState::Running | BuildState::Done) {
        if let Some(runtime) = build.runtime() {
            description.push_str(&format!(" (runtime {}s)", runtime.num_seconds()));
        }
    }
    description
}

/// Merge request metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequestInfo {
    /// Target branch.
    pub base_ref: String,
    /// Source branch.
    pub head_ref: String,
    /// Provider state, e.g. `opened`, `merged`, `closed`.
    pub state: String,
}

/// Client for the hosting service of a repository.
#[async_trait]
pub trait RemoteStatusClient: Send + Sync {
    /// Name of this client (e.g., "gitlab").
    fn name(&self) -> &'static str;

    /// Publish a commit status.
    async fn set_commit_status(
        &self,
        repository: &Repository,
        commit_id: &str,
        status: ExternalStatus,
        description: &str,
    ) -> Result<(), RemoteServiceError>;

    /// Short names of the branches currently protected on the service.
    async fn list_protected_branches(
        &self,
        repository: &Repository,
    ) -> Result<HashSet<String>, RemoteServiceError>;

    /// Look up a merge request by number. `Ok(None)` when it does not exist.
    async fn resolve_merge_request(
        &self,
        repository: &Repository,
        number: u64,
    ) -> Result<Option<MergeRequestInfo>, RemoteServiceError>;
}
