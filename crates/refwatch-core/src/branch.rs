//! Branches observed on a tracked repository.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{BranchId, RepositoryId};
use crate::repository::{HostingEndpoint, Provider};

/// Ref prefix of ordinary branch heads.
pub const HEADS_PREFIX: &str = "refs/heads/";

/// Ref prefix under which merge-request heads are fetched.
pub const MERGE_REQUEST_PREFIX: &str = "refs/pull/";

/// A branch record. Created the first time its ref is seen, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub repository_id: RepositoryId,
    /// Full ref name, e.g. `refs/heads/main` or `refs/pull/42`.
    pub name: String,
    /// Short name derived from the ref, e.g. `main` or `42`.
    pub branch_name: String,
    /// Exempt from supersession and merge-request-only filtering, and
    /// evicted over capacity only after every non-sticky build.
    pub sticky: bool,
    pub created_at: DateTime<Utc>,
}

impl Branch {
    pub fn new(repository_id: RepositoryId, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: BranchId::new(),
            repository_id,
            branch_name: short_branch_name(&name).to_string(),
            name,
            sticky: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_merge_request(&self) -> bool {
        is_merge_request_ref(&self.name)
    }

    /// Merge-request number for `refs/pull/<n>` branches.
    pub fn merge_request_number(&self) -> Option<u64> {
        self.name
            .strip_prefix(MERGE_REQUEST_PREFIX)
            .and_then(|n| n.parse().ok())
    }

    /// Web URL of the branch or merge request on its hosting service.
    pub fn url(&self, provider: Provider, endpoint: &HostingEndpoint) -> String {
        match (provider, self.merge_request_number()) {
            (Provider::Gitlab, Some(n)) => format!("{}/merge_requests/{}", endpoint.web_url(), n),
            (Provider::Github, Some(n)) => format!("{}/pull/{}", endpoint.web_url(), n),
            _ => format!("{}/tree/{}", endpoint.web_url(), self.branch_name),
        }
    }
}

/// Last path segment of a ref name.
pub fn short_branch_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Full ref name of a branch as hosting services name it, e.g. `release/1.0`.
pub fn head_ref(branch: &str) -> String {
    format!("{}{}", HEADS_PREFIX, branch)
}

/// Whether a ref name matches the merge-request pattern `refs/pull/*`.
pub fn is_merge_request_ref(name: &str) -> bool {
    name.starts_with(MERGE_REQUEST_PREFIX)
}
