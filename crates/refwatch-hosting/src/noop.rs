//! Remote client for repositories without a hosting API.

use async_trait::async_trait;
use refwatch_core::{
    ExternalStatus, MergeRequestInfo, RemoteServiceError, RemoteStatusClient, Repository,
};
use std::collections::HashSet;
use tracing::trace;

/// Accepts statuses and reports no protected branches or merge requests.
pub struct NoopRemote;

#[async_trait]
impl RemoteStatusClient for NoopRemote {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn set_commit_status(
        &self,
        repository: &Repository,
        commit_id: &str,
        status: ExternalStatus,
        _description: &str,
    ) -> Result<(), RemoteServiceError> {
        trace!(repo = %repository.url, sha = %commit_id, state = %status, "Dropping commit status");
        Ok(())
    }

    async fn list_protected_branches(
        &self,
        _repository: &Repository,
    ) -> Result<HashSet<String>, RemoteServiceError> {
        Ok(HashSet::new())
    }

    async fn resolve_merge_request(
        &self,
        _repository: &Repository,
        _number: u64,
    ) -> Result<Option<MergeRequestInfo>, RemoteServiceError> {
        Ok(None)
    }
}
