//! Per-repository selection of the fetcher and hosting client.

use std::sync::Arc;

use crate::refs::RefFetcher;
use crate::remote::RemoteStatusClient;
use crate::repository::Repository;

/// Strategy resolving the collaborators a repository is synchronized with.
///
/// Repositories hosted on different services differ only in which
/// [`RefFetcher`] and [`RemoteStatusClient`] they are given.
pub trait Backends: Send + Sync {
    fn fetcher(&self, repository: &Repository) -> Arc<dyn RefFetcher>;

    fn remote(&self, repository: &Repository) -> Arc<dyn RemoteStatusClient>;
}
