//! Remote ref listing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::build::CommitInfo;
use crate::error::FetchError;
use crate::repository::Repository;

/// One ref of the remote snapshot with the metadata of the commit it points to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefEntry {
    pub name: String,
    pub commit_id: String,
    pub commit_date: DateTime<Utc>,
    pub author: String,
    pub author_email: String,
    pub subject: String,
    pub committer: String,
    pub committer_email: String,
}

impl RefEntry {
    pub fn commit_info(&self) -> CommitInfo {
        CommitInfo {
            author: self.author.clone(),
            author_email: self.author_email.clone(),
            committer: self.committer.clone(),
            committer_email: self.committer_email.clone(),
            subject: self.subject.clone(),
            date: self.commit_date,
        }
    }
}

/// Retrieves the current ref snapshot of a repository.
#[async_trait]
pub trait RefFetcher: Send + Sync {
    /// Name of this fetcher (e.g., "git").
    fn name(&self) -> &'static str;

    /// List branch and merge-request refs, most recent commit first.
    ///
    /// The listing is finite and can be requested again at any time.
    async fn list_refs(&self, repository: &Repository) -> Result<Vec<RefEntry>, FetchError>;

    /// When the local mirror of `repository` was last fetched, if known.
    async fn last_fetched(&self, _repository: &Repository) -> Option<DateTime<Utc>> {
        None
    }
}
