//! Tracked repositories, shared between the poller and the webhook receiver.

use chrono::{DateTime, Utc};
use refwatch_core::{Repository, RepositoryId};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct RepositoryRegistry {
    repositories: RwLock<HashMap<RepositoryId, Repository>>,
}

impl RepositoryRegistry {
    pub fn new(repositories: impl IntoIterator<Item = Repository>) -> Self {
        Self {
            repositories: RwLock::new(repositories.into_iter().map(|r| (r.id, r)).collect()),
        }
    }

    /// Current repositories, ordered by URL.
    pub async fn snapshot(&self) -> Vec<Repository> {
        let mut repositories: Vec<Repository> =
            self.repositories.read().await.values().cloned().collect();
        repositories.sort_by(|a, b| a.url.cmp(&b.url));
        repositories
    }

    pub async fn get(&self, id: RepositoryId) -> Option<Repository> {
        self.repositories.read().await.get(&id).cloned()
    }

    /// Record that a webhook for the repository arrived at `at`.
    pub async fn record_hook(&self, id: RepositoryId, at: DateTime<Utc>) -> Option<Repository> {
        let mut repositories = self.repositories.write().await;
        let repository = repositories.get_mut(&id)?;
        repository.hook_time = Some(at);
        Some(repository.clone())
    }
}
