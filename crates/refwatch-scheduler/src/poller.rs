//! Periodic synchronization of every tracked repository.

use futures::future::join_all;
use refwatch_core::{Repository, RepositoryId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};

use crate::registry::RepositoryRegistry;
use crate::sync::{SyncEngine, SyncError, SyncResult};

/// Runs a pass for every repository on each tick, and for single
/// repositories when woken by a webhook.
pub struct Poller {
    engine: Arc<SyncEngine>,
    registry: Arc<RepositoryRegistry>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Poller {
    pub fn new(
        engine: Arc<SyncEngine>,
        registry: Arc<RepositoryRegistry>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            engine,
            registry,
            interval,
            shutdown,
        }
    }

    /// Run the poller loop until shutdown.
    pub async fn run(mut self, mut wake: mpsc::Receiver<RepositoryId>) {
        info!(interval_secs = self.interval.as_secs(), "Starting poller");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_all().await;
                }
                Some(id) = wake.recv() => {
                    self.poll_one(id).await;
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Poller stopped");
    }

    /// Synchronize all repositories concurrently.
    pub async fn poll_all(&self) -> Vec<Result<SyncResult, SyncError>> {
        let repositories = self.registry.snapshot().await;
        join_all(repositories.iter().map(|repo| self.sync_logged(repo))).await
    }

    /// Synchronize one repository, if it is still tracked.
    pub async fn poll_one(&self, id: RepositoryId) -> Option<Result<SyncResult, SyncError>> {
        let Some(repository) = self.registry.get(id).await else {
            warn!(repository_id = %id, "Wake-up for unknown repository");
            return None;
        };
        Some(self.sync_logged(&repository).await)
    }

    async fn sync_logged(&self, repository: &Repository) -> Result<SyncResult, SyncError> {
        let result = self.engine.synchronize(repository).await;
        match &result {
            Ok(_) | Err(SyncError::Cancelled) => {}
            Err(e) => warn!(repo = %repository.url, error = %e, "Synchronization failed"),
        }
        result
    }
}
