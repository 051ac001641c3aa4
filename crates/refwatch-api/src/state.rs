//! Application state.

use refwatch_core::RepositoryId;
use refwatch_scheduler::RepositoryRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RepositoryRegistry>,
    /// Asks the poller for an immediate pass of one repository.
    pub wake: mpsc::Sender<RepositoryId>,
}

impl AppState {
    pub fn new(registry: Arc<RepositoryRegistry>, wake: mpsc::Sender<RepositoryId>) -> Self {
        Self { registry, wake }
    }
}
