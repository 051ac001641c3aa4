//! Commit status reporting, decoupled from admission through a queue.

use refwatch_core::remote::{external_status, status_description};
use refwatch_core::{Backends, Build, RemoteStatusClient, Repository};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A build whose state should be published.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub repository: Repository,
    pub build: Build,
    /// Short name of the build's branch.
    pub branch_name: String,
}

/// Sending half of the status queue. Enqueueing never blocks or fails the caller.
#[derive(Clone)]
pub struct StatusQueue {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl StatusQueue {
    pub fn enqueue(&self, event: StatusEvent) {
        if let Err(e) = self.tx.send(event) {
            let event = e.0;
            warn!(
                repo = %event.repository.url,
                sha = %event.build.commit_id,
                "Status reporter stopped, dropping status"
            );
        }
    }
}

/// Create a status queue and the reporter that drains it.
pub fn status_channel(backends: Arc<dyn Backends>) -> (StatusQueue, StatusReporter) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StatusQueue { tx }, StatusReporter { backends, rx })
}

/// Publish the external status of a build.
///
/// Returns whether a status was delivered. Builds without an external
/// status are ignored; delivery failures are logged.
pub async fn report_state(
    remote: &dyn RemoteStatusClient,
    repository: &Repository,
    build: &Build,
    branch_name: &str,
) -> bool {
    let Some(status) = external_status(build) else {
        debug!(build_id = %build.id, state = %build.state, "No external status for build");
        return false;
    };

    let description = status_description(build, branch_name);
    match remote
        .set_commit_status(repository, &build.commit_id, status, &description)
        .await
    {
        Ok(()) => true,
        Err(e) => {
            warn!(
                repo = %repository.url,
                sha = %build.commit_id,
                client = remote.name(),
                error = %e,
                "Failed to report commit status"
            );
            false
        }
    }
}

/// Delivers queued statuses to the hosting service of each repository.
pub struct StatusReporter {
    backends: Arc<dyn Backends>,
    rx: mpsc::UnboundedReceiver<StatusEvent>,
}

impl StatusReporter {
    /// Run until every [`StatusQueue`] has been dropped and the queue is empty.
    pub async fn run(mut self) -> usize {
        info!("Starting status reporter");
        let mut delivered = 0;

        while let Some(event) = self.rx.recv().await {
            let remote = self.backends.remote(&event.repository);
            if report_state(
                remote.as_ref(),
                &event.repository,
                &event.build,
                &event.branch_name,
            )
            .await
            {
                delivered += 1;
            }
        }

        info!(delivered, "Status reporter stopped");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use refwatch_core::{
        BranchId, BuildState, CommitInfo, ExternalStatus, FetchError, MergeRequestInfo, NewBuild,
        Provider, RefEntry, RefFetcher, RemoteServiceError,
    };
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRemote {
        fail: bool,
        sent: Mutex<Vec<(String, ExternalStatus, String)>>,
    }

    #[async_trait]
    impl RemoteStatusClient for RecordingRemote {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn set_commit_status(
            &self,
            _repository: &Repository,
            commit_id: &str,
            status: ExternalStatus,
            description: &str,
        ) -> Result<(), RemoteServiceError> {
            if self.fail {
                return Err(RemoteServiceError::Api {
                    status: 502,
                    body: "bad gateway".to_string(),
                });
            }
            self.sent.lock().unwrap().push((
                commit_id.to_string(),
                status,
                description.to_string(),
            ));
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

    struct NoRefs;

    #[async_trait]
    impl RefFetcher for NoRefs {
        fn name(&self) -> &'static str {
            "none"
        }

        async fn list_refs(&self, _repository: &Repository) -> Result<Vec<RefEntry>, FetchError> {
            Ok(Vec::new())
        }
    }

    struct Fixed(Arc<RecordingRemote>);

    impl Backends for Fixed {
        fn fetcher(&self, _repository: &Repository) -> Arc<dyn RefFetcher> {
            Arc::new(NoRefs)
        }

        fn remote(&self, _repository: &Repository) -> Arc<dyn RemoteStatusClient> {
            self.0.clone()
        }
    }

    fn repository() -> Repository {
        Repository::new("https://gitlab.com/acme/app.git", Provider::Gitlab)
    }

    fn build(state: BuildState) -> Build {
        NewBuild {
            repository_id: repository().id,
            branch_id: BranchId::new(),
            commit_id: "0123456789abcdef".to_string(),
            commit: CommitInfo {
                author: "Ada".to_string(),
                author_email: "ada@example.com".to_string(),
                committer: "Ada".to_string(),
                committer_email: "ada@example.com".to_string(),
                subject: "Subject".to_string(),
                date: Utc::now(),
            },
            state,
            sequence: 12,
            duplicate_of: None,
        }
        .into_build()
    }

    #[tokio::test]
    async fn test_report_state_sends_pending_status() {
        let remote = RecordingRemote::default();
        let delivered = report_state(&remote, &repository(), &build(BuildState::Pending), "main").await;
        assert!(delivered);

        let sent = remote.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "0123456789abcdef");
        assert_eq!(sent[0].1, ExternalStatus::Pending);
        assert_eq!(sent[0].2, "build 00012-main-012345");
    }

    #[tokio::test]
    async fn test_report_state_ignores_unreported_states() {
        let remote = RecordingRemote::default();
        assert!(!report_state(&remote, &repository(), &build(BuildState::Duplicate), "main").await);
        assert!(remote.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_report_state_swallows_delivery_failure() {
        let remote = RecordingRemote {
            fail: true,
            ..Default::default()
        };
        assert!(!report_state(&remote, &repository(), &build(BuildState::Pending), "main").await);
    }

    #[tokio::test]
    async fn test_reporter_drains_queue_until_senders_drop() {
        let remote = Arc::new(RecordingRemote::default());
        let (queue, reporter) = status_channel(Arc::new(Fixed(remote.clone())));

        for state in [BuildState::Pending, BuildState::Skipped, BuildState::Testing] {
            queue.enqueue(StatusEvent {
                repository: repository(),
                build: build(state),
                branch_name: "main".to_string(),
            });
        }
        drop(queue);

        assert_eq!(reporter.run().await, 2);
        let statuses: Vec<ExternalStatus> =
            remote.sent.lock().unwrap().iter().map(|s| s.1).collect();
        assert_eq!(statuses, vec![ExternalStatus::Pending, ExternalStatus::Running]);
    }
}
