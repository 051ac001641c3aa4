//! Repository synchronization: reconcile remote refs into branches and builds.

use chrono::{DateTime, Utc};
use refwatch_core::branch::head_ref;
use refwatch_core::{
    Backends, Branch, BranchId, BuildId, BuildState, FetchError, MergeRequestInfo, NewBuild,
    RefEntry, RefFetcher, RemoteServiceError, Repository, RepositoryId, SyncMode,
};
use refwatch_db::{BranchStore, BuildQuery, BuildStore, StoreError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, info, warn};

use crate::policy;
use crate::status::{StatusEvent, StatusQueue};

/// Errors that abort a synchronization pass.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to list refs: {0}")]
    Fetch(#[from] FetchError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("synchronization cancelled")]
    Cancelled,
}

/// Counters describing one synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    /// Refs in the fetched snapshot.
    pub refs: usize,
    pub new_branches: usize,
    /// Builds created, including duplicates.
    pub created: usize,
    pub duplicates: usize,
    /// Commits too old to be built.
    pub stale: usize,
    /// Pending builds replaced by a newer commit on the same branch.
    pub superseded: usize,
    /// Pending builds skipped for exceeding the running cap.
    pub evicted: usize,
    /// Branches promoted to sticky.
    pub promoted: usize,
    /// Builds skipped because their branch is not a merge request.
    pub filtered: usize,
    /// The pass was skipped because no webhook arrived since the last fetch.
    pub hook_skipped: bool,
}

/// Reconciles remote ref snapshots into branch and build records.
///
/// Passes for the same repository are serialized; different repositories
/// synchronize concurrently.
pub struct SyncEngine {
    branches: Arc<dyn BranchStore>,
    builds: Arc<dyn BuildStore>,
    backends: Arc<dyn Backends>,
    statuses: StatusQueue,
    locks: Mutex<HashMap<RepositoryId, Arc<AsyncMutex<()>>>>,
    shutdown: watch::Receiver<bool>,
}

impl SyncEngine {
    pub fn new(
        branches: Arc<dyn BranchStore>,
        builds: Arc<dyn BuildStore>,
        backends: Arc<dyn Backends>,
        statuses: StatusQueue,
    ) -> Self {
        Self {
            branches,
            builds,
            backends,
            statuses,
            locks: Mutex::new(HashMap::new()),
            shutdown: watch::channel(false).1,
        }
    }

    /// Stop passes once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn branches(&self) -> &Arc<dyn BranchStore> {
        &self.branches
    }

    pub fn builds(&self) -> &Arc<dyn BuildStore> {
        &self.builds
    }

    /// Run one synchronization pass for `repository`.
    pub async fn synchronize(&self, repository: &Repository) -> Result<SyncResult, SyncError> {
        self.synchronize_at(repository, Utc::now()).await
    }

    /// Run one synchronization pass, judging commit age against `now`.
    pub async fn synchronize_at(
        &self,
        repository: &Repository,
        now: DateTime<Utc>,
    ) -> Result<SyncResult, SyncError> {
        let lock = self.repository_lock(repository.id);
        let _guard = lock.lock().await;

        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let fetcher = self.backends.fetcher(repository);
        if self.hook_is_stale(repository, fetcher.as_ref()).await {
            debug!(repo = %repository.url, "No webhook since last fetch, skipping");
            return Ok(SyncResult {
                hook_skipped: true,
                ..Default::default()
            });
        }

        debug!(repo = %repository.url, fetcher = fetcher.name(), "Updating branches");
        let mut refs = fetcher.list_refs(repository).await?;
        policy::sort_refs(&mut refs);

        let mut result = SyncResult {
            refs: refs.len(),
            ..Default::default()
        };

        for entry in &refs {
            // A ref is either untouched or fully reconciled.
            if self.is_cancelled() {
                info!(repo = %repository.url, "Synchronization cancelled");
                return Err(SyncError::Cancelled);
            }
            self.reconcile_ref(repository, entry, now, &mut result).await?;
        }

        result.evicted = self.evict_over_capacity(repository).await?;

        // Promotion applies from the next pass on; builds skipped above stay skipped.
        if repository.policy.sticky_protected {
            result.promoted = self.promote_protected(repository).await?;
        }

        if repository.policy.merge_request_only {
            result.filtered = self.skip_non_merge_requests(repository).await?;
        }

        info!(
            repo = %repository.url,
            refs = result.refs,
            created = result.created,
            superseded = result.superseded,
            evicted = result.evicted,
            "Synchronized repository"
        );
        Ok(result)
    }

    /// Merge request behind a `refs/pull/<n>` branch, if any.
    pub async fn merge_request_info(
        &self,
        repository: &Repository,
        branch: &Branch,
    ) -> Result<Option<MergeRequestInfo>, RemoteServiceError> {
        let Some(number) = branch.merge_request_number() else {
            return Ok(None);
        };
        self.backends
            .remote(repository)
            .resolve_merge_request(repository, number)
            .await
    }

    fn repository_lock(&self, id: RepositoryId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(id).or_default().clone()
    }

    fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn hook_is_stale(&self, repository: &Repository, fetcher: &dyn RefFetcher) -> bool {
        if repository.mode != SyncMode::Hook {
            return false;
        }
        let Some(hook_time) = repository.hook_time else {
            return false;
        };
        match fetcher.last_fetched(repository).await {
            Some(fetched) => hook_time < fetched,
            None => false,
        }
    }

    async fn reconcile_ref(
        &self,
        repository: &Repository,
        entry: &RefEntry,
        now: DateTime<Utc>,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        let (branch, created) = self
            .branches
            .get_or_create(repository.id, &entry.name)
            .await?;
        if created {
            result.new_branches += 1;
            debug!(repo = %repository.url, branch = %branch.name, "Found new branch");
        }

        if policy::is_stale(entry.commit_date, now) {
            result.stale += 1;
            return Ok(());
        }

        if self.builds.find(branch.id, &entry.commit_id).await?.is_some() {
            return Ok(());
        }

        let mut state = BuildState::Pending;
        let mut sequence = None;
        let mut duplicate_of = None;

        if !branch.sticky {
            let pending = self
                .builds
                .search(&BuildQuery::branch(branch.id).with_states(&[BuildState::Pending]))
                .await?;
            if !pending.is_empty() {
                let ids: Vec<_> = pending.iter().map(|b| b.id).collect();
                let skipped = self.builds.transition(&ids, BuildState::Skipped).await?;
                sequence = policy::inherited_sequence(&pending);
                result.superseded += skipped.len();
                info!(
                    repo = %repository.url,
                    branch = %branch.name,
                    sha = %entry.commit_id,
                    superseded = skipped.len(),
                    "Superseded pending builds"
                );
            }

            if repository.policy.ignore_duplicates {
                duplicate_of = self.running_duplicate(branch.id, &entry.commit_id).await?;
                if duplicate_of.is_some() {
                    state = BuildState::Duplicate;
                }
            }
        }

        let sequence = match sequence {
            Some(sequence) => sequence,
            None => self.builds.next_sequence(repository.id).await?,
        };

        let build = self
            .builds
            .create(NewBuild {
                repository_id: repository.id,
                branch_id: branch.id,
                commit_id: entry.commit_id.clone(),
                commit: entry.commit_info(),
                state,
                sequence,
                duplicate_of,
            })
            .await?;

        result.created += 1;
        if let Some(original) = build.duplicate_of {
            result.duplicates += 1;
            info!(
                repo = %repository.url,
                branch = %branch.name,
                sha = %build.commit_id,
                duplicate_of = %original,
                "Commit already running elsewhere"
            );
        } else {
            debug!(
                repo = %repository.url,
                branch = %branch.name,
                sha = %build.commit_id,
                sequence = build.sequence,
                "New build"
            );
        }

        self.statuses.enqueue(StatusEvent {
            repository: repository.clone(),
            build,
            branch_name: branch.branch_name,
        });
        Ok(())
    }

    /// A running build of the same commit on another branch.
    async fn running_duplicate(
        &self,
        branch_id: BranchId,
        commit_id: &str,
    ) -> Result<Option<BuildId>, SyncError> {
        let query = BuildQuery {
            commit_id: Some(commit_id.to_string()),
            exclude_branch_id: Some(branch_id),
            ..Default::default()
        }
        .with_states(&[BuildState::Running])
        .with_limit(1);

        Ok(self.builds.search(&query).await?.first().map(|b| b.id))
    }

    /// Skip pending builds beyond the repository's running cap.
    ///
    /// Sticky branches keep their slots unless they alone exceed the cap.
    async fn evict_over_capacity(&self, repository: &Repository) -> Result<usize, SyncError> {
        let running_max = repository.policy.running_max;
        let pending = self
            .builds
            .search(&BuildQuery::repository(repository.id).with_states(&[BuildState::Pending]))
            .await?;
        if pending.len() <= running_max {
            return Ok(0);
        }

        let sticky: HashSet<BranchId> = self
            .branches
            .list_by_repository(repository.id)
            .await?
            .into_iter()
            .filter(|b| b.sticky)
            .map(|b| b.id)
            .collect();
        let overflow = policy::over_capacity(pending, &sticky, running_max);

        let sticky_evicted = overflow
            .iter()
            .filter(|b| sticky.contains(&b.branch_id))
            .count();
        if sticky_evicted > 0 {
            warn!(
                repo = %repository.url,
                running_max,
                sticky_evicted,
                "Sticky builds alone exceed the running cap"
            );
        }

        let ids: Vec<_> = overflow.iter().map(|b| b.id).collect();
        let skipped = self.builds.transition(&ids, BuildState::Skipped).await?;
        info!(
            repo = %repository.url,
            running_max,
            skipped = skipped.len(),
            "Skipped builds over capacity"
        );
        Ok(skipped.len())
    }

    async fn promote_protected(&self, repository: &Repository) -> Result<usize, SyncError> {
        let remote = self.backends.remote(repository);
        let protected = match remote.list_protected_branches(repository).await {
            Ok(protected) => protected,
            Err(e) => {
                warn!(
                    repo = %repository.url,
                    client = remote.name(),
                    error = %e,
                    "Failed to list protected branches"
                );
                return Ok(0);
            }
        };

        // Hosting services report branch names, stored branches carry full refs.
        let names: Vec<String> = protected.iter().map(|name| head_ref(name)).collect();
        let promoted = self.branches.mark_sticky(repository.id, &names).await?;
        for branch in &promoted {
            info!(repo = %repository.url, branch = %branch.name, "Protected branch is now sticky");
        }
        Ok(promoted.len())
    }

    async fn skip_non_merge_requests(&self, repository: &Repository) -> Result<usize, SyncError> {
        let branch_ids: Vec<BranchId> = self
            .branches
            .list_by_repository(repository.id)
            .await?
            .into_iter()
            .filter(|b| !b.sticky && !b.is_merge_request())
            .map(|b| b.id)
            .collect();
        if branch_ids.is_empty() {
            return Ok(0);
        }

        let query = BuildQuery {
            branch_ids: Some(branch_ids),
            ..BuildQuery::repository(repository.id)
        }
        .with_states(&[BuildState::Pending, BuildState::Testing, BuildState::Running]);

        let ids: Vec<_> = self
            .builds
            .search(&query)
            .await?
            .into_iter()
            .map(|b| b.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let skipped = self.builds.transition(&ids, BuildState::Skipped).await?;
        info!(
            repo = %repository.url,
            skipped = skipped.len(),
            "Skipped builds outside merge requests"
        );
        Ok(skipped.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::status_channel;
    use async_trait::async_trait;
    use chrono::Duration;
    use refwatch_core::{Build, ExternalStatus, Provider, RemoteStatusClient, RepositoryPolicy};
    use refwatch_db::MemoryStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeFetcher {
        refs: Mutex<Vec<RefEntry>>,
        fail: AtomicBool,
        last_fetched: Mutex<Option<DateTime<Utc>>>,
        calls: AtomicUsize,
    }

    impl FakeFetcher {
        fn set_refs(&self, refs: Vec<RefEntry>) {
            *self.refs.lock().unwrap() = refs;
        }
    }

    #[async_trait]
    impl RefFetcher for FakeFetcher {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn list_refs(&self, _repository: &Repository) -> Result<Vec<RefEntry>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(FetchError::Git {
                    command: "fetch".to_string(),
                    stderr: "could not resolve host".to_string(),
                });
            }
            Ok(self.refs.lock().unwrap().clone())
        }

        async fn last_fetched(&self, _repository: &Repository) -> Option<DateTime<Utc>> {
            *self.last_fetched.lock().unwrap()
        }
    }

    #[derive(Default)]
    struct FakeRemote {
        protected: Mutex<HashSet<String>>,
        fail_protected: AtomicBool,
        statuses: Mutex<Vec<(String, ExternalStatus)>>,
    }

    #[async_trait]
    impl RemoteStatusClient for FakeRemote {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn set_commit_status(
            &self,
            _repository: &Repository,
            commit_id: &str,
            status: ExternalStatus,
            _description: &str,
        ) -> Result<(), RemoteServiceError> {
            self.statuses
                .lock()
                .unwrap()
                .push((commit_id.to_string(), status));
            Ok(())
        }

        async fn list_protected_branches(
            &self,
            _repository: &Repository,
        ) -> Result<HashSet<String>, RemoteServiceError> {
            if self.fail_protected.load(Ordering::SeqCst) {
                return Err(RemoteServiceError::Request("connection reset".to_string()));
            }
            Ok(self.protected.lock().unwrap().clone())
        }

        async fn resolve_merge_request(
            &self,
            _repository: &Repository,
            number: u64,
        ) -> Result<Option<MergeRequestInfo>, RemoteServiceError> {
            Ok((number == 7).then(|| MergeRequestInfo {
                base_ref: "main".to_string(),
                head_ref: "feature".to_string(),
                state: "opened".to_string(),
            }))
        }
    }

    struct FakeBackends {
        fetcher: Arc<FakeFetcher>,
        remote: Arc<FakeRemote>,
    }

    impl Backends for FakeBackends {
        fn fetcher(&self, _repository: &Repository) -> Arc<dyn RefFetcher> {
            self.fetcher.clone()
        }

        fn remote(&self, _repository: &Repository) -> Arc<dyn RemoteStatusClient> {
            self.remote.clone()
        }
    }

    struct Harness {
        engine: SyncEngine,
        store: Arc<MemoryStore>,
        fetcher: Arc<FakeFetcher>,
        remote: Arc<FakeRemote>,
        reporter: crate::status::StatusReporter,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(FakeFetcher::default());
        let remote = Arc::new(FakeRemote::default());
        let backends = Arc::new(FakeBackends {
            fetcher: fetcher.clone(),
            remote: remote.clone(),
        });
        let (queue, reporter) = status_channel(backends.clone());
        let engine = SyncEngine::new(store.clone(), store.clone(), backends, queue);
        Harness {
            engine,
            store,
            fetcher,
            remote,
            reporter,
        }
    }

    fn repository(policy: RepositoryPolicy) -> Repository {
        Repository::new("https://gitlab.com/acme/app.git", Provider::Gitlab).with_policy(policy)
    }

    fn plain_policy() -> RepositoryPolicy {
        RepositoryPolicy {
            sticky_protected: false,
            ..Default::default()
        }
    }

    fn entry(name: &str, sha: &str, age: Duration) -> RefEntry {
        RefEntry {
            name: name.to_string(),
            commit_id: sha.to_string(),
            commit_date: Utc::now() - age,
            author: "Ada".to_string(),
            author_email: "ada@example.com".to_string(),
            subject: format!("Commit {}", sha),
            committer: "Ada".to_string(),
            committer_email: "ada@example.com".to_string(),
        }
    }

    async fn builds(h: &Harness, repo: &Repository) -> Vec<Build> {
        h.store
            .search(&BuildQuery::repository(repo.id))
            .await
            .unwrap()
    }

    async fn branch(h: &Harness, repo: &Repository, name: &str) -> Branch {
        h.store.get_or_create(repo.id, name).await.unwrap().0
    }

    async fn build_for(h: &Harness, repo: &Repository, name: &str, sha: &str) -> Build {
        let branch = branch(h, repo, name).await;
        h.store.find(branch.id, sha).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_repeated_passes_are_idempotent() {
        let h = harness();
        let repo = repository(plain_policy());
        h.fetcher.set_refs(vec![
            entry("refs/heads/main", "aaa", Duration::hours(1)),
            entry("refs/heads/feature", "bbb", Duration::hours(2)),
        ]);

        let first = h.engine.synchronize(&repo).await.unwrap();
        assert_eq!(first.new_branches, 2);
        assert_eq!(first.created, 2);
        let before: Vec<(String, BuildState, i64)> = builds(&h, &repo)
            .await
            .into_iter()
            .map(|b| (b.commit_id, b.state, b.sequence))
            .collect();

        let second = h.engine.synchronize(&repo).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.new_branches, 0);
        let after: Vec<(String, BuildState, i64)> = builds(&h, &repo)
            .await
            .into_iter()
            .map(|b| (b.commit_id, b.state, b.sequence))
            .collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_new_commit_supersedes_pending_build_and_keeps_its_place() {
        let h = harness();
        let repo = repository(plain_policy());

        h.fetcher.set_refs(vec![
            entry("refs/heads/feature", "aaa", Duration::hours(3)),
            entry("refs/heads/main", "bbb", Duration::hours(2)),
        ]);
        h.engine.synchronize(&repo).await.unwrap();
        let old = build_for(&h, &repo, "refs/heads/feature", "aaa").await;

        h.fetcher.set_refs(vec![
            entry("refs/heads/feature", "ccc", Duration::minutes(5)),
            entry("refs/heads/main", "bbb", Duration::hours(2)),
        ]);
        let result = h.engine.synchronize(&repo).await.unwrap();
        assert_eq!(result.superseded, 1);

        let old = BuildStore::get(h.store.as_ref(), old.id).await.unwrap();
        let new = build_for(&h, &repo, "refs/heads/feature", "ccc").await;
        assert_eq!(old.state, BuildState::Skipped);
        assert_eq!(new.state, BuildState::Pending);
        assert_eq!(new.sequence, old.sequence);

        let feature = branch(&h, &repo, "refs/heads/feature").await;
        let pending = h
            .store
            .search(&BuildQuery::branch(feature.id).with_states(&[BuildState::Pending]))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_sticky_branch_keeps_every_pending_build() {
        let h = harness();
        let repo = repository(plain_policy());

        h.fetcher
            .set_refs(vec![entry("refs/heads/main", "aaa", Duration::hours(2))]);
        h.engine.synchronize(&repo).await.unwrap();
        let main = branch(&h, &repo, "refs/heads/main").await;
        h.store.set_sticky(main.id, true).await.unwrap();

        h.fetcher
            .set_refs(vec![entry("refs/heads/main", "bbb", Duration::hours(1))]);
        let result = h.engine.synchronize(&repo).await.unwrap();
        assert_eq!(result.superseded, 0);

        let states: Vec<BuildState> = builds(&h, &repo).await.iter().map(|b| b.state).collect();
        assert_eq!(states, vec![BuildState::Pending, BuildState::Pending]);
    }

    #[tokio::test]
    async fn test_capacity_skips_lowest_priority_build() {
        let h = harness();
        let repo = repository(RepositoryPolicy {
            running_max: 2,
            ..plain_policy()
        });
        h.fetcher.set_refs(vec![
            entry("refs/heads/one", "aaa", Duration::hours(3)),
            entry("refs/heads/two", "bbb", Duration::hours(2)),
            entry("refs/heads/three", "ccc", Duration::hours(1)),
        ]);

        let result = h.engine.synchronize(&repo).await.unwrap();
        assert_eq!(result.created, 3);
        assert_eq!(result.evicted, 1);

        let all = builds(&h, &repo).await;
        let skipped: Vec<&Build> = all
            .iter()
            .filter(|b| b.state == BuildState::Skipped)
            .collect();
        assert_eq!(skipped.len(), 1);
        let highest = all.iter().map(|b| b.sequence).max().unwrap();
        assert_eq!(skipped[0].sequence, highest);
        assert_eq!(
            all.iter().filter(|b| b.state == BuildState::Pending).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_capacity_keeps_sticky_build_admitted() {
        let h = harness();
        let repo = repository(RepositoryPolicy {
            running_max: 2,
            ..plain_policy()
        });
        let main = branch(&h, &repo, "refs/heads/main").await;
        h.store.set_sticky(main.id, true).await.unwrap();

        h.fetcher.set_refs(vec![
            entry("refs/heads/one", "aaa", Duration::hours(2)),
            entry("refs/heads/two", "bbb", Duration::hours(3)),
        ]);
        h.engine.synchronize(&repo).await.unwrap();

        h.fetcher.set_refs(vec![
            entry("refs/heads/one", "aaa", Duration::hours(2)),
            entry("refs/heads/two", "bbb", Duration::hours(3)),
            entry("refs/heads/main", "ccc", Duration::hours(1)),
        ]);
        let result = h.engine.synchronize(&repo).await.unwrap();
        assert_eq!(result.evicted, 1);

        assert_eq!(
            build_for(&h, &repo, "refs/heads/main", "ccc").await.state,
            BuildState::Pending
        );
        assert_eq!(
            build_for(&h, &repo, "refs/heads/one", "aaa").await.state,
            BuildState::Pending
        );
        assert_eq!(
            build_for(&h, &repo, "refs/heads/two", "bbb").await.state,
            BuildState::Skipped
        );
    }

    #[tokio::test]
    async fn test_capacity_evicts_sticky_builds_when_they_alone_overflow() {
        let h = harness();
        let repo = repository(RepositoryPolicy {
            running_max: 1,
            ..plain_policy()
        });
        for name in ["refs/heads/main", "refs/heads/stable"] {
            let sticky = branch(&h, &repo, name).await;
            h.store.set_sticky(sticky.id, true).await.unwrap();
        }
        h.fetcher.set_refs(vec![
            entry("refs/heads/main", "aaa", Duration::hours(2)),
            entry("refs/heads/stable", "bbb", Duration::hours(1)),
        ]);

        let result = h.engine.synchronize(&repo).await.unwrap();
        assert_eq!(result.evicted, 1);

        let all = builds(&h, &repo).await;
        let pending: Vec<&Build> = all
            .iter()
            .filter(|b| b.state == BuildState::Pending)
            .collect();
        assert_eq!(pending.len(), 1);
        let lowest = all.iter().map(|b| b.sequence).min().unwrap();
        assert_eq!(pending[0].sequence, lowest);
    }

    #[tokio::test]
    async fn test_old_commit_creates_branch_without_build() {
        let h = harness();
        let repo = repository(plain_policy());
        h.fetcher
            .set_refs(vec![entry("refs/heads/legacy", "aaa", Duration::days(45))]);

        let result = h.engine.synchronize(&repo).await.unwrap();
        assert_eq!(result.new_branches, 1);
        assert_eq!(result.stale, 1);
        assert_eq!(result.created, 0);
        assert_eq!(h.store.list_by_repository(repo.id).await.unwrap().len(), 1);
        assert!(builds(&h, &repo).await.is_empty());
    }

    #[tokio::test]
    async fn test_commit_running_elsewhere_is_marked_duplicate() {
        let h = harness();
        let repo = repository(RepositoryPolicy {
            ignore_duplicates: true,
            ..plain_policy()
        });

        h.fetcher
            .set_refs(vec![entry("refs/heads/main", "aaa", Duration::hours(1))]);
        h.engine.synchronize(&repo).await.unwrap();
        let running = build_for(&h, &repo, "refs/heads/main", "aaa").await;
        h.store
            .transition(&[running.id], BuildState::Testing)
            .await
            .unwrap();
        h.store
            .transition(&[running.id], BuildState::Running)
            .await
            .unwrap();

        h.fetcher.set_refs(vec![
            entry("refs/heads/main", "aaa", Duration::hours(1)),
            entry("refs/heads/copy", "aaa", Duration::hours(1)),
        ]);
        let result = h.engine.synchronize(&repo).await.unwrap();
        assert_eq!(result.duplicates, 1);

        let copy = build_for(&h, &repo, "refs/heads/copy", "aaa").await;
        assert_eq!(copy.state, BuildState::Duplicate);
        assert_eq!(copy.duplicate_of, Some(running.id));
    }

    #[tokio::test]
    async fn test_sticky_branch_is_never_marked_duplicate() {
        let h = harness();
        let repo = repository(RepositoryPolicy {
            ignore_duplicates: true,
            ..plain_policy()
        });

        h.fetcher
            .set_refs(vec![entry("refs/heads/feature", "aaa", Duration::hours(1))]);
        h.engine.synchronize(&repo).await.unwrap();
        let running = build_for(&h, &repo, "refs/heads/feature", "aaa").await;
        h.store
            .transition(&[running.id], BuildState::Testing)
            .await
            .unwrap();
        h.store
            .transition(&[running.id], BuildState::Running)
            .await
            .unwrap();

        let stable = branch(&h, &repo, "refs/heads/stable").await;
        h.store.set_sticky(stable.id, true).await.unwrap();
        h.fetcher.set_refs(vec![
            entry("refs/heads/feature", "aaa", Duration::hours(1)),
            entry("refs/heads/stable", "aaa", Duration::hours(1)),
        ]);
        let result = h.engine.synchronize(&repo).await.unwrap();
        assert_eq!(result.duplicates, 0);

        let build = build_for(&h, &repo, "refs/heads/stable", "aaa").await;
        assert_eq!(build.state, BuildState::Pending);
        assert_eq!(build.duplicate_of, None);
    }

    #[tokio::test]
    async fn test_duplicates_are_built_when_policy_is_off() {
        let h = harness();
        let repo = repository(plain_policy());

        h.fetcher
            .set_refs(vec![entry("refs/heads/main", "aaa", Duration::hours(1))]);
        h.engine.synchronize(&repo).await.unwrap();
        let running = build_for(&h, &repo, "refs/heads/main", "aaa").await;
        h.store
            .transition(&[running.id], BuildState::Testing)
            .await
            .unwrap();
        h.store
            .transition(&[running.id], BuildState::Running)
            .await
            .unwrap();

        h.fetcher.set_refs(vec![
            entry("refs/heads/main", "aaa", Duration::hours(1)),
            entry("refs/heads/copy", "aaa", Duration::hours(1)),
        ]);
        h.engine.synchronize(&repo).await.unwrap();

        let copy = build_for(&h, &repo, "refs/heads/copy", "aaa").await;
        assert_eq!(copy.state, BuildState::Pending);
        assert_eq!(copy.duplicate_of, None);
    }

    #[tokio::test]
    async fn test_protected_branches_become_sticky_after_the_pass() {
        let h = harness();
        let repo = repository(RepositoryPolicy::default());
        h.remote.protected.lock().unwrap().insert("main".to_string());
        h.fetcher.set_refs(vec![
            entry("refs/heads/main", "aaa", Duration::hours(1)),
            entry("refs/heads/feature", "bbb", Duration::hours(1)),
        ]);

        let result = h.engine.synchronize(&repo).await.unwrap();
        assert_eq!(result.promoted, 1);
        assert!(branch(&h, &repo, "refs/heads/main").await.sticky);
        assert!(!branch(&h, &repo, "refs/heads/feature").await.sticky);

        let again = h.engine.synchronize(&repo).await.unwrap();
        assert_eq!(again.promoted, 0);
    }

    #[tokio::test]
    async fn test_protected_names_match_full_branch_refs() {
        let h = harness();
        let repo = repository(RepositoryPolicy::default());
        h.remote.protected.lock().unwrap().extend([
            "main".to_string(),
            "7".to_string(),
            "release/1.0".to_string(),
        ]);
        h.fetcher.set_refs(vec![
            entry("refs/heads/main", "aaa", Duration::hours(1)),
            entry("refs/heads/hotfix/main", "bbb", Duration::hours(1)),
            entry("refs/pull/7", "ccc", Duration::hours(1)),
            entry("refs/heads/release/1.0", "ddd", Duration::hours(1)),
        ]);

        let result = h.engine.synchronize(&repo).await.unwrap();
        assert_eq!(result.promoted, 2);
        assert!(branch(&h, &repo, "refs/heads/main").await.sticky);
        assert!(branch(&h, &repo, "refs/heads/release/1.0").await.sticky);
        assert!(!branch(&h, &repo, "refs/heads/hotfix/main").await.sticky);
        assert!(!branch(&h, &repo, "refs/pull/7").await.sticky);
    }

    #[tokio::test]
    async fn test_merge_request_only_skips_other_branches() {
        let h = harness();
        let repo = repository(RepositoryPolicy {
            merge_request_only: true,
            ..plain_policy()
        });
        h.fetcher.set_refs(vec![
            entry("refs/heads/feature", "aaa", Duration::hours(1)),
            entry("refs/pull/7", "bbb", Duration::hours(1)),
            entry("refs/heads/main", "ccc", Duration::hours(1)),
        ]);
        h.engine.synchronize(&repo).await.unwrap();
        let main = branch(&h, &repo, "refs/heads/main").await;
        h.store.set_sticky(main.id, true).await.unwrap();

        h.fetcher.set_refs(vec![
            entry("refs/heads/feature", "ddd", Duration::minutes(1)),
            entry("refs/pull/7", "bbb", Duration::hours(1)),
            entry("refs/heads/main", "eee", Duration::minutes(1)),
        ]);
        let result = h.engine.synchronize(&repo).await.unwrap();
        assert_eq!(result.filtered, 1);

        assert_eq!(
            build_for(&h, &repo, "refs/heads/feature", "ddd").await.state,
            BuildState::Skipped
        );
        assert_eq!(
            build_for(&h, &repo, "refs/pull/7", "bbb").await.state,
            BuildState::Pending
        );
        assert_eq!(
            build_for(&h, &repo, "refs/heads/main", "eee").await.state,
            BuildState::Pending
        );
    }

    #[tokio::test]
    async fn test_protected_branch_failure_does_not_abort_pass() {
        let h = harness();
        let repo = repository(RepositoryPolicy {
            merge_request_only: true,
            ..Default::default()
        });
        h.remote.fail_protected.store(true, Ordering::SeqCst);
        h.fetcher
            .set_refs(vec![entry("refs/heads/feature", "aaa", Duration::hours(1))]);

        let result = h.engine.synchronize(&repo).await.unwrap();
        assert_eq!(result.created, 1);
        assert_eq!(result.promoted, 0);
        assert_eq!(result.filtered, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_aborts_pass() {
        let h = harness();
        let repo = repository(plain_policy());
        h.fetcher.fail.store(true, Ordering::SeqCst);

        let err = h.engine.synchronize(&repo).await.unwrap_err();
        assert!(matches!(err, SyncError::Fetch(_)));
        assert!(h.store.list_by_repository(repo.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_fetch() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(FakeFetcher::default());
        let backends = Arc::new(FakeBackends {
            fetcher: fetcher.clone(),
            remote: Arc::new(FakeRemote::default()),
        });
        let (queue, _reporter) = status_channel(backends.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = SyncEngine::new(store.clone(), store.clone(), backends, queue)
            .with_shutdown(shutdown_rx);

        shutdown_tx.send(true).unwrap();
        let err = engine
            .synchronize(&repository(plain_policy()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hook_mode_skips_when_nothing_new() {
        let h = harness();
        let mut repo = repository(plain_policy());
        repo.mode = SyncMode::Hook;
        let fetched = Utc::now();
        *h.fetcher.last_fetched.lock().unwrap() = Some(fetched);
        h.fetcher
            .set_refs(vec![entry("refs/heads/main", "aaa", Duration::hours(1))]);

        repo.hook_time = Some(fetched - Duration::minutes(5));
        let result = h.engine.synchronize(&repo).await.unwrap();
        assert!(result.hook_skipped);
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);

        repo.hook_time = Some(fetched + Duration::minutes(1));
        let result = h.engine.synchronize(&repo).await.unwrap();
        assert!(!result.hook_skipped);
        assert_eq!(result.created, 1);
    }

    #[tokio::test]
    async fn test_merge_request_info() {
        let h = harness();
        let repo = repository(plain_policy());

        let mr = branch(&h, &repo, "refs/pull/7").await;
        let info = h.engine.merge_request_info(&repo, &mr).await.unwrap().unwrap();
        assert_eq!(info.base_ref, "main");

        let missing = branch(&h, &repo, "refs/pull/8").await;
        assert!(h.engine.merge_request_info(&repo, &missing).await.unwrap().is_none());

        let main = branch(&h, &repo, "refs/heads/main").await;
        assert!(h.engine.merge_request_info(&repo, &main).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_new_builds_are_reported() {
        let h = harness();
        let repo = repository(plain_policy());
        h.fetcher.set_refs(vec![
            entry("refs/heads/main", "aaa", Duration::hours(1)),
            entry("refs/heads/feature", "bbb", Duration::hours(2)),
        ]);
        h.engine.synchronize(&repo).await.unwrap();

        let Harness {
            engine,
            remote,
            reporter,
            ..
        } = h;
        drop(engine);
        assert_eq!(reporter.run().await, 2);

        let statuses = remote.statuses.lock().unwrap();
        assert!(
            statuses
                .iter()
                .all(|(_, status)| *status == ExternalStatus::Pending)
        );
    }
}
