//! In-memory store, used when no database is configured and in tests.

use async_trait::async_trait;
use chrono::Utc;
use refwatch_core::{
    Branch, BranchId, Build, BuildId, BuildResult, BuildState, NewBuild, RepositoryId,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::repo::branch::BranchStore;
use crate::repo::build::{BuildQuery, BuildStore, SequenceOrder};
use crate::{StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    branches: HashMap<BranchId, Branch>,
    branch_index: HashMap<(RepositoryId, String), BranchId>,
    builds: HashMap<BuildId, Build>,
    build_index: HashMap<(BranchId, String), BuildId>,
    sequences: HashMap<RepositoryId, i64>,
}

/// Process-local implementation of [`BranchStore`] and [`BuildStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // every mutation below completes before the guard drops
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BranchStore for MemoryStore {
    async fn get_or_create(
        &self,
        repository_id: RepositoryId,
        name: &str,
    ) -> StoreResult<(Branch, bool)> {
        let mut inner = self.lock();
        let key = (repository_id, name.to_string());

        if let Some(id) = inner.branch_index.get(&key) {
            let branch = inner.branches[id].clone();
            return Ok((branch, false));
        }

        let branch = Branch::new(repository_id, name);
        inner.branch_index.insert(key, branch.id);
        inner.branches.insert(branch.id, branch.clone());
        Ok((branch, true))
    }

    async fn get(&self, id: BranchId) -> StoreResult<Branch> {
        self.lock()
            .branches
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("branch {}", id)))
    }

    async fn list_by_repository(&self, repository_id: RepositoryId) -> StoreResult<Vec<Branch>> {
        let mut branches: Vec<Branch> = self
            .lock()
            .branches
            .values()
            .filter(|b| b.repository_id == repository_id)
            .cloned()
            .collect();
        branches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(branches)
    }

    async fn mark_sticky(
        &self,
        repository_id: RepositoryId,
        names: &[String],
    ) -> StoreResult<Vec<Branch>> {
        let mut inner = self.lock();
        let mut promoted = Vec::new();

        for branch in inner.branches.values_mut() {
            if branch.repository_id == repository_id
                && !branch.sticky
                && names.contains(&branch.name)
            {
                branch.sticky = true;
                promoted.push(branch.clone());
            }
        }
        Ok(promoted)
    }

    async fn set_sticky(&self, id: BranchId, sticky: bool) -> StoreResult<Branch> {
        let mut inner = self.lock();
        let branch = inner
            .branches
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("branch {}", id)))?;
        branch.sticky = sticky;
        Ok(branch.clone())
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn next_sequence(&self, repository_id: RepositoryId) -> StoreResult<i64> {
        let mut inner = self.lock();
        let value = inner.sequences.entry(repository_id).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn create(&self, build: NewBuild) -> StoreResult<Build> {
        let mut inner = self.lock();
        let key = (build.branch_id, build.commit_id.clone());

        if inner.build_index.contains_key(&key) {
            return Err(StoreError::Duplicate(format!(
                "build for {} on branch {}",
                build.commit_id, build.branch_id
            )));
        }

        let build = build.into_build();
        inner.build_index.insert(key, build.id);
        inner.builds.insert(build.id, build.clone());
        Ok(build)
    }

    async fn get(&self, id: BuildId) -> StoreResult<Build> {
        self.lock()
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("build {}", id)))
    }

    async fn find(&self, branch_id: BranchId, commit_id: &str) -> StoreResult<Option<Build>> {
        let inner = self.lock();
        Ok(inner
            .build_index
            .get(&(branch_id, commit_id.to_string()))
            .map(|id| inner.builds[id].clone()))
    }

    async fn search(&self, query: &BuildQuery) -> StoreResult<Vec<Build>> {
        let mut builds: Vec<Build> = self
            .lock()
            .builds
            .values()
            .filter(|b| query.matches(b))
            .cloned()
            .collect();

        builds.sort_by(|a, b| {
            (a.sequence, a.created_at, a.id).cmp(&(b.sequence, b.created_at, b.id))
        });
        if query.order == SequenceOrder::Descending {
            builds.reverse();
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(builds.into_iter().skip(query.offset).take(limit).collect())
    }

    async fn transition(&self, ids: &[BuildId], state: BuildState) -> StoreResult<Vec<Build>> {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut changed = Vec::new();

        for id in ids {
            let Some(build) = inner.builds.get_mut(id) else {
                continue;
            };
            if !build.state.can_transition_to(state) {
                continue;
            }
            build.state = state;
            match state {
                BuildState::Testing => build.started_at = Some(now),
                BuildState::Done | BuildState::Skipped => build.finished_at = Some(now),
                _ => {}
            }
            build.updated_at = now;
            changed.push(build.clone());
        }
        Ok(changed)
    }

    async fn record_result(&self, id: BuildId, result: BuildResult) -> StoreResult<Build> {
        let mut inner = self.lock();
        let build = inner
            .builds
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("build {}", id)))?;
        build.result = Some(result);
        build.updated_at = Utc::now();
        Ok(build.clone())
    }
}
