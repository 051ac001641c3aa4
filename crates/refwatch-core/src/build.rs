//! Builds scheduled for observed commits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{BranchId, BuildId, RepositoryId};

/// Lifecycle state of a build.
///
/// ```text
/// pending -> testing -> running -> done
/// pending -> duplicate
/// pending | testing | running -> skipped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Pending,
    Testing,
    Running,
    Done,
    Skipped,
    Duplicate,
}

impl BuildState {
    pub const ALL: [BuildState; 6] = [
        BuildState::Pending,
        BuildState::Testing,
        BuildState::Running,
        BuildState::Done,
        BuildState::Skipped,
        BuildState::Duplicate,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildState::Done | BuildState::Skipped | BuildState::Duplicate
        )
    }

    /// States a build may be in to move to `self`.
    pub fn predecessors(&self) -> &'static [BuildState] {
        match self {
            BuildState::Pending => &[],
            BuildState::Testing => &[BuildState::Pending],
            BuildState::Running => &[BuildState::Testing],
            BuildState::Done => &[BuildState::Testing, BuildState::Running],
            BuildState::Skipped => &[BuildState::Pending, BuildState::Testing, BuildState::Running],
            BuildState::Duplicate => &[BuildState::Pending],
        }
    }

    pub fn can_transition_to(&self, next: BuildState) -> bool {
        next.predecessors().contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Pending => "pending",
            BuildState::Testing => "testing",
            BuildState::Running => "running",
            BuildState::Done => "done",
            BuildState::Skipped => "skipped",
            BuildState::Duplicate => "duplicate",
        }
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BuildState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("Unknown build state: {}", s))
    }
}

/// Outcome of an executed build, set by the execution pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildResult {
    Ok,
    Ko,
    Warn,
    Killed,
}

impl BuildResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildResult::Ok => "ok",
            BuildResult::Ko => "ko",
            BuildResult::Warn => "warn",
            BuildResult::Killed => "killed",
        }
    }
}

impl std::str::FromStr for BuildResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(BuildResult::Ok),
            "ko" => Ok(BuildResult::Ko),
            "warn" => Ok(BuildResult::Warn),
            "killed" => Ok(BuildResult::Killed),
            _ => Err(format!("Unknown build result: {}", s)),
        }
    }
}

/// Commit metadata captured when a build is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub author: String,
    pub author_email: String,
    pub committer: String,
    pub committer_email: String,
    pub subject: String,
    pub date: DateTime<Utc>,
}

/// A build record, unique per (branch, commit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub repository_id: RepositoryId,
    pub branch_id: BranchId,
    /// Commit SHA this build was created for.
    pub commit_id: String,
    pub commit: CommitInfo,
    pub state: BuildState,
    pub result: Option<BuildResult>,
    /// Queue priority; lower runs first.
    pub sequence: i64,
    /// Running build on another branch this one duplicates.
    pub duplicate_of: Option<BuildId>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Build {
    /// Short human identifier: `<sequence>-<branch>-<sha>`.
    pub fn dest(&self, branch_name: &str) -> String {
        let branch: String = branch_name
            .chars()
            .take(32)
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let sha: String = self.commit_id.chars().take(6).collect();
        format!("{:05}-{}-{}", self.sequence, branch, sha)
    }

    /// Wall-clock runtime once the build has started and finished.
    pub fn runtime(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

/// Data needed to create a build.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub repository_id: RepositoryId,
    pub branch_id: BranchId,
    pub commit_id: String,
    pub commit: CommitInfo,
    pub state: BuildState,
    pub sequence: i64,
    pub duplicate_of: Option<BuildId>,
}

impl NewBuild {
    /// Materialize the record a store will hold.
    pub fn into_build(self) -> Build {
        let now = Utc::now();
        Build {
            id: BuildId::new(),
            repository_id: self.repository_id,
            branch_id: self.branch_id,
            commit_id: self.commit_id,
            commit: self.commit,
            state: self.state,
            result: None,
            sequence: self.sequence,
            duplicate_of: self.duplicate_of,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
