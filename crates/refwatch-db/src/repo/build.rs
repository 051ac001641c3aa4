//! Build store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refwatch_core::{
    BranchId, Build, BuildId, BuildResult, BuildState, CommitInfo, NewBuild, RepositoryId,
};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{StoreError, StoreResult};

/// Ordering of search results by sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SequenceOrder {
    /// Highest priority first.
    #[default]
    Ascending,
    /// Lowest priority first.
    Descending,
}

/// Predicate for [`BuildStore::search`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct BuildQuery {
    pub repository_id: Option<RepositoryId>,
    pub branch_id: Option<BranchId>,
    /// Restrict to builds on any of these branches.
    pub branch_ids: Option<Vec<BranchId>>,
    pub exclude_branch_id: Option<BranchId>,
    pub commit_id: Option<String>,
    /// Restrict to these states; empty means any state.
    pub states: Vec<BuildState>,
    pub order: SequenceOrder,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl BuildQuery {
    pub fn repository(repository_id: RepositoryId) -> Self {
        Self {
            repository_id: Some(repository_id),
            ..Default::default()
        }
    }

    pub fn branch(branch_id: BranchId) -> Self {
        Self {
            branch_id: Some(branch_id),
            ..Default::default()
        }
    }

    pub fn with_states(mut self, states: &[BuildState]) -> Self {
        self.states = states.to_vec();
        self
    }

    pub fn with_order(mut self, order: SequenceOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a build satisfies every filter (ordering and paging aside).
    pub fn matches(&self, build: &Build) -> bool {
        self.repository_id.is_none_or(|id| build.repository_id == id)
            && self.branch_id.is_none_or(|id| build.branch_id == id)
            && self
                .branch_ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&build.branch_id))
            && self.exclude_branch_id != Some(build.branch_id)
            && self
                .commit_id
                .as_deref()
                .is_none_or(|sha| build.commit_id == sha)
            && (self.states.is_empty() || self.states.contains(&build.state))
    }
}

/// Database row for builds.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildRow {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub branch_id: Uuid,
    pub commit_id: String,
    pub author: String,
    pub author_email: String,
    pub committer: String,
    pub committer_email: String,
    pub subject: String,
    pub commit_date: DateTime<Utc>,
    pub state: String,
    pub result: Option<String>,
    pub sequence: i64,
    pub duplicate_of: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<BuildRow> for Build {
    type Error = StoreError;

    fn try_from(row: BuildRow) -> Result<Self, Self::Error> {
        let state: BuildState = row.state.parse().map_err(StoreError::InvalidData)?;
        let result = row
            .result
            .as_deref()
            .map(str::parse::<BuildResult>)
            .transpose()
            .map_err(StoreError::InvalidData)?;

        Ok(Build {
            id: BuildId::from_uuid(row.id),
            repository_id: RepositoryId::from_uuid(row.repository_id),
            branch_id: BranchId::from_uuid(row.branch_id),
            commit_id: row.commit_id,
            commit: CommitInfo {
                author: row.author,
                author_email: row.author_email,
                committer: row.committer,
                committer_email: row.committer_email,
                subject: row.subject,
                date: row.commit_date,
            },
            state,
            result,
            sequence: row.sequence,
            duplicate_of: row.duplicate_of.map(BuildId::from_uuid),
            started_at: row.started_at,
            finished_at: row.finished_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn rows_to_builds(rows: Vec<BuildRow>) -> StoreResult<Vec<Build>> {
    rows.into_iter().map(Build::try_from).collect()
}

#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Allocate the next sequence number of a repository.
    async fn next_sequence(&self, repository_id: RepositoryId) -> StoreResult<i64>;

    /// Create a build. Fails with [`StoreError::Duplicate`] if the branch
    /// already has a build for this commit.
    async fn create(&self, build: NewBuild) -> StoreResult<Build>;

    async fn get(&self, id: BuildId) -> StoreResult<Build>;

    async fn find(&self, branch_id: BranchId, commit_id: &str) -> StoreResult<Option<Build>>;

    async fn search(&self, query: &BuildQuery) -> StoreResult<Vec<Build>>;

    /// Move builds to `state`.
    ///
    /// Builds whose current state cannot move to `state` are left as they
    /// are. Returns the builds that changed.
    async fn transition(&self, ids: &[BuildId], state: BuildState) -> StoreResult<Vec<Build>>;

    /// Record the outcome reported by the execution pipeline.
    async fn record_result(&self, id: BuildId, result: BuildResult) -> StoreResult<Build>;
}

/// PostgreSQL implementation of BuildStore.
pub struct PgBuildStore {
    pool: PgPool,
}

impl PgBuildStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildStore for PgBuildStore {
    async fn next_sequence(&self, repository_id: RepositoryId) -> StoreResult<i64> {
        let (value,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO repository_sequences (repository_id, value)
            VALUES ($1, 1)
            ON CONFLICT (repository_id) DO UPDATE SET value = repository_sequences.value + 1
            RETURNING value
            "#,
        )
        .bind(repository_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(value)
    }

    async fn create(&self, build: NewBuild) -> StoreResult<Build> {
        let build = build.into_build();
        let what = format!("build for {} on branch {}", build.commit_id, build.branch_id);

        let row = sqlx::query_as::<_, BuildRow>(
            r#"
            INSERT INTO builds (
                id, repository_id, branch_id, commit_id,
                author, author_email, committer, committer_email, subject, commit_date,
                state, sequence, duplicate_of, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(build.id.as_uuid())
        .bind(build.repository_id.as_uuid())
        .bind(build.branch_id.as_uuid())
        .bind(&build.commit_id)
        .bind(&build.commit.author)
        .bind(&build.commit.author_email)
        .bind(&build.commit.committer)
        .bind(&build.commit.committer_email)
        .bind(&build.commit.subject)
        .bind(build.commit.date)
        .bind(build.state.as_str())
        .bind(build.sequence)
        .bind(build.duplicate_of.map(Uuid::from))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_insert(e, what))?;

        row.try_into()
    }

    async fn get(&self, id: BuildId) -> StoreResult<Build> {
        sqlx::query_as::<_, BuildRow>("SELECT * FROM builds WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("build {}", id)))?
            .try_into()
    }

    async fn find(&self, branch_id: BranchId, commit_id: &str) -> StoreResult<Option<Build>> {
        sqlx::query_as::<_, BuildRow>("SELECT * FROM builds WHERE branch_id = $1 AND commit_id = $2")
            .bind(branch_id.as_uuid())
            .bind(commit_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Build::try_from)
            .transpose()
    }

    async fn search(&self, query: &BuildQuery) -> StoreResult<Vec<Build>> {
        let mut sql = QueryBuilder::<Postgres>::new("SELECT * FROM builds WHERE TRUE");

        if let Some(id) = query.repository_id {
            sql.push(" AND repository_id = ").push_bind(Uuid::from(id));
        }
        if let Some(id) = query.branch_id {
            sql.push(" AND branch_id = ").push_bind(Uuid::from(id));
        }
        if let Some(ids) = &query.branch_ids {
            let ids: Vec<Uuid> = ids.iter().copied().map(Uuid::from).collect();
            sql.push(" AND branch_id = ANY(").push_bind(ids).push(")");
        }
        if let Some(id) = query.exclude_branch_id {
            sql.push(" AND branch_id <> ").push_bind(Uuid::from(id));
        }
        if let Some(sha) = &query.commit_id {
            sql.push(" AND commit_id = ").push_bind(sha.clone());
        }
        if !query.states.is_empty() {
            let states: Vec<&'static str> = query.states.iter().map(|s| s.as_str()).collect();
            sql.push(" AND state = ANY(").push_bind(states).push(")");
        }

        match query.order {
            SequenceOrder::Ascending => sql.push(" ORDER BY sequence ASC, created_at ASC"),
            SequenceOrder::Descending => sql.push(" ORDER BY sequence DESC, created_at DESC"),
        };

        if let Some(limit) = query.limit {
            sql.push(" LIMIT ").push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        sql.push(" OFFSET ")
            .push_bind(i64::try_from(query.offset).unwrap_or(i64::MAX));

        let rows = sql
            .build_query_as::<BuildRow>()
            .fetch_all(&self.pool)
            .await?;
        rows_to_builds(rows)
    }

    async fn transition(&self, ids: &[BuildId], state: BuildState) -> StoreResult<Vec<Build>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = ids.iter().copied().map(Uuid::from).collect();
        let from: Vec<&'static str> = state.predecessors().iter().map(|s| s.as_str()).collect();

        let rows = sqlx::query_as::<_, BuildRow>(
            r#"
            UPDATE builds
            SET state = $2,
                started_at = CASE WHEN $2 = 'testing' THEN NOW() ELSE started_at END,
                finished_at = CASE WHEN $2 IN ('done', 'skipped') THEN NOW() ELSE finished_at END,
                updated_at = NOW()
            WHERE id = ANY($1) AND state = ANY($3)
            RETURNING *
            "#,
        )
        .bind(&ids)
        .bind(state.as_str())
        .bind(&from)
        .fetch_all(&self.pool)
        .await?;
        rows_to_builds(rows)
    }

    async fn record_result(&self, id: BuildId, result: BuildResult) -> StoreResult<Build> {
        sqlx::query_as::<_, BuildRow>(
            "UPDATE builds SET result = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(id.as_uuid())
        .bind(result.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("build {}", id)))?
        .try_into()
    }
}
