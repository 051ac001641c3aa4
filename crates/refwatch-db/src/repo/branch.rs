//! Branch store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refwatch_core::{Branch, BranchId, RepositoryId};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{StoreError, StoreResult};

/// Database row for branches.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BranchRow {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub name: String,
    pub branch_name: String,
    pub sticky: bool,
    pub created_at: DateTime<Utc>,
}

impl From<BranchRow> for Branch {
    fn from(row: BranchRow) -> Self {
        Branch {
            id: BranchId::from_uuid(row.id),
            repository_id: RepositoryId::from_uuid(row.repository_id),
            name: row.name,
            branch_name: row.branch_name,
            sticky: row.sticky,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
pub trait BranchStore: Send + Sync {
    /// Fetch the branch with this ref name, creating it if absent.
    ///
    /// Returns the branch and whether this call created it. Concurrent calls
    /// for the same (repository, name) yield a single record.
    async fn get_or_create(
        &self,
        repository_id: RepositoryId,
        name: &str,
    ) -> StoreResult<(Branch, bool)>;

    async fn get(&self, id: BranchId) -> StoreResult<Branch>;

    async fn list_by_repository(&self, repository_id: RepositoryId) -> StoreResult<Vec<Branch>>;

    /// Make every non-sticky branch whose full ref name is in `names` sticky.
    ///
    /// Returns the branches that changed.
    async fn mark_sticky(
        &self,
        repository_id: RepositoryId,
        names: &[String],
    ) -> StoreResult<Vec<Branch>>;

    async fn set_sticky(&self, id: BranchId, sticky: bool) -> StoreResult<Branch>;
}

/// PostgreSQL implementation of BranchStore.
pub struct PgBranchStore {
    pool: PgPool,
}

impl PgBranchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BranchStore for PgBranchStore {
    async fn get_or_create(
        &self,
        repository_id: RepositoryId,
        name: &str,
    ) -> StoreResult<(Branch, bool)> {
        let candidate = Branch::new(repository_id, name);

        let inserted = sqlx::query_as::<_, BranchRow>(
            r#"
            INSERT INTO branches (id, repository_id, name, branch_name, sticky, created_at)
            VALUES ($1, $2, $3, $4, FALSE, NOW())
            ON CONFLICT (repository_id, name) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(candidate.id.as_uuid())
        .bind(repository_id.as_uuid())
        .bind(&candidate.name)
        .bind(&candidate.branch_name)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }

        let row = sqlx::query_as::<_, BranchRow>(
            "SELECT * FROM branches WHERE repository_id = $1 AND name = $2",
        )
        .bind(repository_id.as_uuid())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.into(), false))
    }

    async fn get(&self, id: BranchId) -> StoreResult<Branch> {
        let row = sqlx::query_as::<_, BranchRow>("SELECT * FROM branches WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("branch {}", id)))?;
        Ok(row.into())
    }

    async fn list_by_repository(&self, repository_id: RepositoryId) -> StoreResult<Vec<Branch>> {
        let rows = sqlx::query_as::<_, BranchRow>(
            "SELECT * FROM branches WHERE repository_id = $1 ORDER BY name",
        )
        .bind(repository_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Branch::from).collect())
    }

    async fn mark_sticky(
        &self,
        repository_id: RepositoryId,
        names: &[String],
    ) -> StoreResult<Vec<Branch>> {
        let rows = sqlx::query_as::<_, BranchRow>(
            r#"
            UPDATE branches SET sticky = TRUE
            WHERE repository_id = $1 AND name = ANY($2) AND sticky = FALSE
            RETURNING *
            "#,
        )
        .bind(repository_id.as_uuid())
        .bind(names)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Branch::from).collect())
    }

    async fn set_sticky(&self, id: BranchId, sticky: bool) -> StoreResult<Branch> {
        let row = sqlx::query_as::<_, BranchRow>(
            "UPDATE branches SET sticky = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id.as_uuid())
        .bind(sticky)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("branch {}", id)))?;
        Ok(row.into())
    }
}
