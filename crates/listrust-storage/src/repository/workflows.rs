//! Workflow index repository
//!
//! Each row claims a (list, address, kind) key for one live workflow and
//! names the token its state is currently pended under.

use crate::db::DatabasePool;
use crate::models::{WorkflowClaim, WorkflowKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listrust_common::{Error, Result};

/// Workflow index repository trait
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Claim `key` for a new workflow. Succeeds if the key is free or its
    /// previous claim has expired; returns `false` if a live claim exists.
    async fn claim(
        &self,
        key: &WorkflowKey,
        token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn find(&self, key: &WorkflowKey, now: DateTime<Utc>) -> Result<Option<WorkflowClaim>>;

    /// Point a claim at a new token. Only succeeds if `old_token` still holds it.
    async fn reassign(
        &self,
        key: &WorkflowKey,
        old_token: &str,
        new_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drop a claim if it is still held under `token`
    async fn release(&self, key: &WorkflowKey, token: &str) -> Result<bool>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Database workflow index repository
pub struct DbWorkflowRepository {
    pool: DatabasePool,
}

impl DbWorkflowRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowRepository for DbWorkflowRepository {
    async fn claim(
        &self,
        key: &WorkflowKey,
        token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflows (list_id, email, kind, token, expires_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (list_id, email, kind) DO UPDATE
                SET token = EXCLUDED.token,
                    expires_at = EXCLUDED.expires_at,
                    updated_at = EXCLUDED.updated_at
                WHERE workflows.expires_at <= $6
            "#,
        )
        .bind(&key.list_id)
        .bind(&key.email)
        .bind(&key.kind)
        .bind(token)
        .bind(expires_at)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn find(&self, key: &WorkflowKey, now: DateTime<Utc>) -> Result<Option<WorkflowClaim>> {
        sqlx::query_as::<_, WorkflowClaim>(
            r#"
            SELECT * FROM workflows
            WHERE list_id = $1 AND email = $2 AND kind = $3 AND expires_at > $4
            "#,
        )
        .bind(&key.list_id)
        .bind(&key.email)
        .bind(&key.kind)
        .bind(now)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn reassign(
        &self,
        key: &WorkflowKey,
        old_token: &str,
        new_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflows SET token = $5, expires_at = $6, updated_at = $7
            WHERE list_id = $1 AND email = $2 AND kind = $3 AND token = $4
            "#,
        )
        .bind(&key.list_id)
        .bind(&key.email)
        .bind(&key.kind)
        .bind(old_token)
        .bind(new_token)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, key: &WorkflowKey, token: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM workflows WHERE list_id = $1 AND email = $2 AND kind = $3 AND token = $4",
        )
        .bind(&key.list_id)
        .bind(&key.email)
        .bind(&key.kind)
        .bind(token)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM workflows WHERE expires_at <= $1")
            .bind(now)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
