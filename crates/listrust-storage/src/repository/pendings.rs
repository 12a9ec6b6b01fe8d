//! Pending record repository

use crate::db::DatabasePool;
use crate::models::PendedRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listrust_common::{Error, Result};

/// Pending record repository trait
#[async_trait]
pub trait PendingRepository: Send + Sync {
    /// Store a record. Returns `false` if the token is already taken.
    async fn insert(
        &self,
        token: &str,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Read a live record without consuming it
    async fn get(&self, token: &str, now: DateTime<Utc>) -> Result<Option<PendedRecord>>;

    /// Atomically remove and return a live record
    async fn take(&self, token: &str, now: DateTime<Utc>) -> Result<Option<PendedRecord>>;

    /// Drop every record whose expiry is at or before `now`
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Number of stored records, expired or not
    async fn count(&self) -> Result<u64>;
}

/// Database pending record repository
pub struct DbPendingRepository {
    pool: DatabasePool,
}

impl DbPendingRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PendingRepository for DbPendingRepository {
    async fn insert(
        &self,
        token: &str,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO pended (token, payload, created_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (token) DO NOTHING
            "#,
        )
        .bind(token)
        .bind(&payload)
        .bind(created_at)
        .bind(expires_at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, token: &str, now: DateTime<Utc>) -> Result<Option<PendedRecord>> {
        sqlx::query_as::<_, PendedRecord>(
            "SELECT * FROM pended WHERE token = $1 AND expires_at > $2",
        )
        .bind(token)
        .bind(now)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn take(&self, token: &str, now: DateTime<Utc>) -> Result<Option<PendedRecord>> {
        // A single DELETE .. RETURNING: of two concurrent callers only one gets the row
        sqlx::query_as::<_, PendedRecord>(
            "DELETE FROM pended WHERE token = $1 AND expires_at > $2 RETURNING *",
        )
        .bind(token)
        .bind(now)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM pended WHERE expires_at <= $1")
            .bind(now)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pended")
            .fetch_one(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(count as u64)
    }
}
