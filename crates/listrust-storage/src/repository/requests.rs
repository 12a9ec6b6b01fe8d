//! Request ledger repository

use crate::db::DatabasePool;
use crate::models::HeldRequest;
use async_trait::async_trait;
use listrust_common::types::{RequestId, RequestType};
use listrust_common::{Error, Result};

/// Request ledger repository trait
#[async_trait]
pub trait RequestRepository: Send + Sync {
    async fn insert(&self, input: CreateRequest) -> Result<HeldRequest>;
    async fn get(&self, list_id: &str, id: RequestId) -> Result<Option<HeldRequest>>;
    /// Entries of a list in insertion order, optionally of one type only
    async fn list(
        &self,
        list_id: &str,
        request_type: Option<RequestType>,
    ) -> Result<Vec<HeldRequest>>;
    async fn count(&self, list_id: &str, request_type: Option<RequestType>) -> Result<u64>;
    /// Remove an entry, returning it if it was still there
    async fn delete(&self, list_id: &str, id: RequestId) -> Result<Option<HeldRequest>>;
}

/// Create ledger entry input
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub list_id: String,
    pub request_type: RequestType,
    pub key: String,
    pub data_token: Option<String>,
}

/// Database request ledger repository
pub struct DbRequestRepository {
    pool: DatabasePool,
}

impl DbRequestRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RequestRepository for DbRequestRepository {
    async fn insert(&self, input: CreateRequest) -> Result<HeldRequest> {
        sqlx::query_as::<_, HeldRequest>(
            r#"
            INSERT INTO held_requests (list_id, request_type, key, data_token, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(&input.list_id)
        .bind(input.request_type.as_str())
        .bind(&input.key)
        .bind(&input.data_token)
        .bind(chrono::Utc::now())
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, list_id: &str, id: RequestId) -> Result<Option<HeldRequest>> {
        sqlx::query_as::<_, HeldRequest>(
            "SELECT * FROM held_requests WHERE list_id = $1 AND id = $2",
        )
        .bind(list_id)
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list(
        &self,
        list_id: &str,
        request_type: Option<RequestType>,
    ) -> Result<Vec<HeldRequest>> {
        match request_type {
            Some(rt) => sqlx::query_as::<_, HeldRequest>(
                "SELECT * FROM held_requests WHERE list_id = $1 AND request_type = $2 ORDER BY id ASC",
            )
            .bind(list_id)
            .bind(rt.as_str())
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string())),
            None => sqlx::query_as::<_, HeldRequest>(
                "SELECT * FROM held_requests WHERE list_id = $1 ORDER BY id ASC",
            )
            .bind(list_id)
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string())),
        }
    }

    async fn count(&self, list_id: &str, request_type: Option<RequestType>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM held_requests
            WHERE list_id = $1 AND ($2::TEXT IS NULL OR request_type = $2)
            "#,
        )
        .bind(list_id)
        .bind(request_type.map(|rt| rt.as_str()))
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(count as u64)
    }

    async fn delete(&self, list_id: &str, id: RequestId) -> Result<Option<HeldRequest>> {
        sqlx::query_as::<_, HeldRequest>(
            "DELETE FROM held_requests WHERE list_id = $1 AND id = $2 RETURNING *",
        )
        .bind(list_id)
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
