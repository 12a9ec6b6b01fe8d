//! Job queue repository

use crate::db::DatabasePool;
use crate::models::{job_status, Job, QueueStats, Slice, BAD_QUEUE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listrust_common::{Error, Result};
use uuid::Uuid;

/// Job queue repository trait
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn enqueue(&self, input: CreateJob) -> Result<Job>;
    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// Mark up to `limit` due jobs of `queue` in `slice` as processing and
    /// return them oldest first. A job is handed to at most one caller.
    async fn claim(
        &self,
        queue: &str,
        limit: i64,
        slice: Slice,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>>;

    /// Delete a processed job
    async fn complete(&self, id: Uuid) -> Result<()>;

    /// Put a job back to pending with a new attempt count and due time
    async fn retry(
        &self,
        id: Uuid,
        attempts: i32,
        error: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Return a claimed but unstarted job to pending, unchanged
    async fn release(&self, id: Uuid) -> Result<()>;

    /// Move a job to the error queue
    async fn fail(&self, id: Uuid, error: &str) -> Result<()>;

    /// Move a job out of the error queue back to where it came from
    async fn requeue(&self, id: Uuid) -> Result<bool>;

    /// Return jobs stuck in processing since before `started_before` to pending
    async fn recover_stale(&self, started_before: DateTime<Utc>) -> Result<u64>;

    async fn list(&self, queue: &str) -> Result<Vec<Job>>;
    async fn stats(&self, queue: &str) -> Result<QueueStats>;
}

/// Enqueue input
#[derive(Debug, Clone)]
pub struct CreateJob {
    pub queue: String,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
    pub shard: i32,
}

/// Database job queue repository
pub struct DbJobRepository {
    pool: DatabasePool,
}

impl DbJobRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for DbJobRepository {
    async fn enqueue(&self, input: CreateJob) -> Result<Job> {
        let now = Utc::now();

        sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (
                id, queue, payload, status, attempts, max_attempts, shard,
                scheduled_at, created_at
            )
            VALUES ($1, $2, $3, $4, 0, $5, $6, $7, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&input.queue)
        .bind(&input.payload)
        .bind(job_status::PENDING)
        .bind(input.max_attempts)
        .bind(input.shard)
        .bind(now)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn claim(
        &self,
        queue: &str,
        limit: i64,
        slice: Slice,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        let mut jobs = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs SET status = 'processing', started_at = $4
            WHERE id IN (
                SELECT id FROM jobs
                WHERE queue = $1
                  AND status = 'pending'
                  AND scheduled_at <= $4
                  AND ($3 <= 1 OR MOD(shard, $3) = $2)
                ORDER BY scheduled_at ASC, created_at ASC
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(slice.index as i32)
        .bind(slice.count as i32)
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        jobs.sort_by_key(|job| (job.scheduled_at, job.created_at));
        Ok(jobs)
    }

    async fn complete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn retry(
        &self,
        id: Uuid,
        attempts: i32,
        error: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', attempts = $2, last_error = $3,
                scheduled_at = $4, started_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(error)
        .bind(scheduled_at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn release(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'pending', started_at = NULL WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET origin_queue = queue, queue = $2, status = 'failed', last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(BAD_QUEUE)
        .bind(error)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn requeue(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET queue = origin_queue, origin_queue = NULL, status = 'pending',
                attempts = 0, started_at = NULL, scheduled_at = $2
            WHERE id = $1 AND status = 'failed' AND origin_queue IS NOT NULL
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn recover_stale(&self, started_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = 'pending', started_at = NULL
            WHERE status = 'processing' AND started_at < $1
            "#,
        )
        .bind(started_before)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn list(&self, queue: &str) -> Result<Vec<Job>> {
        sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE queue = $1 ORDER BY scheduled_at ASC, created_at ASC",
        )
        .bind(queue)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let pool = self.pool.pool();

        let pending: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs WHERE status = 'pending' AND queue = $1",
        )
        .bind(queue)
        .fetch_one(pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let processing: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs WHERE status = 'processing' AND queue = $1",
        )
        .bind(queue)
        .fetch_one(pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let failed: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs WHERE status = 'failed' AND origin_queue = $1",
        )
        .bind(queue)
        .fetch_one(pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(QueueStats {
            pending: pending.0 as u64,
            processing: processing.0 as u64,
            failed: failed.0 as u64,
        })
    }
}
