//! Job queue - durable switchboards and the work items they carry

use crate::message::{Message, MessageData};
use crate::notify::Notification;
use crate::workflow::Decision;
use chrono::{DateTime, Duration, Utc};
use listrust_common::{Error, Result};
use listrust_storage::{CreateJob, Job, JobRepository, QueueStats, Slice};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Inbound posts, evaluated by the list's posting chain
pub const IN: &str = "in";
/// Accepted posts, run through the list's posting pipeline
pub const PIPELINE: &str = "pipeline";
/// Workflow continuations
pub const COMMAND: &str = "command";
/// Notification requests, consumed by the external templating component
pub const VIRGIN: &str = "virgin";
/// Messages ready for the external delivery agent
pub const OUT: &str = "out";
/// Items that exhausted their attempts
pub use listrust_storage::BAD_QUEUE as BAD;

/// The unit of work a runner processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItem {
    Message {
        list_id: String,
        msg: Message,
        msgdata: MessageData,
    },
    Continuation {
        token: String,
        decision: Decision,
    },
    Notification(Notification),
}

impl WorkItem {
    /// Key that decides which runner slice owns the item
    pub fn shard_key(&self) -> String {
        match self {
            WorkItem::Message { list_id, msg, .. } => format!("{}:{}", list_id, msg.key()),
            WorkItem::Continuation { token, .. } => token.clone(),
            WorkItem::Notification(n) => format!("{}:{}", n.list_id, n.recipient),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::Message { .. } => "message",
            WorkItem::Continuation { .. } => "continuation",
            WorkItem::Notification(_) => "notification",
        }
    }
}

/// Deterministic, non-negative shard number for a key
pub fn shard_of(key: &str) -> i32 {
    let digest = Sha256::digest(key.as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (n >> 1) as i32
}

/// Retry delay after `attempts` failures: `base * 2^attempts`, capped
pub fn calculate_backoff(attempts: i32, base_secs: u64, max_secs: u64) -> Duration {
    let factor = 2u64.saturating_pow(attempts.max(0) as u32);
    let secs = base_secs.saturating_mul(factor).min(max_secs);
    Duration::seconds(secs as i64)
}

/// Typed front end to the job repository
#[derive(Clone)]
pub struct JobQueue {
    repo: Arc<dyn JobRepository>,
    max_attempts: i32,
}

impl JobQueue {
    pub fn new(repo: Arc<dyn JobRepository>, max_attempts: i32) -> Self {
        Self { repo, max_attempts }
    }

    /// Append an item to `queue`
    pub async fn enqueue(&self, queue: &str, item: &WorkItem) -> Result<Uuid> {
        let payload = serde_json::to_value(item)
            .map_err(|e| Error::Queue(format!("Failed to encode work item: {}", e)))?;

        let job = self
            .repo
            .enqueue(CreateJob {
                queue: queue.to_string(),
                payload,
                max_attempts: self.max_attempts,
                shard: shard_of(&item.shard_key()),
            })
            .await?;

        debug!(queue = %queue, job_id = %job.id, kind = item.kind(), "Enqueued work item");
        Ok(job.id)
    }

    /// Decode a job's payload
    pub fn decode(job: &Job) -> Result<WorkItem> {
        serde_json::from_value(job.payload.clone())
            .map_err(|e| Error::Queue(format!("Undecodable job {}: {}", job.id, e)))
    }

    pub async fn claim(
        &self,
        queue: &str,
        limit: i64,
        slice: Slice,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        self.repo.claim(queue, limit, slice, now).await
    }

    pub async fn complete(&self, id: Uuid) -> Result<()> {
        self.repo.complete(id).await
    }

    pub async fn retry(
        &self,
        id: Uuid,
        attempts: i32,
        error: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<()> {
        self.repo.retry(id, attempts, error, scheduled_at).await
    }

    pub async fn release(&self, id: Uuid) -> Result<()> {
        self.repo.release(id).await
    }

    pub async fn fail(&self, id: Uuid, error: &str) -> Result<()> {
        self.repo.fail(id, error).await
    }

    /// Operator replay of an item from the error queue
    pub async fn requeue(&self, id: Uuid) -> Result<bool> {
        let requeued = self.repo.requeue(id).await?;
        if requeued {
            info!(job_id = %id, "Requeued job from the error queue");
        }
        Ok(requeued)
    }

    pub async fn recover_stale(&self, started_before: DateTime<Utc>) -> Result<u64> {
        let recovered = self.repo.recover_stale(started_before).await?;
        if recovered > 0 {
            info!(recovered, "Returned stale in-flight jobs to their queues");
        }
        Ok(recovered)
    }

    /// Decoded items currently in `queue`
    pub async fn items(&self, queue: &str) -> Result<Vec<WorkItem>> {
        self.repo.list(queue).await?.iter().map(Self::decode).collect()
    }

    pub async fn jobs(&self, queue: &str) -> Result<Vec<Job>> {
        self.repo.list(queue).await
    }

    pub async fn stats(&self, queue: &str) -> Result<QueueStats> {
        self.repo.stats(queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use listrust_storage::memory::MemoryJobRepository;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_calculate_backoff() {
        assert_eq!(calculate_backoff(0, 60, 14400), Duration::minutes(1));
        assert_eq!(calculate_backoff(1, 60, 14400), Duration::minutes(2));
        assert_eq!(calculate_backoff(2, 60, 14400), Duration::minutes(4));
        assert_eq!(calculate_backoff(10, 60, 14400), Duration::hours(4));
        assert_eq!(calculate_backoff(100, 60, 14400), Duration::hours(4));
    }

    #[test]
    fn test_shard_is_deterministic() {
        assert_eq!(shard_of("test@example.com:a"), shard_of("test@example.com:a"));
        assert!(shard_of("anything") >= 0);
    }

    #[tokio::test]
    async fn test_enqueue_and_decode() {
        let queue = JobQueue::new(Arc::new(MemoryJobRepository::new()), 5);
        let item = WorkItem::Continuation {
            token: "abc".to_string(),
            decision: Decision::Confirm,
        };
        queue.enqueue(COMMAND, &item).await.unwrap();

        assert_eq!(queue.items(COMMAND).await.unwrap(), vec![item]);
        assert_eq!(queue.stats(COMMAND).await.unwrap().pending, 1);
    }

    #[test]
    fn test_undecodable_payload_is_a_queue_error() {
        let job = Job {
            id: Uuid::now_v7(),
            queue: IN.to_string(),
            payload: serde_json::json!({"kind": "telegram"}),
            status: "pending".to_string(),
            attempts: 0,
            max_attempts: 5,
            shard: 0,
            origin_queue: None,
            last_error: None,
            scheduled_at: Utc::now(),
            started_at: None,
            created_at: Utc::now(),
        };
        assert!(matches!(JobQueue::decode(&job), Err(Error::Queue(_))));
    }
}
