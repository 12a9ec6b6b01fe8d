//! Mailing list repository

use crate::db::DatabasePool;
use crate::models::{ListSettings, MailingList};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listrust_common::{Error, Result};

/// Mailing list repository trait
#[async_trait]
pub trait ListRepository: Send + Sync {
    /// Fails with `ListAlreadyExists` if the posting address is taken
    async fn create(&self, list_id: &str, settings: ListSettings) -> Result<MailingList>;
    async fn get(&self, list_id: &str) -> Result<Option<MailingList>>;
    async fn list(&self) -> Result<Vec<MailingList>>;
    async fn update_settings(&self, list_id: &str, settings: ListSettings) -> Result<MailingList>;
    /// Bump the post counter and return the new value
    async fn record_post(&self, list_id: &str, at: DateTime<Utc>) -> Result<i64>;
    /// Returns whether the list existed
    async fn delete(&self, list_id: &str) -> Result<bool>;
}

/// Database mailing list repository
pub struct DbListRepository {
    pool: DatabasePool,
}

impl DbListRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ListRepository for DbListRepository {
    async fn create(&self, list_id: &str, settings: ListSettings) -> Result<MailingList> {
        let created = sqlx::query_as::<_, MailingList>(
            r#"
            INSERT INTO mailing_lists (
                list_id, display_name, subscription_policy, unsubscription_policy,
                posting_chain, posting_pipeline, send_welcome_message, send_goodbye_message,
                admin_notify_mchanges, ban_patterns, max_message_size_kb, max_num_recipients,
                default_delivery_mode, post_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 1, $14)
            ON CONFLICT (list_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(list_id)
        .bind(&settings.display_name)
        .bind(settings.subscription_policy.as_str())
        .bind(settings.unsubscription_policy.as_str())
        .bind(&settings.posting_chain)
        .bind(&settings.posting_pipeline)
        .bind(settings.send_welcome_message)
        .bind(settings.send_goodbye_message)
        .bind(settings.admin_notify_mchanges)
        .bind(serde_json::json!(settings.ban_patterns))
        .bind(settings.max_message_size_kb)
        .bind(settings.max_num_recipients)
        .bind(settings.default_delivery_mode.as_str())
        .bind(Utc::now())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        created.ok_or_else(|| Error::ListAlreadyExists(list_id.to_string()))
    }

    async fn get(&self, list_id: &str) -> Result<Option<MailingList>> {
        sqlx::query_as::<_, MailingList>("SELECT * FROM mailing_lists WHERE list_id = $1")
            .bind(list_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list(&self) -> Result<Vec<MailingList>> {
        sqlx::query_as::<_, MailingList>("SELECT * FROM mailing_lists ORDER BY list_id ASC")
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn update_settings(&self, list_id: &str, settings: ListSettings) -> Result<MailingList> {
        sqlx::query_as::<_, MailingList>(
            r#"
            UPDATE mailing_lists SET
                display_name = $2, subscription_policy = $3, unsubscription_policy = $4,
                posting_chain = $5, posting_pipeline = $6, send_welcome_message = $7,
                send_goodbye_message = $8, admin_notify_mchanges = $9, ban_patterns = $10,
                max_message_size_kb = $11, max_num_recipients = $12, default_delivery_mode = $13
            WHERE list_id = $1
            RETURNING *
            "#,
        )
        .bind(list_id)
        .bind(&settings.display_name)
        .bind(settings.subscription_policy.as_str())
        .bind(settings.unsubscription_policy.as_str())
        .bind(&settings.posting_chain)
        .bind(&settings.posting_pipeline)
        .bind(settings.send_welcome_message)
        .bind(settings.send_goodbye_message)
        .bind(settings.admin_notify_mchanges)
        .bind(serde_json::json!(settings.ban_patterns))
        .bind(settings.max_message_size_kb)
        .bind(settings.max_num_recipients)
        .bind(settings.default_delivery_mode.as_str())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?
        .ok_or_else(|| Error::NotFound(format!("list {}", list_id)))
    }

    async fn record_post(&self, list_id: &str, at: DateTime<Utc>) -> Result<i64> {
        let post_id: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE mailing_lists SET post_id = post_id + 1, last_post_time = $2
            WHERE list_id = $1
            RETURNING post_id
            "#,
        )
        .bind(list_id)
        .bind(at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        post_id.ok_or_else(|| Error::NotFound(format!("list {}", list_id)))
    }

    async fn delete(&self, list_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM mailing_lists WHERE list_id = $1")
            .bind(list_id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}
