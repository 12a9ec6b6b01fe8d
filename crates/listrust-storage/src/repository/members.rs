//! Membership repository

use crate::db::DatabasePool;
use crate::models::Member;
use async_trait::async_trait;
use listrust_common::types::{DeliveryMode, MemberRole};
use listrust_common::{Error, Result};
use uuid::Uuid;

/// Membership repository trait
#[async_trait]
pub trait MemberRepository: Send + Sync {
    /// Add a membership. Fails with `AlreadySubscribed` if the address
    /// already holds this role on the list.
    async fn add(&self, input: CreateMember) -> Result<Member>;
    async fn get(&self, list_id: &str, email: &str, role: MemberRole) -> Result<Option<Member>>;
    async fn list(&self, list_id: &str, role: Option<MemberRole>) -> Result<Vec<Member>>;
    /// Returns whether a row was removed
    async fn delete(&self, list_id: &str, email: &str, role: MemberRole) -> Result<bool>;
    async fn delete_all(&self, list_id: &str) -> Result<u64>;
}

/// Create member input
#[derive(Debug, Clone)]
pub struct CreateMember {
    pub list_id: String,
    pub email: String,
    pub role: MemberRole,
    pub display_name: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub preferred_language: Option<String>,
}

/// Database membership repository
pub struct DbMemberRepository {
    pool: DatabasePool,
}

impl DbMemberRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MemberRepository for DbMemberRepository {
    async fn add(&self, input: CreateMember) -> Result<Member> {
        let inserted = sqlx::query_as::<_, Member>(
            r#"
            INSERT INTO members (
                id, list_id, email, role, display_name, delivery_mode,
                preferred_language, subscribed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (list_id, email, role) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&input.list_id)
        .bind(&input.email)
        .bind(input.role.as_str())
        .bind(&input.display_name)
        .bind(input.delivery_mode.as_str())
        .bind(&input.preferred_language)
        .bind(chrono::Utc::now())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        inserted.ok_or(Error::AlreadySubscribed {
            list_id: input.list_id,
            email: input.email,
        })
    }

    async fn get(&self, list_id: &str, email: &str, role: MemberRole) -> Result<Option<Member>> {
        sqlx::query_as::<_, Member>(
            "SELECT * FROM members WHERE list_id = $1 AND email = $2 AND role = $3",
        )
        .bind(list_id)
        .bind(email)
        .bind(role.as_str())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list(&self, list_id: &str, role: Option<MemberRole>) -> Result<Vec<Member>> {
        sqlx::query_as::<_, Member>(
            r#"
            SELECT * FROM members
            WHERE list_id = $1 AND ($2::TEXT IS NULL OR role = $2)
            ORDER BY subscribed_at ASC, email ASC
            "#,
        )
        .bind(list_id)
        .bind(role.map(|r| r.as_str()))
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn delete(&self, list_id: &str, email: &str, role: MemberRole) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM members WHERE list_id = $1 AND email = $2 AND role = $3")
                .bind(list_id)
                .bind(email)
                .bind(role.as_str())
                .execute(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_all(&self, list_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM members WHERE list_id = $1")
            .bind(list_id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
