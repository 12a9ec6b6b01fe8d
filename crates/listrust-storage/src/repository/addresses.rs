//! Address repository

use crate::db::DatabasePool;
use crate::models::Address;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listrust_common::{Error, Result};

/// Address repository trait
#[async_trait]
pub trait AddressRepository: Send + Sync {
    /// Look up by canonical email
    async fn get(&self, email: &str) -> Result<Option<Address>>;
    /// Insert if absent and return the stored row either way
    async fn get_or_create(&self, input: CreateAddress) -> Result<Address>;
    async fn set_verified(&self, email: &str, verified_on: DateTime<Utc>) -> Result<()>;
}

/// Create address input
#[derive(Debug, Clone)]
pub struct CreateAddress {
    pub email: String,
    pub original_email: String,
    pub display_name: Option<String>,
}

/// Database address repository
pub struct DbAddressRepository {
    pool: DatabasePool,
}

impl DbAddressRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AddressRepository for DbAddressRepository {
    async fn get(&self, email: &str) -> Result<Option<Address>> {
        sqlx::query_as::<_, Address>("SELECT * FROM addresses WHERE email = $1")
            .bind(email)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get_or_create(&self, input: CreateAddress) -> Result<Address> {
        sqlx::query(
            r#"
            INSERT INTO addresses (email, original_email, display_name, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(&input.email)
        .bind(&input.original_email)
        .bind(&input.display_name)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        self.get(&input.email)
            .await?
            .ok_or_else(|| Error::Internal("Failed to create address".to_string()))
    }

    async fn set_verified(&self, email: &str, verified_on: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE addresses SET verified_on = $2 WHERE email = $1")
            .bind(email)
            .bind(verified_on)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}
