//! Postgres pool for the list engine tables

use listrust_common::config::DatabaseConfig;
use listrust_common::{Error, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Tables every repository expects after migration
const ENGINE_TABLES: &[&str] = &[
    "mailing_lists",
    "addresses",
    "members",
    "pended",
    "held_requests",
    "workflows",
    "jobs",
];

#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = Self::connect_options(config)?;

        info!(
            max_connections = config.max_connections,
            acquire_timeout_secs = config.acquire_timeout_secs,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_with(options)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect: {}", e)))?;

        info!("Database connection established");
        Ok(Self { pool })
    }

    fn url(config: &DatabaseConfig) -> Result<&str> {
        if config.backend != "postgres" {
            return Err(Error::Config(format!(
                "Backend {} has no connection pool",
                config.backend
            )));
        }
        config
            .url
            .as_deref()
            .ok_or_else(|| Error::Config("database.url is required for postgres".to_string()))
    }

    /// Connections are tagged so runners show up in `pg_stat_activity`
    fn connect_options(config: &DatabaseConfig) -> Result<PgConnectOptions> {
        let options = PgConnectOptions::from_str(Self::url(config)?)
            .map_err(|e| Error::Config(format!("Invalid database.url: {}", e)))?;
        Ok(options.application_name("listrust"))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Migration failed: {}", e)))?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Fail unless the server answers and every engine table exists
    pub async fn health_check(&self) -> Result<()> {
        let mut missing = Vec::new();
        for table in ENGINE_TABLES {
            let present: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
                .bind(*table)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Error::Database(format!("Health check failed: {}", e)))?;
            if !present {
                missing.push(*table);
            }
        }

        if !missing.is_empty() {
            warn!(?missing, "Schema is incomplete");
            return Err(Error::Database(format!(
                "Missing tables: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }
}
