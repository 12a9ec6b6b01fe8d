//! ListRust Storage - Database abstraction
//!
//! Repository traits with PostgreSQL implementations and in-memory
//! equivalents for the `memory` backend and tests.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use models::*;
pub use repository::*;

use listrust_common::config::DatabaseConfig;
use listrust_common::{Error, Result};
use std::sync::Arc;
use tracing::info;

/// One handle per repository, shared by every component
#[derive(Clone)]
pub struct Repositories {
    pub pendings: Arc<dyn PendingRepository>,
    pub requests: Arc<dyn RequestRepository>,
    pub addresses: Arc<dyn AddressRepository>,
    pub members: Arc<dyn MemberRepository>,
    pub lists: Arc<dyn ListRepository>,
    pub workflows: Arc<dyn WorkflowRepository>,
    pub jobs: Arc<dyn JobRepository>,
}

impl Repositories {
    /// Database-backed repositories sharing one pool
    pub fn postgres(pool: DatabasePool) -> Self {
        Self {
            pendings: Arc::new(DbPendingRepository::new(pool.clone())),
            requests: Arc::new(DbRequestRepository::new(pool.clone())),
            addresses: Arc::new(DbAddressRepository::new(pool.clone())),
            members: Arc::new(DbMemberRepository::new(pool.clone())),
            lists: Arc::new(DbListRepository::new(pool.clone())),
            workflows: Arc::new(DbWorkflowRepository::new(pool.clone())),
            jobs: Arc::new(DbJobRepository::new(pool)),
        }
    }

    /// Fresh, empty in-memory repositories
    pub fn memory() -> Self {
        Self {
            pendings: Arc::new(memory::MemoryPendingRepository::new()),
            requests: Arc::new(memory::MemoryRequestRepository::new()),
            addresses: Arc::new(memory::MemoryAddressRepository::new()),
            members: Arc::new(memory::MemoryMemberRepository::new()),
            lists: Arc::new(memory::MemoryListRepository::new()),
            workflows: Arc::new(memory::MemoryWorkflowRepository::new()),
            jobs: Arc::new(memory::MemoryJobRepository::new()),
        }
    }

    /// Open the configured backend, running migrations for PostgreSQL
    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        match config.backend.as_str() {
            "postgres" => {
                let pool = DatabasePool::new(config).await?;
                pool.migrate().await?;
                pool.health_check().await?;
                Ok(Self::postgres(pool))
            }
            "memory" => {
                info!("Using in-memory storage; state is lost on exit");
                Ok(Self::memory())
            }
            other => Err(Error::Config(format!(
                "Unsupported database backend: {}",
                other
            ))),
        }
    }
}
