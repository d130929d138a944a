//! Durable, transactional state for the TillSync orchestration core.
//!
//! One SQLite database owns every entity the orchestrator coordinates
//! through: tenants, run jobs, schedules, ingested artifacts, the global run
//! lock row, the schedule event log, and the singleton heartbeat/settings
//! rows. All cross-task coordination goes through this store; nothing is
//! shared in process memory.
//!
//! Mutations that must be atomic (dispatch claims, schedule firing,
//! artifact upserts) run inside explicit transactions with compare-and-set
//! updates, which on SQLite gives the same row-serialization guarantees a
//! `SELECT ... FOR UPDATE` would on a server database.

pub mod artifacts;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod jobs;
pub mod lock;
pub mod models;
pub mod pool;
pub mod schedules;
pub mod schema;
pub mod settings;
pub mod tenants;

use std::sync::Mutex;

use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::Result;
use crate::settings::SettingsCacheState;

pub use crate::error::StoreError;
pub use crate::models::*;

/// Handle to the orchestration database.
pub struct Store {
    pool: SqlitePool,
    settings_cache: Mutex<SettingsCacheState>,
}

impl Store {
    /// Open (and create if needed) the database at `url`.
    pub async fn open(url: &str) -> Result<Self> {
        let pool = pool::connect(url).await?;
        Ok(Self::from_pool(pool))
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        let pool = pool::connect_in_memory().await?;
        Ok(Self::from_pool(pool))
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            settings_cache: Mutex::new(SettingsCacheState::default()),
        }
    }

    /// Create or reset the schema as needed. Must be called once on startup.
    pub async fn init(&self) -> Result<()> {
        schema::ensure_schema_version(&self.pool, schema::SCHEMA_VERSION).await?;
        schema::init_schema(&self.pool).await?;
        Ok(())
    }

    /// Begin an explicit transaction for multi-statement critical sections.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
