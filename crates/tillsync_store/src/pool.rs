//! SQLite pool creation.
//!
//! Concrete `SqlitePool` rather than `AnyPool` so `#[derive(FromRow)]`
//! works with chrono types and custom enums.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::Result;

/// Default pool size. The orchestrator is a single process; a handful of
/// connections covers the scheduler loop, monitors, and tail handlers.
const MAX_CONNECTIONS: u32 = 5;

/// How long a writer waits on a locked database before erroring.
const BUSY_TIMEOUT_SECS: u64 = 5;

pub async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(BUSY_TIMEOUT_SECS));
    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await?;
    apply_sqlite_optimizations(&pool).await?;
    Ok(pool)
}

/// Shared in-memory database for tests. A single connection keeps every
/// query on the same memory database.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;
    Ok(pool)
}

async fn apply_sqlite_optimizations(pool: &SqlitePool) -> Result<()> {
    // WAL mode for better concurrent access
    sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;

    // NORMAL sync for better performance
    sqlx::query("PRAGMA synchronous=NORMAL")
        .execute(pool)
        .await?;

    Ok(())
}
