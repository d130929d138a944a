//! Schema creation and pre-v1 version management.
//!
//! Pre-v1 has no data to preserve, so on version mismatch we simply drop
//! all known tables and let `init_schema` recreate them.

use sqlx::SqlitePool;
use tracing::warn;

use crate::error::Result;

/// Current schema version. Increment when schema changes.
pub const SCHEMA_VERSION: i64 = 1;

/// Known tables that will be dropped on schema mismatch.
///
/// Order matters: tables that reference others come first.
const KNOWN_TABLES: &[&str] = &[
    "schedule_events",
    "run_artifacts",
    "global_lock",
    "run_jobs",
    "run_schedules",
    "tenants",
    "scheduler_heartbeat",
    "portal_settings",
    // Meta table last, so the version check fails if others exist without it
    "ts_meta",
];

/// Ensure the database schema version matches the expected version.
///
/// Returns `true` if a reset occurred.
pub async fn ensure_schema_version(pool: &SqlitePool, expected: i64) -> Result<bool> {
    match current_version(pool).await? {
        Some(v) if v == expected => Ok(false),
        Some(v) => {
            warn!("database schema reset (dev mode): version {v} -> {expected}");
            reset_schema(pool, expected).await?;
            Ok(true)
        }
        None => {
            if has_any_known_tables(pool).await? {
                warn!("database schema reset (dev mode): unversioned -> {expected}");
                reset_schema(pool, expected).await?;
            } else {
                create_meta_table(pool, expected).await?;
            }
            Ok(false)
        }
    }
}

async fn current_version(pool: &SqlitePool) -> Result<Option<i64>> {
    let meta_exists: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'ts_meta'",
    )
    .fetch_optional(pool)
    .await?;
    if meta_exists.is_none() {
        return Ok(None);
    }
    let version: Option<i64> =
        sqlx::query_scalar("SELECT schema_version FROM ts_meta WHERE key = 'schema'")
            .fetch_optional(pool)
            .await?;
    Ok(version)
}

async fn has_any_known_tables(pool: &SqlitePool) -> Result<bool> {
    for table in KNOWN_TABLES {
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_optional(pool)
        .await?;
        if exists.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn reset_schema(pool: &SqlitePool, version: i64) -> Result<()> {
    for table in KNOWN_TABLES {
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(pool)
            .await?;
    }
    create_meta_table(pool, version).await
}

async fn create_meta_table(pool: &SqlitePool, version: i64) -> Result<()> {
    sqlx::query("CREATE TABLE IF NOT EXISTS ts_meta (key TEXT PRIMARY KEY, schema_version INTEGER NOT NULL)")
        .execute(pool)
        .await?;
    sqlx::query("INSERT OR REPLACE INTO ts_meta (key, schema_version) VALUES ('schema', ?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Create all tables and indexes. Idempotent.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS tenants (
            tenant_key TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            config TEXT NOT NULL DEFAULT '{}',
            checksum TEXT NOT NULL DEFAULT '',
            config_version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS run_jobs (
            id TEXT PRIMARY KEY,
            scope TEXT NOT NULL,
            tenant_key TEXT,
            target_date TEXT,
            from_date TEXT,
            to_date TEXT,
            skip_download INTEGER NOT NULL DEFAULT 0,
            parallel INTEGER NOT NULL DEFAULT 1,
            stagger_seconds INTEGER NOT NULL DEFAULT 0,
            continue_on_failure INTEGER NOT NULL DEFAULT 0,
            command_display TEXT,
            status TEXT NOT NULL DEFAULT 'queued',
            pid INTEGER,
            exit_code INTEGER,
            log_file_path TEXT,
            failure_reason TEXT,
            requested_by TEXT,
            scheduled_by TEXT REFERENCES run_schedules (id) ON DELETE SET NULL,
            queued_at TEXT NOT NULL,
            dispatched_at TEXT,
            started_at TEXT,
            finished_at TEXT,
            created_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_run_jobs_status_created ON run_jobs (status, created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_run_jobs_tenant_created ON run_jobs (tenant_key, created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_run_jobs_sched_status ON run_jobs (scheduled_by, status, created_at DESC)",
        r#"
        CREATE TABLE IF NOT EXISTS run_schedules (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            scope TEXT NOT NULL DEFAULT 'all',
            tenant_key TEXT,
            cron_expr TEXT NOT NULL,
            timezone_name TEXT NOT NULL DEFAULT 'UTC',
            target_date_mode TEXT NOT NULL DEFAULT 'trading_date',
            parallel INTEGER NOT NULL DEFAULT 2,
            stagger_seconds INTEGER NOT NULL DEFAULT 2,
            continue_on_failure INTEGER NOT NULL DEFAULT 0,
            next_fire_at TEXT,
            last_fired_at TEXT,
            last_result TEXT,
            last_error TEXT,
            is_system_managed INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_run_schedules_enabled_next ON run_schedules (enabled, next_fire_at)",
        "CREATE INDEX IF NOT EXISTS idx_run_schedules_system_enabled ON run_schedules (is_system_managed, enabled)",
        r#"
        CREATE TABLE IF NOT EXISTS run_artifacts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_job TEXT REFERENCES run_jobs (id) ON DELETE SET NULL,
            tenant_key TEXT NOT NULL,
            target_date TEXT,
            processed_at TEXT,
            source_path TEXT NOT NULL DEFAULT '',
            source_hash TEXT NOT NULL DEFAULT '',
            reliability TEXT NOT NULL DEFAULT 'warning',
            rows_total INTEGER,
            rows_kept INTEGER,
            rows_non_target INTEGER,
            upload_stats TEXT NOT NULL DEFAULT '{}',
            reconcile_status TEXT NOT NULL DEFAULT '',
            reconcile_difference REAL,
            reconcile_epos_total REAL,
            reconcile_qbo_total REAL,
            reconcile_epos_count INTEGER,
            reconcile_qbo_count INTEGER,
            raw_file TEXT NOT NULL DEFAULT '',
            processed_files TEXT NOT NULL DEFAULT '[]',
            nearest_log_file TEXT NOT NULL DEFAULT '',
            imported_at TEXT NOT NULL
        )
        "#,
        "CREATE UNIQUE INDEX IF NOT EXISTS uniq_run_artifact_source ON run_artifacts (tenant_key, target_date, processed_at, source_hash)",
        "CREATE INDEX IF NOT EXISTS idx_run_artifacts_tenant_processed ON run_artifacts (tenant_key, processed_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_run_artifacts_tenant_target ON run_artifacts (tenant_key, target_date)",
        r#"
        CREATE TABLE IF NOT EXISTS global_lock (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            active INTEGER NOT NULL DEFAULT 0,
            holder TEXT NOT NULL DEFAULT '',
            owner_job TEXT REFERENCES run_jobs (id) ON DELETE SET NULL,
            acquired_at TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS schedule_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            schedule_id TEXT REFERENCES run_schedules (id) ON DELETE SET NULL,
            run_job TEXT REFERENCES run_jobs (id) ON DELETE SET NULL,
            event_type TEXT NOT NULL,
            message TEXT NOT NULL DEFAULT '',
            payload TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_schedule_events_type_created ON schedule_events (event_type, created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_schedule_events_sched_created ON schedule_events (schedule_id, created_at DESC)",
        r#"
        CREATE TABLE IF NOT EXISTS scheduler_heartbeat (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_seen TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS portal_settings (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            default_parallel INTEGER,
            default_stagger_seconds INTEGER,
            stale_hours_warning INTEGER,
            refresh_expiring_days INTEGER,
            reconcile_diff_warning REAL,
            reauth_guidance TEXT,
            dashboard_timezone TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::connect_in_memory;

    #[tokio::test]
    async fn init_is_idempotent() {
        let pool = connect_in_memory().await.unwrap();
        assert!(!ensure_schema_version(&pool, SCHEMA_VERSION).await.unwrap());
        init_schema(&pool).await.unwrap();
        assert!(!ensure_schema_version(&pool, SCHEMA_VERSION).await.unwrap());
        init_schema(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn version_mismatch_resets() {
        let pool = connect_in_memory().await.unwrap();
        ensure_schema_version(&pool, 0).await.unwrap();
        init_schema(&pool).await.unwrap();
        sqlx::query("INSERT INTO scheduler_heartbeat (id, last_seen) VALUES (1, '2026-01-01T00:00:00Z')")
            .execute(&pool)
            .await
            .unwrap();

        assert!(ensure_schema_version(&pool, SCHEMA_VERSION).await.unwrap());
        init_schema(&pool).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scheduler_heartbeat")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
