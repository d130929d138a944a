//! The global run lock row.
//!
//! Row 1 of `global_lock` is the queryable half of the dual-layer process
//! lock: it records who holds the single run slot and for which job, so the
//! UI can display it and restarts can reason about it. The filesystem
//! advisory lock (orchestrator side) provides the crash-safe half.

use chrono::Utc;
use sqlx::SqliteConnection;

use crate::error::{Result, StoreError};
use crate::models::GlobalLock;
use crate::Store;

impl Store {
    /// Current lock row, creating the singleton if missing.
    pub async fn get_lock(&self) -> Result<GlobalLock> {
        let mut tx = self.begin().await?;
        ensure_lock_row(&mut tx).await?;
        let lock = sqlx::query_as::<_, GlobalLock>(
            "SELECT active, holder, owner_job, acquired_at, updated_at FROM global_lock WHERE id = 1",
        )
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(lock)
    }

    /// Claim the lock row for `holder`. An active lock whose owner job has
    /// reached a terminal state (or was deleted) is garbage-collected and
    /// taken over.
    pub async fn acquire_lock_row(
        &self,
        holder: &str,
        owner_job: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        self.acquire_lock_row_tx(&mut tx, holder, owner_job).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Transactional claim used by the dispatcher so the lock check and the
    /// queued-job pick commit together.
    pub async fn acquire_lock_row_tx(
        &self,
        conn: &mut SqliteConnection,
        holder: &str,
        owner_job: Option<&str>,
    ) -> Result<()> {
        ensure_lock_row(conn).await?;
        let current = sqlx::query_as::<_, LockOwnerView>(
            r#"
            SELECT l.active, l.holder, l.owner_job,
                   (SELECT j.status FROM run_jobs j WHERE j.id = l.owner_job) AS owner_status
            FROM global_lock l WHERE l.id = 1
            "#,
        )
        .fetch_one(&mut *conn)
        .await?;

        let mut active = current.active;
        if active && current.owner_job.is_some() {
            let owner_active = matches!(
                current.owner_status.as_deref(),
                Some("queued") | Some("running")
            );
            if !owner_active {
                clear_lock_row(conn).await?;
                active = false;
            }
        }
        if active {
            let holder = if current.holder.is_empty() {
                "unknown".to_string()
            } else {
                current.holder
            };
            return Err(StoreError::LockBusy { holder });
        }

        sqlx::query(
            "UPDATE global_lock SET active = 1, holder = ?, owner_job = ?, acquired_at = ?, updated_at = ? WHERE id = 1",
        )
        .bind(holder)
        .bind(owner_job)
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Point the already-claimed lock row at a specific job. The dispatcher
    /// claims the row before it knows which job it will run, then fills in
    /// the owner in the same transaction.
    pub async fn set_lock_owner_tx(
        &self,
        conn: &mut SqliteConnection,
        holder: &str,
        owner_job: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE global_lock SET holder = ?, owner_job = ?, updated_at = ? WHERE id = 1 AND active = 1",
        )
        .bind(holder)
        .bind(owner_job)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Release the lock row. With `force` the owner check is skipped; without
    /// it, the row is only cleared when `owner_job` matches the recorded
    /// owner (or no owner was recorded). Releasing an inactive lock is a
    /// no-op.
    pub async fn release_lock_row(&self, owner_job: Option<&str>, force: bool) -> Result<()> {
        let mut tx = self.begin().await?;
        ensure_lock_row(&mut tx).await?;
        let current = sqlx::query_as::<_, LockOwnerView>(
            "SELECT active, holder, owner_job, NULL AS owner_status FROM global_lock WHERE id = 1",
        )
        .fetch_one(&mut *tx)
        .await?;
        if current.active {
            let matches_owner = match (owner_job, current.owner_job.as_deref()) {
                (None, _) => true,
                (Some(a), Some(b)) => a == b,
                (Some(_), None) => false,
            };
            if force || matches_owner {
                clear_lock_row(&mut tx).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct LockOwnerView {
    active: bool,
    holder: String,
    owner_job: Option<String>,
    owner_status: Option<String>,
}

async fn ensure_lock_row(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO global_lock (id, active, holder, updated_at) VALUES (1, 0, '', ?)",
    )
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn clear_lock_row(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(
        "UPDATE global_lock SET active = 0, holder = '', owner_job = NULL, acquired_at = NULL, updated_at = ? WHERE id = 1",
    )
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobPatch, JobStatus, NewJob};

    async fn store() -> Store {
        let store = Store::in_memory().await.unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let store = store().await;
        store.acquire_lock_row("orchestrator:test", None).await.unwrap();
        let lock = store.get_lock().await.unwrap();
        assert!(lock.active);
        assert_eq!(lock.holder, "orchestrator:test");

        let err = store.acquire_lock_row("other", None).await.unwrap_err();
        assert!(matches!(err, StoreError::LockBusy { .. }));

        store.release_lock_row(None, false).await.unwrap();
        assert!(!store.get_lock().await.unwrap().active);
        // Idempotent.
        store.release_lock_row(None, true).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_owner_is_garbage_collected() {
        let store = store().await;
        let job = store.insert_job(NewJob::single("acme")).await.unwrap();
        store
            .acquire_lock_row("orchestrator:first", Some(&job.id))
            .await
            .unwrap();

        store
            .transition_job(&job.id, JobStatus::Queued, JobStatus::Cancelled, JobPatch::default())
            .await
            .unwrap();

        // Lock owner reached a terminal state: the next acquirer takes over.
        store
            .acquire_lock_row("orchestrator:second", None)
            .await
            .unwrap();
        let lock = store.get_lock().await.unwrap();
        assert!(lock.active);
        assert_eq!(lock.holder, "orchestrator:second");
    }

    #[tokio::test]
    async fn live_owner_blocks_acquisition() {
        let store = store().await;
        let job = store.insert_job(NewJob::single("acme")).await.unwrap();
        store
            .acquire_lock_row("orchestrator:first", Some(&job.id))
            .await
            .unwrap();
        assert!(store.acquire_lock_row("second", None).await.is_err());
    }

    #[tokio::test]
    async fn release_respects_owner_unless_forced() {
        let store = store().await;
        let job_a = store.insert_job(NewJob::single("tenant-a")).await.unwrap();
        store
            .acquire_lock_row("orchestrator:a", Some(&job_a.id))
            .await
            .unwrap();

        // A different job cannot release without force.
        store.release_lock_row(Some("some-other-id"), false).await.unwrap();
        assert!(store.get_lock().await.unwrap().active);

        store.release_lock_row(Some("some-other-id"), true).await.unwrap();
        assert!(!store.get_lock().await.unwrap().active);
    }

    #[tokio::test]
    async fn lock_owner_coherence() {
        // Whenever the row is active its owner job is queued or running:
        // acquiring GCs terminal owners before anyone observes them.
        let store = store().await;
        let job = store.insert_job(NewJob::single("acme")).await.unwrap();
        store
            .acquire_lock_row("orchestrator:a", Some(&job.id))
            .await
            .unwrap();
        let lock = store.get_lock().await.unwrap();
        let owner = store
            .get_job(lock.owner_job.as_deref().unwrap_or_default())
            .await
            .unwrap()
            .unwrap();
        assert!(owner.status.is_active());
    }
}
