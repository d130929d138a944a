//! Run job persistence: insert, compare-and-set transitions, queue picks.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::models::{Job, JobPatch, JobStatus, NewJob};
use crate::Store;

impl Store {
    /// Insert a validated job with `status = queued`.
    pub async fn insert_job(&self, new: NewJob) -> Result<Job> {
        let new = new.normalized()?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO run_jobs (
                id, scope, tenant_key, target_date, from_date, to_date,
                skip_download, parallel, stagger_seconds, continue_on_failure,
                status, requested_by, scheduled_by, queued_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'queued', ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(new.scope)
        .bind(&new.tenant_key)
        .bind(new.target_date)
        .bind(new.from_date)
        .bind(new.to_date)
        .bind(new.skip_download)
        .bind(new.parallel)
        .bind(new.stagger_seconds)
        .bind(new.continue_on_failure)
        .bind(&new.requested_by)
        .bind(&new.scheduled_by)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;
        self.expect_job(&id).await
    }

    /// Transactional variant used when the job must be created atomically
    /// with other rows (schedule firing).
    pub async fn insert_job_tx(
        &self,
        conn: &mut SqliteConnection,
        new: NewJob,
    ) -> Result<Job> {
        let new = new.normalized()?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO run_jobs (
                id, scope, tenant_key, target_date, from_date, to_date,
                skip_download, parallel, stagger_seconds, continue_on_failure,
                status, requested_by, scheduled_by, queued_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'queued', ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(new.scope)
        .bind(&new.tenant_key)
        .bind(new.target_date)
        .bind(new.from_date)
        .bind(new.to_date)
        .bind(new.skip_download)
        .bind(new.parallel)
        .bind(new.stagger_seconds)
        .bind(new.continue_on_failure)
        .bind(&new.requested_by)
        .bind(&new.scheduled_by)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        let job = sqlx::query_as::<_, Job>("SELECT * FROM run_jobs WHERE id = ?")
            .bind(&id)
            .fetch_one(&mut *conn)
            .await?;
        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM run_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(job)
    }

    async fn expect_job(&self, id: &str) -> Result<Job> {
        self.get_job(id)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))
    }

    /// Compare-and-set status transition. Fails with [`StoreError::StatusChanged`]
    /// when the current status no longer matches `from`.
    pub async fn transition_job(
        &self,
        id: &str,
        from: JobStatus,
        to: JobStatus,
        patch: JobPatch,
    ) -> Result<Job> {
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition { from, to });
        }
        let rows_affected = sqlx::query(
            r#"
            UPDATE run_jobs
            SET status = ?,
                pid = COALESCE(?, pid),
                exit_code = COALESCE(?, exit_code),
                log_file_path = COALESCE(?, log_file_path),
                failure_reason = COALESCE(?, failure_reason),
                command_display = COALESCE(?, command_display),
                dispatched_at = COALESCE(?, dispatched_at),
                started_at = COALESCE(?, started_at),
                finished_at = COALESCE(?, finished_at)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to)
        .bind(patch.pid)
        .bind(patch.exit_code)
        .bind(&patch.log_file_path)
        .bind(&patch.failure_reason)
        .bind(&patch.command_display)
        .bind(patch.dispatched_at)
        .bind(patch.started_at)
        .bind(patch.finished_at)
        .bind(id)
        .bind(from)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let found = self.expect_job(id).await?;
            return Err(StoreError::StatusChanged {
                id: id.to_string(),
                expected: from,
                found: found.status,
            });
        }
        self.expect_job(id).await
    }

    /// Patch process bookkeeping fields without changing status. Used to
    /// record the exit code of a run that was cancelled externally.
    pub async fn update_job_runtime(&self, id: &str, patch: JobPatch) -> Result<Job> {
        sqlx::query(
            r#"
            UPDATE run_jobs
            SET pid = COALESCE(?, pid),
                exit_code = COALESCE(?, exit_code),
                log_file_path = COALESCE(?, log_file_path),
                failure_reason = COALESCE(?, failure_reason),
                command_display = COALESCE(?, command_display),
                dispatched_at = COALESCE(?, dispatched_at),
                started_at = COALESCE(?, started_at),
                finished_at = COALESCE(?, finished_at)
            WHERE id = ?
            "#,
        )
        .bind(patch.pid)
        .bind(patch.exit_code)
        .bind(&patch.log_file_path)
        .bind(&patch.failure_reason)
        .bind(&patch.command_display)
        .bind(patch.dispatched_at)
        .bind(patch.started_at)
        .bind(patch.finished_at)
        .bind(id)
        .execute(self.pool())
        .await?;
        self.expect_job(id).await
    }

    /// Oldest queued job, if any. Runs inside the dispatcher's transaction.
    pub async fn oldest_queued_job_tx(
        &self,
        conn: &mut SqliteConnection,
    ) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            "SELECT * FROM run_jobs WHERE status = 'queued' ORDER BY queued_at, created_at LIMIT 1",
        )
        .fetch_optional(&mut *conn)
        .await?;
        Ok(job)
    }

    /// Stamp `dispatched_at` while the job is still queued, so a spawn
    /// failure can be told apart from a subprocess failure.
    pub async fn mark_dispatched_tx(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE run_jobs SET dispatched_at = ? WHERE id = ? AND status = 'queued'")
            .bind(now)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// True when the schedule already has a queued or running job.
    pub async fn active_job_for_schedule(&self, schedule_id: &str) -> Result<bool> {
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM run_jobs WHERE scheduled_by = ? AND status IN ('queued', 'running') LIMIT 1",
        )
        .bind(schedule_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(exists.is_some())
    }

    pub async fn active_job_for_schedule_tx(
        &self,
        conn: &mut SqliteConnection,
        schedule_id: &str,
    ) -> Result<bool> {
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM run_jobs WHERE scheduled_by = ? AND status IN ('queued', 'running') LIMIT 1",
        )
        .bind(schedule_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(exists.is_some())
    }

    pub async fn running_jobs(&self) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT * FROM run_jobs WHERE status = 'running' ORDER BY created_at",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(jobs)
    }

    pub async fn count_jobs_with_status(&self, status: JobStatus) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM run_jobs WHERE status = ?")
            .bind(status)
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    /// Latest job for a tenant, by creation time.
    pub async fn latest_job_for_tenant(&self, tenant_key: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            "SELECT * FROM run_jobs WHERE tenant_key = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(tenant_key)
        .fetch_optional(self.pool())
        .await?;
        Ok(job)
    }

    pub async fn recent_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let jobs =
            sqlx::query_as::<_, Job>("SELECT * FROM run_jobs ORDER BY created_at DESC LIMIT ?")
                .bind(limit)
                .fetch_all(self.pool())
                .await?;
        Ok(jobs)
    }

    /// Cancel a job that has not been dispatched yet.
    pub async fn cancel_queued_job(&self, id: &str) -> Result<Job> {
        self.transition_job(
            id,
            JobStatus::Queued,
            JobStatus::Cancelled,
            JobPatch {
                finished_at: Some(Utc::now()),
                ..JobPatch::default()
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobScope;

    async fn store() -> Store {
        let store = Store::in_memory().await.unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn insert_assigns_id_and_queues() {
        let store = store().await;
        let job = store.insert_job(NewJob::single("acme")).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.scope, JobScope::Single);
        assert!(!job.id.is_empty());
        assert!(job.dispatched_at.is_none());
    }

    #[tokio::test]
    async fn transition_cas_detects_concurrent_change() {
        let store = store().await;
        let job = store.insert_job(NewJob::single("acme")).await.unwrap();

        store
            .transition_job(&job.id, JobStatus::Queued, JobStatus::Cancelled, JobPatch::default())
            .await
            .unwrap();

        let err = store
            .transition_job(&job.id, JobStatus::Queued, JobStatus::Running, JobPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::StatusChanged {
                found: JobStatus::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn terminal_states_are_sticky() {
        let store = store().await;
        let job = store.insert_job(NewJob::single("acme")).await.unwrap();
        store
            .transition_job(&job.id, JobStatus::Queued, JobStatus::Running, JobPatch::default())
            .await
            .unwrap();
        store
            .transition_job(
                &job.id,
                JobStatus::Running,
                JobStatus::Succeeded,
                JobPatch {
                    exit_code: Some(0),
                    finished_at: Some(Utc::now()),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap();

        let err = store
            .transition_job(&job.id, JobStatus::Succeeded, JobStatus::Running, JobPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn oldest_queued_job_orders_by_queue_time() {
        let store = store().await;
        let first = store.insert_job(NewJob::single("tenant-a")).await.unwrap();
        let _second = store.insert_job(NewJob::single("tenant-b")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let picked = store.oldest_queued_job_tx(&mut tx).await.unwrap().unwrap();
        tx.commit().await.unwrap();
        assert_eq!(picked.id, first.id);
    }

    #[tokio::test]
    async fn active_job_for_schedule_sees_queued_and_running() {
        let store = store().await;
        let schedule = store
            .insert_schedule(crate::models::NewSchedule {
                name: "Nightly".to_string(),
                cron_expr: "0 18 * * *".to_string(),
                ..crate::models::NewSchedule::default()
            })
            .await
            .unwrap();
        assert!(!store.active_job_for_schedule(&schedule.id).await.unwrap());

        let job = store
            .insert_job(NewJob {
                scheduled_by: Some(schedule.id.clone()),
                ..NewJob::all()
            })
            .await
            .unwrap();
        assert!(store.active_job_for_schedule(&schedule.id).await.unwrap());

        store
            .transition_job(&job.id, JobStatus::Queued, JobStatus::Cancelled, JobPatch::default())
            .await
            .unwrap();
        assert!(!store.active_job_for_schedule(&schedule.id).await.unwrap());
    }

    #[tokio::test]
    async fn patch_fields_only_fill_in() {
        let store = store().await;
        let job = store.insert_job(NewJob::single("acme")).await.unwrap();
        let job = store
            .transition_job(
                &job.id,
                JobStatus::Queued,
                JobStatus::Running,
                JobPatch {
                    pid: Some(4242),
                    log_file_path: Some("/tmp/run.log".to_string()),
                    started_at: Some(Utc::now()),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(job.pid, Some(4242));

        // A later patch without pid keeps the recorded one.
        let job = store
            .update_job_runtime(
                &job.id,
                JobPatch {
                    exit_code: Some(0),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(job.pid, Some(4242));
        assert_eq!(job.exit_code, Some(0));
    }
}
