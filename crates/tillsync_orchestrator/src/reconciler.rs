//! The reaper: marks running jobs whose process is gone as failed and
//! force-releases the run lock they held.
//!
//! Runs on daemon start and periodically from the scheduler loop. This is
//! the only safety net against orphaned runs; no timeout is imposed on the
//! subprocess itself.

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use tillsync_protocol::exit_codes::EXIT_CODE_RECONCILED;
use tillsync_store::{JobPatch, JobStatus, StoreError};

use crate::process::pid_alive;
use crate::Orchestrator;

/// Reap dead running jobs. Returns how many were marked failed.
pub async fn reconcile_run_jobs(orch: &Orchestrator) -> Result<usize> {
    let store = &orch.store;
    let mut fixed = 0;

    for job in store.running_jobs().await? {
        let (alive, reason) = match job.pid {
            Some(pid) => (pid_alive(pid), "Reconciled by reaper: PID not alive"),
            None => (false, "Reconciled by reaper: no PID recorded"),
        };
        if alive {
            continue;
        }

        let result = store
            .transition_job(
                &job.id,
                JobStatus::Running,
                JobStatus::Failed,
                JobPatch {
                    exit_code: Some(EXIT_CODE_RECONCILED),
                    failure_reason: Some(reason.to_string()),
                    finished_at: Some(Utc::now()),
                    ..JobPatch::default()
                },
            )
            .await;
        match result {
            Ok(_) => {
                info!(job_id = %job.id, pid = ?job.pid, "reaped stale run");
                fixed += 1;
            }
            Err(StoreError::StatusChanged { .. }) => {
                // A monitor beat us to it; nothing left to do.
                continue;
            }
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = store.release_lock_row(Some(&job.id), true).await {
            warn!(job_id = %job.id, "failed to release lock for reaped run: {e}");
        }
    }
    Ok(fixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tillsync_store::{NewJob, Store};

    use crate::config::OrchestratorConfig;

    async fn orchestrator() -> Orchestrator {
        let store = Store::in_memory().await.unwrap();
        store.init().await.unwrap();
        let config = OrchestratorConfig::for_state_root("/tmp/tillsync-test");
        Orchestrator::new(Arc::new(store), Arc::new(config))
    }

    async fn running_job(orch: &Orchestrator, tenant: &str, pid: Option<i64>) -> tillsync_store::Job {
        let job = orch.store.insert_job(NewJob::single(tenant)).await.unwrap();
        orch.store
            .transition_job(
                &job.id,
                JobStatus::Queued,
                JobStatus::Running,
                JobPatch {
                    pid,
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reaps_dead_pid_and_releases_lock() {
        let orch = orchestrator().await;
        let job = running_job(&orch, "acme", Some(999_999_999)).await;
        orch.store
            .acquire_lock_row("orchestrator:stale", Some(&job.id))
            .await
            .unwrap();

        let fixed = reconcile_run_jobs(&orch).await.unwrap();
        assert_eq!(fixed, 1);

        let job = orch.store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.exit_code, Some(-1));
        assert!(job
            .failure_reason
            .as_deref()
            .unwrap_or_default()
            .contains("PID not alive"));
        assert!(job.finished_at.is_some());
        assert!(!orch.store.get_lock().await.unwrap().active);
    }

    #[tokio::test]
    async fn reaps_running_job_without_pid() {
        let orch = orchestrator().await;
        let job = running_job(&orch, "acme", None).await;

        let fixed = reconcile_run_jobs(&orch).await.unwrap();
        assert_eq!(fixed, 1);
        let job = orch.store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job
            .failure_reason
            .as_deref()
            .unwrap_or_default()
            .contains("no PID recorded"));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn live_pid_is_left_alone() {
        let orch = orchestrator().await;
        let own_pid = std::process::id() as i64;
        let job = running_job(&orch, "acme", Some(own_pid)).await;

        let fixed = reconcile_run_jobs(&orch).await.unwrap();
        assert_eq!(fixed, 0);
        let job = orch.store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
    }
}
