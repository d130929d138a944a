//! Per-job monitor tasks and run cancellation.
//!
//! Every running subprocess is owned by exactly one monitor task, which
//! outlives the dispatch call that created it. The monitor waits for
//! termination, records the terminal state, attaches freshly ingested
//! artifacts, releases the run lock, and kicks the dispatcher to drain the
//! queue.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tillsync_store::{EventType, Job, JobPatch, JobStatus, StoreError};

use crate::process::{self, exit_code_of};
use crate::runlock::HeldLock;
use crate::{ingest, Orchestrator};

/// Grace period between the graceful-termination signal and the hard kill
/// when an operator cancels a running job.
pub const CANCEL_GRACE_SECS: u64 = 30;

pub(crate) fn spawn_monitor(
    orch: Orchestrator,
    job_id: String,
    child: tokio::process::Child,
    log_file: std::fs::File,
    held: HeldLock,
) -> JoinHandle<()> {
    tokio::spawn(monitor_job(orch, job_id, child, log_file, held))
}

async fn monitor_job(
    orch: Orchestrator,
    job_id: String,
    mut child: tokio::process::Child,
    log_file: std::fs::File,
    held: HeldLock,
) {
    let exit_code = match child.wait().await {
        Ok(status) => exit_code_of(status),
        Err(e) => {
            warn!(job_id = %job_id, "failed waiting on subprocess: {e}");
            -1
        }
    };
    // Close the handle the subprocess was writing through.
    drop(log_file);

    let finalized = match finalize_job(&orch, &job_id, exit_code).await {
        Ok(job) => job,
        Err(e) => {
            warn!(job_id = %job_id, "failed to record run outcome: {e}");
            None
        }
    };

    if let Some(job) = &finalized {
        match ingest::attach_recent_artifacts(&orch, job).await {
            Ok(attached) if attached > 0 => {
                info!(job_id = %job.id, attached, "linked artifacts to run")
            }
            Ok(_) => {}
            Err(e) => warn!(job_id = %job.id, "artifact attach failed: {e}"),
        }
        emit_run_event(&orch, job).await;
    }

    held.release(&orch.store).await;
    crate::dispatcher::kick(orch);
}

/// Record the terminal state of a finished subprocess. The job may have
/// been cancelled (keep `cancelled`, still record the exit code) or even
/// deleted while it ran.
async fn finalize_job(orch: &Orchestrator, job_id: &str, exit_code: i64) -> Result<Option<Job>> {
    let store = &orch.store;
    let Some(job) = store.get_job(job_id).await? else {
        warn!(job_id = %job_id, "job row disappeared while running");
        return Ok(None);
    };

    let terminal_patch = JobPatch {
        exit_code: Some(exit_code),
        finished_at: Some(Utc::now()),
        ..JobPatch::default()
    };

    match job.status {
        JobStatus::Cancelled => {
            let job = store.update_job_runtime(job_id, terminal_patch).await?;
            Ok(Some(job))
        }
        JobStatus::Running => {
            let to = if exit_code == 0 {
                JobStatus::Succeeded
            } else {
                JobStatus::Failed
            };
            let failure_reason = (to == JobStatus::Failed && job.failure_reason.is_none())
                .then(|| format!("Subprocess exited with code {exit_code}"));
            let patch = JobPatch {
                failure_reason,
                ..terminal_patch.clone()
            };
            match store.transition_job(job_id, JobStatus::Running, to, patch).await {
                Ok(job) => {
                    info!(job_id = %job.id, status = %job.status, exit_code, "run finished");
                    Ok(Some(job))
                }
                Err(StoreError::StatusChanged { found, .. }) if found == JobStatus::Cancelled => {
                    let job = store.update_job_runtime(job_id, terminal_patch).await?;
                    Ok(Some(job))
                }
                Err(e) => Err(e.into()),
            }
        }
        other => {
            warn!(job_id = %job_id, status = %other, "unexpected job status at subprocess exit");
            Ok(Some(job))
        }
    }
}

/// Append a run_succeeded / run_failed event for scheduled runs so the
/// schedule's history shows outcomes, not just firings.
async fn emit_run_event(orch: &Orchestrator, job: &Job) {
    let Some(schedule_id) = job.scheduled_by.as_deref() else {
        return;
    };
    let event_type = match job.status {
        JobStatus::Succeeded => EventType::RunSucceeded,
        JobStatus::Failed => EventType::RunFailed,
        _ => return,
    };
    let message = match job.status {
        JobStatus::Succeeded => "Scheduled run succeeded.".to_string(),
        _ => format!(
            "Scheduled run failed (exit code {}).",
            job.exit_code.unwrap_or(-1)
        ),
    };
    let schedule = match orch.store.get_schedule(schedule_id).await {
        Ok(schedule) => schedule,
        Err(e) => {
            warn!("failed to load schedule for run event: {e}");
            None
        }
    };
    if let Err(e) = orch
        .store
        .append_event(schedule.as_ref(), Some(&job.id), event_type, &message, None)
        .await
    {
        warn!(job_id = %job.id, "failed to append run event: {e}");
    }
}

/// Cancel a running job: flip the status first so the monitor records
/// `cancelled` rather than `failed`, then signal the subprocess. A hard
/// kill follows after [`CANCEL_GRACE_SECS`] if the PID is still alive.
pub async fn cancel_running_job(orch: &Orchestrator, job_id: &str) -> Result<Job> {
    let job = orch
        .store
        .transition_job(
            job_id,
            JobStatus::Running,
            JobStatus::Cancelled,
            JobPatch::default(),
        )
        .await?;
    if let Some(pid) = job.pid {
        info!(job_id = %job.id, pid, "cancelling run");
        process::request_termination(pid);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(CANCEL_GRACE_SECS)).await;
            if process::pid_alive(pid) {
                warn!(pid, "run ignored graceful termination; killing");
                process::force_kill(pid);
            }
        });
    }
    Ok(job)
}
