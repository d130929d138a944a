//! The single-slot dispatcher.
//!
//! One transaction claims the lock row and the oldest queued job together;
//! the subprocess spawn happens after commit so no transaction is held
//! across process I/O. A spawn failure is recorded distinctly (exit code 3)
//! from a subprocess failure.

use std::process::Stdio;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use tillsync_protocol::exit_codes::EXIT_CODE_SPAWN_FAILED;
use tillsync_protocol::types::{ENV_LOCK_HELD, ENV_RUN_SOURCE};
use tillsync_protocol::RunSource;
use tillsync_store::{Job, JobPatch, JobStatus, StoreError};

use crate::command::build_command;
use crate::monitor::spawn_monitor;
use crate::runlock::{self, HeldLock, LockError};
use crate::Orchestrator;

/// What a dispatch attempt did.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A job was spawned and is now running.
    Started(Job),
    /// The oldest queued job could not be spawned; it was marked failed
    /// with exit code 3.
    SpawnFailed(Job),
    /// The run slot is occupied.
    Busy,
    /// Nothing queued.
    Idle,
}

/// Fire-and-forget dispatch, used to drain the queue after a run finishes
/// or a scheduler cycle enqueues work.
pub fn kick(orch: Orchestrator) {
    tokio::spawn(async move {
        // Boxed to break the dispatch -> monitor -> dispatch future cycle.
        let dispatch = Box::pin(dispatch_next_queued_job(&orch, RunSource::Scheduler));
        if let Err(e) = dispatch.await {
            warn!("dispatcher kick failed: {e}");
        }
    });
}

/// Claim the run slot and start the oldest queued job, if any.
pub async fn dispatch_next_queued_job(
    orch: &Orchestrator,
    source: RunSource,
) -> Result<DispatchOutcome> {
    let store = &orch.store;

    // Critical section: lock row + job pick + dispatch stamp, one commit.
    let mut tx = store.begin().await?;
    match store.acquire_lock_row_tx(&mut tx, "orchestrator", None).await {
        Ok(()) => {}
        Err(StoreError::LockBusy { holder }) => {
            drop(tx);
            info!("dispatch skipped: run lock held by {holder}");
            return Ok(DispatchOutcome::Busy);
        }
        Err(e) => return Err(e.into()),
    }
    let Some(job) = store.oldest_queued_job_tx(&mut tx).await? else {
        // Roll back the tentative claim; nothing to run.
        drop(tx);
        return Ok(DispatchOutcome::Idle);
    };
    let holder = format!("orchestrator:{}", job.id);
    store
        .set_lock_owner_tx(&mut tx, &holder, Some(&job.id))
        .await?;
    store.mark_dispatched_tx(&mut tx, &job.id, Utc::now()).await?;
    tx.commit().await?;

    // The file lock gives crash-safety across processes.
    let file = match runlock::try_lock_file(&orch.config.lock_file_path()) {
        Ok(file) => file,
        Err(LockError::Busy { holder }) => {
            warn!("run lock file held by {holder}; backing off");
            if let Err(e) = store.release_lock_row(Some(&job.id), true).await {
                warn!("failed to release lock row after file-lock contention: {e}");
            }
            return Ok(DispatchOutcome::Busy);
        }
        Err(e) => {
            if let Err(release_err) = store.release_lock_row(Some(&job.id), true).await {
                warn!("failed to release lock row: {release_err}");
            }
            return Err(e.into());
        }
    };
    let held = HeldLock::new(file, Some(job.id.clone()));

    start_run_job(orch, job, held, source).await
}

/// Open the log file, spawn the subprocess, record it on the job, and hand
/// the child to a monitor task.
async fn start_run_job(
    orch: &Orchestrator,
    job: Job,
    held: HeldLock,
    source: RunSource,
) -> Result<DispatchOutcome> {
    let store = &orch.store;
    let config = &orch.config;
    // Scheduled jobs always announce themselves as such, no matter which
    // entry point drained them from the queue.
    let source = if job.scheduled_by.is_some() {
        RunSource::Scheduler
    } else {
        source
    };
    let command = build_command(&job, config);
    let log_path = config.log_file_for(&job.id);

    let log_file = (|| {
        std::fs::create_dir_all(config.run_logs_dir())?;
        std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log_path)
    })();

    let spawned = match log_file {
        Ok(log_file) => {
            let spawn = (|| -> std::io::Result<tokio::process::Child> {
                let stdout = log_file.try_clone()?;
                let stderr = log_file.try_clone()?;
                tokio::process::Command::new(&command.program)
                    .args(&command.args)
                    .current_dir(&config.pipeline_root)
                    .env(ENV_RUN_SOURCE, source.as_str())
                    .env(ENV_LOCK_HELD, "1")
                    .stdin(Stdio::null())
                    .stdout(Stdio::from(stdout))
                    .stderr(Stdio::from(stderr))
                    .spawn()
            })();
            spawn.map(|child| (child, log_file))
        }
        Err(e) => Err(e),
    };

    match spawned {
        Ok((mut child, log_file)) => {
            let pid = child.id().map(|pid| pid as i64);
            let transition = store
                .transition_job(
                    &job.id,
                    JobStatus::Queued,
                    JobStatus::Running,
                    JobPatch {
                        pid,
                        log_file_path: Some(log_path.display().to_string()),
                        command_display: Some(command.display()),
                        started_at: Some(Utc::now()),
                        ..JobPatch::default()
                    },
                )
                .await;
            match transition {
                Ok(job) => {
                    info!(job_id = %job.id, pid = ?job.pid, "run started: {}", command.display());
                    spawn_monitor(orch.clone(), job.id.clone(), child, log_file, held);
                    Ok(DispatchOutcome::Started(job))
                }
                Err(StoreError::StatusChanged { found, .. }) => {
                    // Cancelled between the pick and the spawn; stop the
                    // child and free the slot.
                    warn!(job_id = %job.id, %found, "job changed state during spawn; terminating child");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    held.release(store).await;
                    Ok(DispatchOutcome::Idle)
                }
                Err(e) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    held.release(store).await;
                    Err(e.into())
                }
            }
        }
        Err(spawn_err) => {
            warn!(job_id = %job.id, "failed to start subprocess: {spawn_err}");
            let failed = store
                .transition_job(
                    &job.id,
                    JobStatus::Queued,
                    JobStatus::Failed,
                    JobPatch {
                        exit_code: Some(EXIT_CODE_SPAWN_FAILED),
                        failure_reason: Some(format!("Failed to start subprocess: {spawn_err}")),
                        command_display: Some(command.display()),
                        finished_at: Some(Utc::now()),
                        ..JobPatch::default()
                    },
                )
                .await
                .context("recording spawn failure")?;
            held.release(store).await;
            Ok(DispatchOutcome::SpawnFailed(failed))
        }
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tillsync_store::{NewJob, Store};

    use crate::config::OrchestratorConfig;

    async fn orchestrator(dir: &std::path::Path) -> Orchestrator {
        let store = Store::in_memory().await.unwrap();
        store.init().await.unwrap();
        let mut config = OrchestratorConfig::for_state_root(dir);
        config.pipeline_root = dir.to_path_buf();
        Orchestrator::new(Arc::new(store), Arc::new(config))
    }

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn wait_for_status(
        store: &Store,
        job_id: &str,
        status: JobStatus,
    ) -> tillsync_store::Job {
        for _ in 0..200 {
            let job = store.get_job(job_id).await.unwrap().unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("job {job_id} never reached {status}");
    }

    #[tokio::test]
    async fn idle_when_nothing_queued() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        let outcome = dispatch_next_queued_job(&orch, RunSource::Cli).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Idle));
        assert!(!orch.store.get_lock().await.unwrap().active);
    }

    #[tokio::test]
    async fn busy_when_lock_held_by_live_owner() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;

        let owner = orch.store.insert_job(NewJob::single("tenant-a")).await.unwrap();
        orch.store
            .transition_job(&owner.id, JobStatus::Queued, JobStatus::Running, JobPatch::default())
            .await
            .unwrap();
        orch.store
            .acquire_lock_row("orchestrator:test", Some(&owner.id))
            .await
            .unwrap();

        let queued = orch.store.insert_job(NewJob::single("tenant-b")).await.unwrap();
        let outcome = dispatch_next_queued_job(&orch, RunSource::Cli).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Busy));

        let still_queued = orch.store.get_job(&queued.id).await.unwrap().unwrap();
        assert_eq!(still_queued.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn queue_and_drain() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        let script = write_script(dir.path(), "pipeline", "exit 0");
        let mut config = (*orch.config).clone();
        config.single_tenant_bin = script;
        let orch = Orchestrator::new(orch.store.clone(), Arc::new(config));

        let job_a = orch.store.insert_job(NewJob::single("tenant-a")).await.unwrap();
        let job_b = orch.store.insert_job(NewJob::single("tenant-b")).await.unwrap();

        let outcome = dispatch_next_queued_job(&orch, RunSource::Dashboard).await.unwrap();
        let started = match outcome {
            DispatchOutcome::Started(job) => job,
            other => panic!("expected start, got {other:?}"),
        };
        // Oldest first.
        assert_eq!(started.id, job_a.id);
        assert!(started.pid.is_some());
        assert!(started.log_file_path.is_some());

        // Monitor drains the queue: both jobs end up succeeded and the lock
        // is free again.
        let job_a = wait_for_status(&orch.store, &job_a.id, JobStatus::Succeeded).await;
        assert_eq!(job_a.exit_code, Some(0));
        let job_b = wait_for_status(&orch.store, &job_b.id, JobStatus::Succeeded).await;
        assert_eq!(job_b.exit_code, Some(0));

        for _ in 0..200 {
            if !orch.store.get_lock().await.unwrap().active {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(!orch.store.get_lock().await.unwrap().active);
        // Log files were written for both runs.
        assert!(orch.config.log_file_for(&job_a.id).exists());
        assert!(orch.config.log_file_for(&job_b.id).exists());
    }

    #[tokio::test]
    async fn running_job_holds_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        let script = write_script(dir.path(), "pipeline", "sleep 5");
        let mut config = (*orch.config).clone();
        config.single_tenant_bin = script;
        let orch = Orchestrator::new(orch.store.clone(), Arc::new(config));

        let job_a = orch.store.insert_job(NewJob::single("tenant-a")).await.unwrap();
        let _job_b = orch.store.insert_job(NewJob::single("tenant-b")).await.unwrap();

        let outcome = dispatch_next_queued_job(&orch, RunSource::Dashboard).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Started(_)));

        // Mutual exclusion: with a alive, a second dispatch reports busy and
        // exactly one job is running.
        let outcome = dispatch_next_queued_job(&orch, RunSource::Dashboard).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Busy));
        assert_eq!(
            orch.store.count_jobs_with_status(JobStatus::Running).await.unwrap(),
            1
        );
        let lock = orch.store.get_lock().await.unwrap();
        assert!(lock.active);
        assert_eq!(lock.owner_job.as_deref(), Some(job_a.id.as_str()));

        // Stop the run so the test does not linger.
        let job = orch.store.get_job(&job_a.id).await.unwrap().unwrap();
        if let Some(pid) = job.pid {
            crate::process::force_kill(pid);
        }
        wait_for_status(&orch.store, &job_a.id, JobStatus::Failed).await;
    }

    #[tokio::test]
    async fn failing_subprocess_records_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        let script = write_script(dir.path(), "pipeline", "exit 2");
        let mut config = (*orch.config).clone();
        config.single_tenant_bin = script;
        let orch = Orchestrator::new(orch.store.clone(), Arc::new(config));

        let job = orch.store.insert_job(NewJob::single("tenant-a")).await.unwrap();
        dispatch_next_queued_job(&orch, RunSource::Dashboard).await.unwrap();

        let job = wait_for_status(&orch.store, &job.id, JobStatus::Failed).await;
        assert_eq!(job.exit_code, Some(2));
        assert!(job
            .failure_reason
            .as_deref()
            .unwrap_or_default()
            .contains("exited with code 2"));
    }

    #[tokio::test]
    async fn spawn_failure_synthesizes_exit_code_3() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        let mut config = (*orch.config).clone();
        config.single_tenant_bin = dir.path().join("does-not-exist");
        let orch = Orchestrator::new(orch.store.clone(), Arc::new(config));

        let job = orch.store.insert_job(NewJob::single("tenant-a")).await.unwrap();
        let outcome = dispatch_next_queued_job(&orch, RunSource::Dashboard).await.unwrap();
        let failed = match outcome {
            DispatchOutcome::SpawnFailed(job) => job,
            other => panic!("expected spawn failure, got {other:?}"),
        };
        assert_eq!(failed.id, job.id);
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.exit_code, Some(EXIT_CODE_SPAWN_FAILED));
        assert!(!orch.store.get_lock().await.unwrap().active);
    }
}
