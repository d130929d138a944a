//! The scheduler: a polling loop that materializes due schedules into
//! queued jobs.
//!
//! Each cycle maintains the env fallback schedule, seeds missing
//! `next_fire_at` values, fires due schedules (bounded per cycle), kicks
//! the dispatcher when anything was queued, and records a heartbeat.
//! Nothing thrown while processing one schedule escapes the loop.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{error, info, warn};

use tillsync_protocol::business_date::business_trading_date;
use tillsync_protocol::resolve_timezone;
use tillsync_store::{
    EventType, Job, JobScope, NewJob, NewSchedule, Schedule, ScheduleLastResult, Store,
};

use crate::reconciler::reconcile_run_jobs;
use crate::{dispatcher, Orchestrator};

/// Name of the system-managed schedule materialized from the environment.
pub const FALLBACK_SCHEDULE_NAME: &str = "Legacy Env Fallback";

/// At most this many due schedules are fired per cycle.
const MAX_DUE_PER_CYCLE: i64 = 25;

/// The worker is considered dead after this many missed polls.
pub const HEARTBEAT_STALE_MULTIPLIER: u64 = 3;

/// Counters for one scheduler cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleStats {
    pub initialized: usize,
    pub due: usize,
    pub queued: usize,
    pub skipped_overlap: usize,
    pub skipped_invalid: usize,
    pub errors: usize,
    pub fallback_enabled: usize,
    pub fallback_disabled: usize,
}

impl CycleStats {
    pub fn any_activity(&self) -> bool {
        self.initialized > 0
            || self.due > 0
            || self.queued > 0
            || self.skipped_overlap > 0
            || self.skipped_invalid > 0
            || self.errors > 0
            || self.fallback_enabled > 0
            || self.fallback_disabled > 0
    }
}

impl fmt::Display for CycleStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "initialized={} due={} queued={} skipped_overlap={} skipped_invalid={} errors={} fallback_enabled={} fallback_disabled={}",
            self.initialized,
            self.due,
            self.queued,
            self.skipped_overlap,
            self.skipped_invalid,
            self.errors,
            self.fallback_enabled,
            self.fallback_disabled,
        )
    }
}

/// One scheduler cycle. Never raises for per-schedule problems; they are
/// counted and logged instead.
pub async fn process_schedule_cycle(orch: &Orchestrator, now: DateTime<Utc>) -> CycleStats {
    let mut stats = CycleStats::default();
    let store = &orch.store;

    if let Err(e) = maintain_env_fallback(orch, now, &mut stats).await {
        warn!("env fallback maintenance failed: {e}");
        stats.errors += 1;
    }

    match store.enabled_schedules_missing_next_fire().await {
        Ok(schedules) => {
            for schedule in schedules {
                if let Err(e) = initialize_missing_next_fire(orch, &schedule, now).await {
                    warn!(schedule = %schedule.name, "failed to seed next fire time: {e}");
                    stats.errors += 1;
                }
                stats.initialized += 1;
            }
        }
        Err(e) => {
            warn!("failed to list schedules needing initialization: {e}");
            stats.errors += 1;
        }
    }

    let due = match collect_due_schedules(store, now).await {
        Ok(due) => due,
        Err(e) => {
            warn!("failed to select due schedules: {e}");
            stats.errors += 1;
            Vec::new()
        }
    };
    stats.due = due.len();

    for schedule in &due {
        match process_due_schedule(orch, schedule, now).await {
            Ok((Some(_), EventType::Queued)) => stats.queued += 1,
            Ok((_, EventType::SkippedOverlap)) => stats.skipped_overlap += 1,
            Ok((_, EventType::SkippedInvalid)) => stats.skipped_invalid += 1,
            Ok(_) => {}
            Err(e) => {
                stats.errors += 1;
                error!(schedule = %schedule.name, "failed processing schedule: {e}");
                let _ = store
                    .append_event(
                        Some(schedule),
                        None,
                        EventType::Error,
                        &format!("Unhandled worker error: {e}"),
                        None,
                    )
                    .await;
            }
        }
    }

    if stats.queued > 0 {
        dispatcher::kick(orch.clone());
    }

    if let Err(e) = store.record_heartbeat(now).await {
        warn!("failed to record scheduler heartbeat: {e}");
    }
    stats
}

async fn collect_due_schedules(store: &Store, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
    let mut tx = store.begin().await?;
    let due = store.due_schedules_tx(&mut tx, now, MAX_DUE_PER_CYCLE).await?;
    tx.commit().await?;
    Ok(due)
}

/// Seed `next_fire_at` for an enabled schedule that has none yet.
async fn initialize_missing_next_fire(
    orch: &Orchestrator,
    schedule: &Schedule,
    now: DateTime<Utc>,
) -> Result<()> {
    match schedule.compute_next_fire_at(now) {
        Ok(next) => {
            orch.store.set_next_fire(&schedule.id, Some(next)).await?;
        }
        Err(e) => {
            mark_schedule_invalid(
                orch,
                schedule,
                &format!("Schedule is invalid and cannot be initialized: {e}"),
            )
            .await?;
        }
    }
    Ok(())
}

async fn mark_schedule_invalid(
    orch: &Orchestrator,
    schedule: &Schedule,
    message: &str,
) -> Result<()> {
    orch.store
        .record_schedule_result(
            &schedule.id,
            ScheduleLastResult::SkippedInvalid,
            message,
            None,
        )
        .await?;
    orch.store
        .append_event(
            Some(schedule),
            None,
            EventType::SkippedInvalid,
            message,
            None,
        )
        .await?;
    Ok(())
}

/// Advance a due schedule past `now` and enqueue its run.
async fn process_due_schedule(
    orch: &Orchestrator,
    schedule: &Schedule,
    now: DateTime<Utc>,
) -> Result<(Option<Job>, EventType)> {
    if schedule.scope == JobScope::Single && blank(&schedule.tenant_key) {
        mark_schedule_invalid(
            orch,
            schedule,
            "Skipping invalid schedule: single-tenant scope requires a tenant key.",
        )
        .await?;
        return Ok((None, EventType::SkippedInvalid));
    }

    let next = match schedule.compute_next_fire_at(now) {
        Ok(next) => next,
        Err(e) => {
            mark_schedule_invalid(orch, schedule, &format!("Skipping invalid schedule: {e}"))
                .await?;
            return Ok((None, EventType::SkippedInvalid));
        }
    };
    orch.store.set_next_fire(&schedule.id, Some(next)).await?;

    enqueue_run_for_schedule(orch, schedule, now, "worker").await
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or_default().is_empty()
}

/// Create the queued job for a schedule firing, atomically with its event
/// and the schedule bookkeeping. A schedule that already has a queued or
/// running job is skipped with an overlap event instead.
pub async fn enqueue_run_for_schedule(
    orch: &Orchestrator,
    schedule: &Schedule,
    now: DateTime<Utc>,
    source: &str,
) -> Result<(Option<Job>, EventType)> {
    let store = &orch.store;

    let mut tx = store.begin().await?;
    let Some(schedule) = store.get_schedule_tx(&mut tx, &schedule.id).await? else {
        drop(tx);
        return Ok((None, EventType::SkippedInvalid));
    };

    if schedule.scope == JobScope::Single && blank(&schedule.tenant_key) {
        let message = format!("Skipped {source} enqueue: single-tenant schedule is missing its tenant key.");
        store
            .record_schedule_result_tx(
                &mut tx,
                &schedule.id,
                ScheduleLastResult::SkippedInvalid,
                &message,
                None,
            )
            .await?;
        store
            .append_event_tx(
                &mut tx,
                Some(&schedule),
                None,
                EventType::SkippedInvalid,
                &message,
                None,
            )
            .await?;
        tx.commit().await?;
        return Ok((None, EventType::SkippedInvalid));
    }

    if store.active_job_for_schedule_tx(&mut tx, &schedule.id).await? {
        let message = format!(
            "Skipped {source} enqueue because this schedule already has a queued/running run."
        );
        store
            .record_schedule_result_tx(
                &mut tx,
                &schedule.id,
                ScheduleLastResult::SkippedOverlap,
                "",
                Some(now),
            )
            .await?;
        store
            .append_event_tx(
                &mut tx,
                Some(&schedule),
                None,
                EventType::SkippedOverlap,
                &message,
                None,
            )
            .await?;
        tx.commit().await?;
        return Ok((None, EventType::SkippedOverlap));
    }

    let tz = match resolve_timezone(&schedule.timezone_name) {
        Ok(tz) => tz,
        Err(e) => {
            let message = format!("Skipped {source} enqueue: {e}");
            store
                .record_schedule_result_tx(
                    &mut tx,
                    &schedule.id,
                    ScheduleLastResult::SkippedInvalid,
                    &message,
                    None,
                )
                .await?;
            store
                .append_event_tx(
                    &mut tx,
                    Some(&schedule),
                    None,
                    EventType::SkippedInvalid,
                    &message,
                    None,
                )
                .await?;
            tx.commit().await?;
            return Ok((None, EventType::SkippedInvalid));
        }
    };
    let target_date = business_trading_date(now, tz, orch.config.business_cutoff);

    let job = store
        .insert_job_tx(
            &mut tx,
            NewJob {
                scope: schedule.scope,
                tenant_key: schedule.tenant_key.clone(),
                target_date: Some(target_date),
                parallel: schedule.parallel.max(1),
                stagger_seconds: schedule.stagger_seconds.max(0),
                continue_on_failure: schedule.continue_on_failure,
                scheduled_by: Some(schedule.id.clone()),
                ..NewJob::default()
            },
        )
        .await?;
    store
        .record_schedule_result_tx(
            &mut tx,
            &schedule.id,
            ScheduleLastResult::Queued,
            "",
            Some(now),
        )
        .await?;
    store
        .append_event_tx(
            &mut tx,
            Some(&schedule),
            Some(&job.id),
            EventType::Queued,
            &format!("Run queued ({source})."),
            Some(json!({
                "scope": job.scope.as_str(),
                "tenant_key": job.tenant_key,
                "target_date": job.target_date.map(|d| d.format("%Y-%m-%d").to_string()),
            })),
        )
        .await?;
    tx.commit().await?;

    info!(schedule = %schedule.name, job_id = %job.id, "schedule fired");
    Ok((Some(job), EventType::Queued))
}

/// Keep the env fallback schedule in sync with the environment: present and
/// enabled only while the flag is on and no user schedule is enabled.
async fn maintain_env_fallback(
    orch: &Orchestrator,
    now: DateTime<Utc>,
    stats: &mut CycleStats,
) -> Result<()> {
    let store = &orch.store;
    let config = &orch.config;

    if !config.enable_env_fallback {
        for schedule in store.enabled_system_schedules().await? {
            store.set_schedule_enabled(&schedule.id, false).await?;
            store
                .append_event(
                    Some(&schedule),
                    None,
                    EventType::FallbackDisabled,
                    "Environment fallback disabled by SCHEDULER_ENABLE_ENV_FALLBACK=0.",
                    None,
                )
                .await?;
            stats.fallback_disabled += 1;
        }
        return Ok(());
    }

    if store.enabled_user_schedule_exists().await? {
        for schedule in store.enabled_system_schedules().await? {
            store.set_schedule_enabled(&schedule.id, false).await?;
            store
                .append_event(
                    Some(&schedule),
                    None,
                    EventType::FallbackDisabled,
                    "Disabled env fallback because at least one user schedule is enabled.",
                    None,
                )
                .await?;
            stats.fallback_disabled += 1;
        }
        return Ok(());
    }

    let (schedule, created) = store
        .get_or_create_system_schedule(
            FALLBACK_SCHEDULE_NAME,
            NewSchedule {
                enabled: true,
                scope: JobScope::All,
                cron_expr: config.fallback_cron.clone(),
                timezone_name: config.fallback_timezone.clone(),
                parallel: 2,
                stagger_seconds: 2,
                ..NewSchedule::default()
            },
        )
        .await?;

    let mut changed = created;
    if schedule.cron_expr != config.fallback_cron
        || schedule.timezone_name != config.fallback_timezone
        || !schedule.enabled
    {
        store
            .update_fallback_schedule(
                &schedule.id,
                &config.fallback_cron,
                &config.fallback_timezone,
                true,
            )
            .await?;
        changed = true;
    }
    if schedule.next_fire_at.is_none() {
        changed = true;
    }

    if changed {
        let schedule = store
            .get_schedule(&schedule.id)
            .await?
            .unwrap_or(schedule);
        match schedule.compute_next_fire_at(now) {
            Ok(next) => store.set_next_fire(&schedule.id, Some(next)).await?,
            Err(e) => {
                store
                    .record_schedule_result(
                        &schedule.id,
                        ScheduleLastResult::SkippedInvalid,
                        &e.to_string(),
                        None,
                    )
                    .await?
            }
        }
        store
            .append_event(
                Some(&schedule),
                None,
                EventType::FallbackEnabled,
                "Env fallback schedule enabled from SCHEDULE_CRON/SCHEDULE_TZ.",
                Some(json!({
                    "cron_expr": schedule.cron_expr,
                    "timezone_name": schedule.timezone_name,
                })),
            )
            .await?;
        stats.fallback_enabled += 1;
    }
    Ok(())
}

/// The blocking worker loop. Reaps dead runs, processes a cycle, sleeps,
/// repeats; exits on shutdown signal (or after one cycle with `once`).
pub async fn run_worker(orch: &Orchestrator, once: bool, poll_override: Option<u64>) -> Result<()> {
    let poll_seconds = poll_override.unwrap_or(orch.config.poll_seconds).max(1);
    info!("schedule worker started (poll_seconds={poll_seconds}, once={once})");

    loop {
        match reconcile_run_jobs(orch).await {
            Ok(fixed) if fixed > 0 => info!("reconciled {fixed} stale run(s)"),
            Ok(_) => {}
            Err(e) => warn!("reconciler pass failed: {e}"),
        }

        let stats = process_schedule_cycle(orch, Utc::now()).await;
        if stats.any_activity() {
            info!("cycle {stats}");
        }

        if once {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(poll_seconds)) => {}
            _ = shutdown_signal() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    info!("schedule worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Scheduler liveness as shown on the schedules page.
#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub running: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub message: String,
}

pub async fn scheduler_status(store: &Store, poll_seconds: u64) -> SchedulerStatus {
    let stale_seconds = (poll_seconds.max(1) * HEARTBEAT_STALE_MULTIPLIER) as i64;
    match store.heartbeat().await {
        Err(e) => {
            warn!("scheduler status unavailable: {e}");
            SchedulerStatus {
                running: false,
                last_seen: None,
                message: "Scheduler status unavailable.".to_string(),
            }
        }
        Ok(None) => SchedulerStatus {
            running: false,
            last_seen: None,
            message: "Scheduler has not run yet.".to_string(),
        },
        Ok(Some(last_seen)) => {
            let age_seconds = (Utc::now() - last_seen).num_seconds();
            if age_seconds <= stale_seconds {
                SchedulerStatus {
                    running: true,
                    last_seen: Some(last_seen),
                    message: "Worker is polling; scheduled runs will run at their next fire time."
                        .to_string(),
                }
            } else {
                SchedulerStatus {
                    running: false,
                    last_seen: Some(last_seen),
                    message: format!(
                        "Worker last seen {age_seconds}s ago. Start the scheduler service for scheduled runs to execute."
                    ),
                }
            }
        }
    }
}
