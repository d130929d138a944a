//! Database models.
//!
//! Uses derive macros for FromRow to map database rows to structs; enums
//! are stored as lowercase/snake-case text.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use tillsync_protocol::is_valid_tenant_key;

use crate::error::StoreError;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobScope {
    Single,
    All,
}

impl JobScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobScope::Single => "single",
            JobScope::All => "all",
        }
    }
}

impl std::fmt::Display for JobScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Queued or running.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// The allowed transition DAG:
    /// queued -> {running, failed, cancelled}; running -> {succeeded, failed,
    /// cancelled}. Terminal states never transition again.
    ///
    /// queued -> failed exists only for the spawn-failure path, where the
    /// subprocess never started.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleLastResult {
    Queued,
    SkippedOverlap,
    SkippedInvalid,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Queued,
    SkippedOverlap,
    SkippedInvalid,
    Error,
    FallbackEnabled,
    FallbackDisabled,
    RunSucceeded,
    RunFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Queued => "queued",
            EventType::SkippedOverlap => "skipped_overlap",
            EventType::SkippedInvalid => "skipped_invalid",
            EventType::Error => "error",
            EventType::FallbackEnabled => "fallback_enabled",
            EventType::FallbackDisabled => "fallback_disabled",
            EventType::RunSucceeded => "run_succeeded",
            EventType::RunFailed => "run_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Reliability {
    High,
    Warning,
}

// ============================================================================
// Core models
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct Tenant {
    pub tenant_key: String,
    pub display_name: String,
    pub active: bool,
    pub config: String, // JSON
    pub checksum: String,
    pub config_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn config_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.config).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Job {
    pub id: String,
    pub scope: JobScope,
    pub tenant_key: Option<String>,
    pub target_date: Option<NaiveDate>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub skip_download: bool,
    pub parallel: i64,
    pub stagger_seconds: i64,
    pub continue_on_failure: bool,
    pub command_display: Option<String>,
    pub status: JobStatus,
    pub pid: Option<i64>,
    pub exit_code: Option<i64>,
    pub log_file_path: Option<String>,
    pub failure_reason: Option<String>,
    pub requested_by: Option<String>,
    pub scheduled_by: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Payload for creating a job. Validated at the API boundary; invalid
/// payloads never reach the database.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub scope: JobScope,
    pub tenant_key: Option<String>,
    pub target_date: Option<NaiveDate>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub skip_download: bool,
    pub parallel: i64,
    pub stagger_seconds: i64,
    pub continue_on_failure: bool,
    pub requested_by: Option<String>,
    pub scheduled_by: Option<String>,
}

impl Default for NewJob {
    fn default() -> Self {
        Self {
            scope: JobScope::All,
            tenant_key: None,
            target_date: None,
            from_date: None,
            to_date: None,
            skip_download: false,
            parallel: 1,
            stagger_seconds: 0,
            continue_on_failure: false,
            requested_by: None,
            scheduled_by: None,
        }
    }
}

impl NewJob {
    pub fn single(tenant_key: impl Into<String>) -> Self {
        Self {
            scope: JobScope::Single,
            tenant_key: Some(tenant_key.into()),
            ..Self::default()
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    /// Validate and normalize the payload: single-tenant jobs are forced to
    /// `parallel = 1` and `continue_on_failure = false`; all-tenant jobs
    /// carry no tenant key. Exactly one date-selector form may be set, and
    /// `skip_download` is only legal with the range form.
    pub fn normalized(mut self) -> Result<Self, StoreError> {
        match self.scope {
            JobScope::Single => {
                let key = self.tenant_key.as_deref().unwrap_or("").trim().to_string();
                if key.is_empty() {
                    return Err(StoreError::InvalidJob(
                        "single-tenant job requires a tenant key".to_string(),
                    ));
                }
                if !is_valid_tenant_key(&key) {
                    return Err(StoreError::InvalidJob(format!(
                        "invalid tenant key: {key}"
                    )));
                }
                self.tenant_key = Some(key);
                self.parallel = 1;
                self.continue_on_failure = false;
            }
            JobScope::All => {
                self.tenant_key = None;
            }
        }

        let has_range = match (self.from_date, self.to_date) {
            (Some(from), Some(to)) => {
                if from > to {
                    return Err(StoreError::InvalidJob(
                        "from_date must not be after to_date".to_string(),
                    ));
                }
                true
            }
            (None, None) => false,
            _ => {
                return Err(StoreError::InvalidJob(
                    "date range requires both from_date and to_date".to_string(),
                ))
            }
        };
        if self.target_date.is_some() && has_range {
            return Err(StoreError::InvalidJob(
                "target_date and date range are mutually exclusive".to_string(),
            ));
        }
        if self.skip_download && !has_range {
            return Err(StoreError::InvalidJob(
                "skip_download is only valid with a date range".to_string(),
            ));
        }

        if self.parallel < 1 {
            return Err(StoreError::InvalidJob("parallel must be >= 1".to_string()));
        }
        if self.stagger_seconds < 0 {
            return Err(StoreError::InvalidJob(
                "stagger_seconds must be >= 0".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Field updates applied together with a status transition. `None` leaves
/// the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub pid: Option<i64>,
    pub exit_code: Option<i64>,
    pub log_file_path: Option<String>,
    pub failure_reason: Option<String>,
    pub command_display: Option<String>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub scope: JobScope,
    pub tenant_key: Option<String>,
    pub cron_expr: String,
    pub timezone_name: String,
    pub target_date_mode: String,
    pub parallel: i64,
    pub stagger_seconds: i64,
    pub continue_on_failure: bool,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_result: Option<ScheduleLastResult>,
    pub last_error: Option<String>,
    pub is_system_managed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating a schedule.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub name: String,
    pub enabled: bool,
    pub scope: JobScope,
    pub tenant_key: Option<String>,
    pub cron_expr: String,
    pub timezone_name: String,
    pub parallel: i64,
    pub stagger_seconds: i64,
    pub continue_on_failure: bool,
    pub is_system_managed: bool,
}

impl Default for NewSchedule {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            scope: JobScope::All,
            tenant_key: None,
            cron_expr: String::new(),
            timezone_name: "UTC".to_string(),
            parallel: 2,
            stagger_seconds: 2,
            continue_on_failure: false,
            is_system_managed: false,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct GlobalLock {
    pub active: bool,
    pub holder: String,
    pub owner_job: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ScheduleEvent {
    pub id: i64,
    pub schedule_id: Option<String>,
    pub run_job: Option<String>,
    pub event_type: EventType,
    pub message: String,
    pub payload: String, // JSON
    pub created_at: DateTime<Utc>,
}

impl ScheduleEvent {
    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.payload).unwrap_or(serde_json::Value::Null)
    }

    /// Schedule name for display, surviving schedule deletion via the
    /// payload snapshot.
    pub fn resolved_schedule_name(&self) -> String {
        if let Some(name) = self
            .payload_json()
            .get("schedule_name")
            .and_then(|v| v.as_str())
        {
            if !name.is_empty() {
                return name.to_string();
            }
        }
        "-".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct PortalSettingsRow {
    pub default_parallel: Option<i64>,
    pub default_stagger_seconds: Option<i64>,
    pub stale_hours_warning: Option<i64>,
    pub refresh_expiring_days: Option<i64>,
    pub reconcile_diff_warning: Option<f64>,
    pub reauth_guidance: Option<String>,
    pub dashboard_timezone: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Artifact {
    pub id: i64,
    pub run_job: Option<String>,
    pub tenant_key: String,
    pub target_date: Option<NaiveDate>,
    pub processed_at: Option<DateTime<Utc>>,
    pub source_path: String,
    pub source_hash: String,
    pub reliability: Reliability,
    pub rows_total: Option<i64>,
    pub rows_kept: Option<i64>,
    pub rows_non_target: Option<i64>,
    pub upload_stats: String, // JSON
    pub reconcile_status: String,
    pub reconcile_difference: Option<f64>,
    pub reconcile_epos_total: Option<f64>,
    pub reconcile_qbo_total: Option<f64>,
    pub reconcile_epos_count: Option<i64>,
    pub reconcile_qbo_count: Option<i64>,
    pub raw_file: String,
    pub processed_files: String, // JSON array
    pub nearest_log_file: String,
    pub imported_at: DateTime<Utc>,
}

impl Artifact {
    pub fn upload_stats_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.upload_stats).unwrap_or(serde_json::Value::Null)
    }

    pub fn processed_files_list(&self) -> Vec<String> {
        serde_json::from_str(&self.processed_files).unwrap_or_default()
    }

    /// Count of failed uploads from the opaque stats mapping. Numeric
    /// strings are accepted for legacy metadata.
    pub fn failed_uploads(&self) -> i64 {
        match self.upload_stats_json().get("failed") {
            Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(serde_json::Value::String(s)) => s.trim().parse::<i64>().unwrap_or(0),
            _ => 0,
        }
    }
}

/// Parsed artifact fields handed to the store for upsert.
#[derive(Debug, Clone)]
pub struct ArtifactInput {
    pub tenant_key: String,
    pub target_date: Option<NaiveDate>,
    pub processed_at: Option<DateTime<Utc>>,
    pub source_path: String,
    pub source_hash: String,
    pub reliability: Reliability,
    pub rows_total: Option<i64>,
    pub rows_kept: Option<i64>,
    pub rows_non_target: Option<i64>,
    pub upload_stats: serde_json::Value,
    pub reconcile_status: String,
    pub reconcile_difference: Option<f64>,
    pub reconcile_epos_total: Option<f64>,
    pub reconcile_qbo_total: Option<f64>,
    pub reconcile_epos_count: Option<i64>,
    pub reconcile_qbo_count: Option<i64>,
    pub raw_file: String,
    pub processed_files: Vec<String>,
    pub nearest_log_file: String,
}
