//! Environment-driven configuration.
//!
//! Built once at startup with [`OrchestratorConfig::from_env`] and passed
//! down; tests construct it directly. Malformed values fall back to
//! defaults rather than erroring, so a bad environment never stops the
//! daemon.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

use tillsync_protocol::business_date::{
    business_trading_date, DEFAULT_BUSINESS_TIMEZONE, DEFAULT_CUTOFF,
};
use tillsync_protocol::resolve_timezone;
use tillsync_store::Store;

/// Default scheduler poll interval in seconds.
pub const DEFAULT_POLL_SECONDS: u64 = 15;

/// Cron used for the env fallback schedule when SCHEDULE_CRON is unset
/// (6pm daily).
pub const DEFAULT_FALLBACK_CRON: &str = "0 18 * * *";

const DEFAULT_PARALLEL: i64 = 2;
const DEFAULT_STAGGER_SECONDS: i64 = 2;
const DEFAULT_REFRESH_EXPIRING_DAYS: i64 = 7;
const DEFAULT_STALE_HOURS_WARNING: i64 = 48;
const DEFAULT_RECONCILE_DIFF_WARNING: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub poll_seconds: u64,
    pub enable_env_fallback: bool,
    pub fallback_cron: String,
    pub fallback_timezone: String,
    pub business_timezone: String,
    pub business_cutoff: (u32, u32),
    pub default_parallel: i64,
    pub default_stagger_seconds: i64,
    pub state_root: PathBuf,
    pub pipeline_root: PathBuf,
    pub single_tenant_bin: PathBuf,
    pub all_tenants_bin: PathBuf,
    pub database_url: String,
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let state_root = env_path("TILLSYNC_STATE_DIR").unwrap_or_else(default_state_root);
        let pipeline_root = env_path("TILLSYNC_PIPELINE_ROOT")
            .unwrap_or_else(|| state_root.parent().unwrap_or(&state_root).to_path_buf());
        let business_timezone =
            env_str("BUSINESS_TIMEZONE").unwrap_or_else(|| DEFAULT_BUSINESS_TIMEZONE.to_string());
        let fallback_timezone =
            env_str("SCHEDULE_TZ").unwrap_or_else(|| business_timezone.clone());
        let database_url = env_str("TILLSYNC_DATABASE_URL").unwrap_or_else(|| {
            format!("sqlite:{}?mode=rwc", state_root.join("tillsync.db").display())
        });

        Self {
            poll_seconds: env_u64("SCHEDULER_POLL_SECONDS", DEFAULT_POLL_SECONDS, 1),
            enable_env_fallback: env_flag("SCHEDULER_ENABLE_ENV_FALLBACK", true),
            fallback_cron: env_str("SCHEDULE_CRON")
                .unwrap_or_else(|| DEFAULT_FALLBACK_CRON.to_string()),
            fallback_timezone,
            business_timezone,
            business_cutoff: (
                env_u32("BUSINESS_DAY_CUTOFF_HOUR", DEFAULT_CUTOFF.0, 23),
                env_u32("BUSINESS_DAY_CUTOFF_MINUTE", DEFAULT_CUTOFF.1, 59),
            ),
            default_parallel: env_i64("DASHBOARD_DEFAULT_PARALLEL", DEFAULT_PARALLEL, 1),
            default_stagger_seconds: env_i64(
                "DASHBOARD_DEFAULT_STAGGER_SECONDS",
                DEFAULT_STAGGER_SECONDS,
                0,
            ),
            single_tenant_bin: env_path("TILLSYNC_PIPELINE_BIN")
                .unwrap_or_else(|| PathBuf::from("pipeline")),
            all_tenants_bin: env_path("TILLSYNC_ALL_TENANTS_BIN")
                .unwrap_or_else(|| PathBuf::from("all-tenants")),
            state_root,
            pipeline_root,
            database_url,
        }
    }

    /// Config rooted at a given state directory. Used by tests.
    pub fn for_state_root(state_root: impl Into<PathBuf>) -> Self {
        let state_root = state_root.into();
        Self {
            poll_seconds: DEFAULT_POLL_SECONDS,
            enable_env_fallback: true,
            fallback_cron: DEFAULT_FALLBACK_CRON.to_string(),
            fallback_timezone: DEFAULT_BUSINESS_TIMEZONE.to_string(),
            business_timezone: DEFAULT_BUSINESS_TIMEZONE.to_string(),
            business_cutoff: DEFAULT_CUTOFF,
            default_parallel: DEFAULT_PARALLEL,
            default_stagger_seconds: DEFAULT_STAGGER_SECONDS,
            pipeline_root: state_root.clone(),
            single_tenant_bin: PathBuf::from("pipeline"),
            all_tenants_bin: PathBuf::from("all-tenants"),
            database_url: format!(
                "sqlite:{}?mode=rwc",
                state_root.join("tillsync.db").display()
            ),
            state_root,
        }
    }

    // --- State layout ---

    pub fn lock_file_path(&self) -> PathBuf {
        self.state_root.join("global_run.lock")
    }

    pub fn run_logs_dir(&self) -> PathBuf {
        self.state_root.join("run_logs")
    }

    pub fn log_file_for(&self, job_id: &str) -> PathBuf {
        self.run_logs_dir().join(format!("{job_id}.log"))
    }

    pub fn companies_dir(&self) -> PathBuf {
        self.state_root.join("companies")
    }

    pub fn uploaded_dir(&self) -> PathBuf {
        self.state_root.join("uploaded")
    }

    pub fn tokens_dir(&self) -> PathBuf {
        self.state_root.join("tokens")
    }

    // --- Time helpers ---

    pub fn business_tz(&self) -> Tz {
        resolve_timezone(&self.business_timezone).unwrap_or(chrono_tz::UTC)
    }

    /// Trading date for `now` in the configured business timezone.
    pub fn trading_date(&self, now: DateTime<Utc>) -> NaiveDate {
        business_trading_date(now, self.business_tz(), self.business_cutoff)
    }

    // --- Tunables with portal-settings overrides ---

    pub async fn effective_default_parallel(&self, store: &Store) -> i64 {
        match store.portal_settings().await.and_then(|s| s.default_parallel) {
            Some(value) => value.max(1),
            None => self.default_parallel,
        }
    }

    pub async fn effective_default_stagger_seconds(&self, store: &Store) -> i64 {
        match store
            .portal_settings()
            .await
            .and_then(|s| s.default_stagger_seconds)
        {
            Some(value) => value.max(0),
            None => self.default_stagger_seconds,
        }
    }

    pub async fn effective_refresh_expiring_days(&self, store: &Store) -> i64 {
        match store
            .portal_settings()
            .await
            .and_then(|s| s.refresh_expiring_days)
        {
            Some(value) => value.max(1),
            None => DEFAULT_REFRESH_EXPIRING_DAYS,
        }
    }

    pub async fn effective_stale_hours_warning(&self, store: &Store) -> i64 {
        match store
            .portal_settings()
            .await
            .and_then(|s| s.stale_hours_warning)
        {
            Some(value) => value.max(1),
            None => DEFAULT_STALE_HOURS_WARNING,
        }
    }

    pub async fn effective_reconcile_diff_warning(&self, store: &Store) -> f64 {
        match store
            .portal_settings()
            .await
            .and_then(|s| s.reconcile_diff_warning)
        {
            Some(value) => value.max(0.0),
            None => DEFAULT_RECONCILE_DIFF_WARNING,
        }
    }
}

fn default_state_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".tillsync"))
        .unwrap_or_else(|| PathBuf::from("./state"))
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_path(name: &str) -> Option<PathBuf> {
    env_str(name).map(PathBuf::from)
}

fn env_flag(name: &str, default: bool) -> bool {
    match env_str(name) {
        Some(raw) => matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn env_u64(name: &str, default: u64, minimum: u64) -> u64 {
    match env_str(name).and_then(|raw| raw.parse::<u64>().ok()) {
        Some(value) if value >= minimum => value,
        _ => default,
    }
}

fn env_u32(name: &str, default: u32, maximum: u32) -> u32 {
    match env_str(name).and_then(|raw| raw.parse::<u32>().ok()) {
        Some(value) if value <= maximum => value,
        _ => default,
    }
}

fn env_i64(name: &str, default: i64, minimum: i64) -> i64 {
    match env_str(name).and_then(|raw| raw.parse::<i64>().ok()) {
        Some(value) if value >= minimum => value,
        _ => default,
    }
}
