//! Small shared value types: tenant keys, run sources, timezone resolution.

use thiserror::Error;

/// Maximum length of a tenant key slug.
pub const TENANT_KEY_MAX_LEN: usize = 64;

/// Environment variable carrying the trigger source into the subprocess.
pub const ENV_RUN_SOURCE: &str = "ORCHESTRATOR_RUN_SOURCE";

/// Environment variable telling the subprocess the global lock is already
/// held by its parent, so it must not try to re-acquire it.
pub const ENV_LOCK_HELD: &str = "ORCHESTRATOR_LOCK_HELD";

/// Tenant keys are short stable slugs: lowercase alphanumerics, `_`, `-`.
pub fn is_valid_tenant_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= TENANT_KEY_MAX_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Where a run was triggered from. Propagated to the subprocess via
/// [`ENV_RUN_SOURCE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunSource {
    Dashboard,
    Scheduler,
    Cli,
}

impl RunSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunSource::Dashboard => "dashboard",
            RunSource::Scheduler => "scheduler",
            RunSource::Cli => "cli",
        }
    }
}

impl std::fmt::Display for RunSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown timezone: {0}")]
pub struct TimezoneError(pub String);

/// Resolve an IANA timezone name.
pub fn resolve_timezone(name: &str) -> Result<chrono_tz::Tz, TimezoneError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(TimezoneError(name.to_string()));
    }
    trimmed
        .parse::<chrono_tz::Tz>()
        .map_err(|_| TimezoneError(trimmed.to_string()))
}
