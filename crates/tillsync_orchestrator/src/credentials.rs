//! Credential freshness probing.
//!
//! The OAuth dance itself is external; the core only needs to know how
//! fresh a tenant's accounting credentials are. The default implementation
//! reads the token files the external tooling maintains under
//! `<state>/tokens/<tenant>.json`.

use std::path::PathBuf;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use crate::tenants;

/// Severity bucket a freshness state maps to for health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialLevel {
    Ok,
    Warning,
    Critical,
}

/// Current credential freshness for one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialFreshness {
    /// No realm, no token file, or no refresh token: re-authentication is
    /// required before anything can run.
    Missing,
    /// The refresh token has expired.
    RefreshExpired,
    /// The refresh token expires within the warning window.
    RefreshExpiring { days: i64 },
    Connected,
}

impl CredentialFreshness {
    pub fn level(&self) -> CredentialLevel {
        match self {
            CredentialFreshness::Missing | CredentialFreshness::RefreshExpired => {
                CredentialLevel::Critical
            }
            CredentialFreshness::RefreshExpiring { .. } => CredentialLevel::Warning,
            CredentialFreshness::Connected => CredentialLevel::Ok,
        }
    }
}

/// Narrow interface the health classifier consumes.
pub trait CredentialProbe {
    fn probe(&self, tenant_key: &str, config: &Value) -> CredentialFreshness;
}

#[derive(Debug, Deserialize, Default)]
struct TokenFile {
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    refresh_expires_at: Option<i64>,
}

/// Probe backed by per-tenant token files (epoch-second expiries).
pub struct TokenFileProbe {
    tokens_dir: PathBuf,
    refresh_expiring_days: i64,
}

impl TokenFileProbe {
    pub fn new(tokens_dir: impl Into<PathBuf>, refresh_expiring_days: i64) -> Self {
        Self {
            tokens_dir: tokens_dir.into(),
            refresh_expiring_days: refresh_expiring_days.max(1),
        }
    }
}

impl CredentialProbe for TokenFileProbe {
    fn probe(&self, tenant_key: &str, config: &Value) -> CredentialFreshness {
        if tenants::realm_id(config).is_none() {
            return CredentialFreshness::Missing;
        }
        let path = self.tokens_dir.join(format!("{tenant_key}.json"));
        let tokens: TokenFile = match std::fs::read(&path)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
        {
            Some(tokens) => tokens,
            None => return CredentialFreshness::Missing,
        };
        if tokens
            .refresh_token
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .is_empty()
        {
            return CredentialFreshness::Missing;
        }
        // The access token is allowed to be stale; it refreshes during sync.
        let _ = tokens.expires_at;

        let Some(refresh_expires_at) = tokens.refresh_expires_at else {
            return CredentialFreshness::Connected;
        };
        let seconds_left = refresh_expires_at - Utc::now().timestamp();
        if seconds_left <= 0 {
            return CredentialFreshness::RefreshExpired;
        }
        if seconds_left <= self.refresh_expiring_days * 86_400 {
            let days = (seconds_left + 86_399) / 86_400;
            return CredentialFreshness::RefreshExpiring { days: days.max(1) };
        }
        CredentialFreshness::Connected
    }
}
