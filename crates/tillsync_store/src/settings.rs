//! Portal settings singleton with a short-lived process cache.
//!
//! A non-null field overrides the environment default; null means "use
//! env/default". Reads go through a ~30 s snapshot cache so hot paths do not
//! hit the database; every write invalidates the cache. A transient database
//! failure yields an empty snapshot and is deliberately not cached.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::warn;

use crate::error::Result;
use crate::models::PortalSettingsRow;
use crate::Store;

/// How long a snapshot may be served before re-reading the database.
const SETTINGS_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub(crate) struct SettingsCacheState {
    snapshot: Option<Option<PortalSettingsRow>>,
    fetched_at: Option<Instant>,
}

impl Store {
    /// Cached settings snapshot. `None` when no row exists (all defaults) or
    /// the database is temporarily unavailable.
    pub async fn portal_settings(&self) -> Option<PortalSettingsRow> {
        {
            let cache = match self.settings_cache.lock() {
                Ok(cache) => cache,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let (Some(snapshot), Some(at)) = (&cache.snapshot, cache.fetched_at) {
                if at.elapsed() < SETTINGS_CACHE_TTL {
                    return snapshot.clone();
                }
            }
        }

        match self.load_settings_row().await {
            Ok(snapshot) => {
                let mut cache = match self.settings_cache.lock() {
                    Ok(cache) => cache,
                    Err(poisoned) => poisoned.into_inner(),
                };
                cache.snapshot = Some(snapshot.clone());
                cache.fetched_at = Some(Instant::now());
                snapshot
            }
            Err(e) => {
                warn!("portal settings unavailable, using defaults: {e}");
                None
            }
        }
    }

    async fn load_settings_row(&self) -> Result<Option<PortalSettingsRow>> {
        let row = sqlx::query_as::<_, PortalSettingsRow>(
            r#"
            SELECT default_parallel, default_stagger_seconds, stale_hours_warning,
                   refresh_expiring_days, reconcile_diff_warning, reauth_guidance,
                   dashboard_timezone
            FROM portal_settings WHERE id = 1
            "#,
        )
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Upsert the singleton row. Fires the cache invalidation hook.
    pub async fn save_portal_settings(&self, row: &PortalSettingsRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO portal_settings (
                id, default_parallel, default_stagger_seconds, stale_hours_warning,
                refresh_expiring_days, reconcile_diff_warning, reauth_guidance,
                dashboard_timezone, updated_at
            )
            VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                default_parallel = excluded.default_parallel,
                default_stagger_seconds = excluded.default_stagger_seconds,
                stale_hours_warning = excluded.stale_hours_warning,
                refresh_expiring_days = excluded.refresh_expiring_days,
                reconcile_diff_warning = excluded.reconcile_diff_warning,
                reauth_guidance = excluded.reauth_guidance,
                dashboard_timezone = excluded.dashboard_timezone,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(row.default_parallel)
        .bind(row.default_stagger_seconds)
        .bind(row.stale_hours_warning)
        .bind(row.refresh_expiring_days)
        .bind(row.reconcile_diff_warning)
        .bind(&row.reauth_guidance)
        .bind(&row.dashboard_timezone)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        self.invalidate_settings_cache();
        Ok(())
    }

    /// Clear the in-process snapshot cache. Called after settings writes.
    pub fn invalidate_settings_cache(&self) {
        let mut cache = match self.settings_cache.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.snapshot = None;
        cache.fetched_at = None;
    }
}
