//! Schedule persistence and next-fire computation.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

use tillsync_protocol::{is_valid_tenant_key, resolve_timezone, CronExpr};

use crate::error::{Result, StoreError};
use crate::models::{JobScope, NewSchedule, Schedule, ScheduleLastResult};
use crate::Store;

/// Only supported target-date mode: the business trading date.
pub const TARGET_DATE_MODE_TRADING_DATE: &str = "trading_date";

impl NewSchedule {
    fn normalized(mut self) -> Result<Self> {
        if self.name.trim().is_empty() {
            return Err(StoreError::InvalidSchedule("name is required".to_string()));
        }
        CronExpr::validate(&self.cron_expr)
            .map_err(|e| StoreError::InvalidSchedule(format!("cron expression: {e}")))?;
        resolve_timezone(&self.timezone_name)
            .map_err(|e| StoreError::InvalidSchedule(e.to_string()))?;

        match self.scope {
            JobScope::Single => {
                let key = self.tenant_key.as_deref().unwrap_or("").trim().to_string();
                if key.is_empty() {
                    return Err(StoreError::InvalidSchedule(
                        "tenant key is required for single-tenant schedules".to_string(),
                    ));
                }
                if !is_valid_tenant_key(&key) {
                    return Err(StoreError::InvalidSchedule(format!(
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
        if self.parallel < 1 {
            return Err(StoreError::InvalidSchedule(
                "parallel must be >= 1".to_string(),
            ));
        }
        if self.stagger_seconds < 0 {
            return Err(StoreError::InvalidSchedule(
                "stagger_seconds must be >= 0".to_string(),
            ));
        }
        Ok(self)
    }
}

impl Schedule {
    /// Next firing strictly after `from`, in the schedule's timezone,
    /// returned in UTC.
    pub fn compute_next_fire_at(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let expr = CronExpr::parse(&self.cron_expr)
            .map_err(|e| StoreError::InvalidSchedule(format!("cron expression: {e}")))?;
        let tz = resolve_timezone(&self.timezone_name)
            .map_err(|e| StoreError::InvalidSchedule(e.to_string()))?;
        expr.next_fire_after(from, tz)
            .map_err(|e| StoreError::InvalidSchedule(e.to_string()))
    }
}

impl Store {
    pub async fn insert_schedule(&self, new: NewSchedule) -> Result<Schedule> {
        let new = new.normalized()?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO run_schedules (
                id, name, enabled, scope, tenant_key, cron_expr, timezone_name,
                target_date_mode, parallel, stagger_seconds, continue_on_failure,
                is_system_managed, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.name)
        .bind(new.enabled)
        .bind(new.scope)
        .bind(&new.tenant_key)
        .bind(&new.cron_expr)
        .bind(&new.timezone_name)
        .bind(TARGET_DATE_MODE_TRADING_DATE)
        .bind(new.parallel)
        .bind(new.stagger_seconds)
        .bind(new.continue_on_failure)
        .bind(new.is_system_managed)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;
        self.expect_schedule(&id).await
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let schedule = sqlx::query_as::<_, Schedule>("SELECT * FROM run_schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(schedule)
    }

    pub(crate) async fn expect_schedule(&self, id: &str) -> Result<Schedule> {
        self.get_schedule(id)
            .await?
            .ok_or_else(|| StoreError::ScheduleNotFound(id.to_string()))
    }

    pub async fn get_schedule_tx(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
    ) -> Result<Option<Schedule>> {
        let schedule = sqlx::query_as::<_, Schedule>("SELECT * FROM run_schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(schedule)
    }

    /// System-managed schedules are never deleted; the scheduler owns them.
    pub async fn delete_schedule(&self, id: &str) -> Result<()> {
        let schedule = self.expect_schedule(id).await?;
        if schedule.is_system_managed {
            return Err(StoreError::SystemManagedSchedule);
        }
        sqlx::query("DELETE FROM run_schedules WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn enabled_schedules_missing_next_fire(&self) -> Result<Vec<Schedule>> {
        let schedules = sqlx::query_as::<_, Schedule>(
            "SELECT * FROM run_schedules WHERE enabled = 1 AND next_fire_at IS NULL ORDER BY created_at",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(schedules)
    }

    /// Due schedules, oldest firing first, bounded by `limit`. Runs inside
    /// the scheduler's cycle transaction.
    pub async fn due_schedules_tx(
        &self,
        conn: &mut SqliteConnection,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Schedule>> {
        let schedules = sqlx::query_as::<_, Schedule>(
            r#"
            SELECT * FROM run_schedules
            WHERE enabled = 1 AND next_fire_at IS NOT NULL AND next_fire_at <= ?
            ORDER BY next_fire_at, created_at
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;
        Ok(schedules)
    }

    pub async fn set_next_fire(&self, id: &str, at: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query(
            "UPDATE run_schedules SET next_fire_at = ?, last_error = '', updated_at = ? WHERE id = ?",
        )
        .bind(at)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_next_fire_tx(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE run_schedules SET next_fire_at = ?, last_error = '', updated_at = ? WHERE id = ?",
        )
        .bind(at)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Record the outcome of processing a schedule. `fired_at` also stamps
    /// `last_fired_at` when set.
    pub async fn record_schedule_result(
        &self,
        id: &str,
        result: ScheduleLastResult,
        error: &str,
        fired_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE run_schedules
            SET last_result = ?, last_error = ?,
                last_fired_at = COALESCE(?, last_fired_at),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(result)
        .bind(error)
        .bind(fired_at)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn record_schedule_result_tx(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        result: ScheduleLastResult,
        error: &str,
        fired_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE run_schedules
            SET last_result = ?, last_error = ?,
                last_fired_at = COALESCE(?, last_fired_at),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(result)
        .bind(error)
        .bind(fired_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn set_schedule_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE run_schedules SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Update the cron/timezone pair of a system-managed schedule from the
    /// environment fallback values.
    pub async fn update_fallback_schedule(
        &self,
        id: &str,
        cron_expr: &str,
        timezone_name: &str,
        enabled: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE run_schedules SET cron_expr = ?, timezone_name = ?, enabled = ?, updated_at = ? WHERE id = ?",
        )
        .bind(cron_expr)
        .bind(timezone_name)
        .bind(enabled)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn enabled_user_schedule_exists(&self) -> Result<bool> {
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM run_schedules WHERE enabled = 1 AND is_system_managed = 0 LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;
        Ok(exists.is_some())
    }

    pub async fn enabled_system_schedules(&self) -> Result<Vec<Schedule>> {
        let schedules = sqlx::query_as::<_, Schedule>(
            "SELECT * FROM run_schedules WHERE is_system_managed = 1 AND enabled = 1",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(schedules)
    }

    /// Find or create the system-managed schedule with the given name.
    pub async fn get_or_create_system_schedule(
        &self,
        name: &str,
        defaults: NewSchedule,
    ) -> Result<(Schedule, bool)> {
        let existing = sqlx::query_as::<_, Schedule>(
            "SELECT * FROM run_schedules WHERE name = ? AND is_system_managed = 1 LIMIT 1",
        )
        .bind(name)
        .fetch_optional(self.pool())
        .await?;
        if let Some(schedule) = existing {
            return Ok((schedule, false));
        }
        let schedule = self
            .insert_schedule(NewSchedule {
                name: name.to_string(),
                is_system_managed: true,
                ..defaults
            })
            .await?;
        Ok((schedule, true))
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let schedules = sqlx::query_as::<_, Schedule>(
            "SELECT * FROM run_schedules ORDER BY name, created_at",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(schedules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn store() -> Store {
        let store = Store::in_memory().await.unwrap();
        store.init().await.unwrap();
        store
    }

    fn nightly() -> NewSchedule {
        NewSchedule {
            name: "Nightly".to_string(),
            cron_expr: "0 18 * * *".to_string(),
            timezone_name: "Africa/Lagos".to_string(),
            ..NewSchedule::default()
        }
    }

    #[tokio::test]
    async fn insert_validates_cron_and_timezone() {
        let store = store().await;
        assert!(store.insert_schedule(nightly()).await.is_ok());
        assert!(store
            .insert_schedule(NewSchedule {
                cron_expr: "not a cron".to_string(),
                ..nightly()
            })
            .await
            .is_err());
        assert!(store
            .insert_schedule(NewSchedule {
                timezone_name: "Not/AZone".to_string(),
                ..nightly()
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn single_scope_requires_tenant_and_forces_knobs() {
        let store = store().await;
        let err = store
            .insert_schedule(NewSchedule {
                scope: JobScope::Single,
                ..nightly()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidSchedule(_)));

        let schedule = store
            .insert_schedule(NewSchedule {
                scope: JobScope::Single,
                tenant_key: Some("acme".to_string()),
                parallel: 8,
                continue_on_failure: true,
                ..nightly()
            })
            .await
            .unwrap();
        assert_eq!(schedule.parallel, 1);
        assert!(!schedule.continue_on_failure);
    }

    #[tokio::test]
    async fn system_managed_schedules_cannot_be_deleted() {
        let store = store().await;
        let (schedule, created) = store
            .get_or_create_system_schedule("Legacy Env Fallback", nightly())
            .await
            .unwrap();
        assert!(created);
        assert!(matches!(
            store.delete_schedule(&schedule.id).await,
            Err(StoreError::SystemManagedSchedule)
        ));

        let (again, created) = store
            .get_or_create_system_schedule("Legacy Env Fallback", nightly())
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(again.id, schedule.id);
    }

    #[tokio::test]
    async fn due_selection_orders_and_bounds() {
        let store = store().await;
        let now = Utc::now();
        let mut ids = Vec::new();
        for i in 0..4 {
            let schedule = store
                .insert_schedule(NewSchedule {
                    name: format!("s{i}"),
                    ..nightly()
                })
                .await
                .unwrap();
            store
                .set_next_fire(&schedule.id, Some(now - chrono::Duration::minutes(10 - i)))
                .await
                .unwrap();
            ids.push(schedule.id);
        }

        let mut tx = store.begin().await.unwrap();
        let due = store.due_schedules_tx(&mut tx, now, 3).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(due.len(), 3);
        // Earliest next_fire_at first: s0 fired longest ago.
        assert_eq!(due[0].id, ids[0]);
        assert_eq!(due[1].id, ids[1]);
    }

    #[tokio::test]
    async fn compute_next_fire_matches_local_timezone() {
        let store = store().await;
        let schedule = store.insert_schedule(nightly()).await.unwrap();
        let from = Utc.with_ymd_and_hms(2026, 2, 20, 15, 0, 0).unwrap();
        let next = schedule.compute_next_fire_at(from).unwrap();
        // 18:00 Lagos == 17:00 UTC.
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 20, 17, 0, 0).unwrap());
    }
}
