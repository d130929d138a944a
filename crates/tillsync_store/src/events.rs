//! Append-only schedule event log.
//!
//! Events carry a payload snapshot of the schedule identity so history
//! survives schedule deletion (the foreign key nulls out, the payload does
//! not).

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::SqliteConnection;

use crate::error::Result;
use crate::models::{EventType, Schedule, ScheduleEvent};
use crate::Store;

fn payload_with_schedule_defaults(schedule: Option<&Schedule>, extra: Option<Value>) -> String {
    let mut payload = match extra {
        Some(Value::Object(map)) => Value::Object(map),
        Some(other) => json!({ "value": other }),
        None => json!({}),
    };
    if let (Some(schedule), Some(map)) = (schedule, payload.as_object_mut()) {
        map.entry("schedule_id".to_string())
            .or_insert_with(|| Value::String(schedule.id.clone()));
        map.entry("schedule_name".to_string())
            .or_insert_with(|| Value::String(schedule.name.clone()));
        map.entry("schedule_scope".to_string())
            .or_insert_with(|| Value::String(schedule.scope.as_str().to_string()));
    }
    payload.to_string()
}

impl Store {
    pub async fn append_event(
        &self,
        schedule: Option<&Schedule>,
        run_job: Option<&str>,
        event_type: EventType,
        message: &str,
        extra: Option<Value>,
    ) -> Result<ScheduleEvent> {
        let mut tx = self.begin().await?;
        let event = self
            .append_event_tx(&mut tx, schedule, run_job, event_type, message, extra)
            .await?;
        tx.commit().await?;
        Ok(event)
    }

    pub async fn append_event_tx(
        &self,
        conn: &mut SqliteConnection,
        schedule: Option<&Schedule>,
        run_job: Option<&str>,
        event_type: EventType,
        message: &str,
        extra: Option<Value>,
    ) -> Result<ScheduleEvent> {
        let payload = payload_with_schedule_defaults(schedule, extra);
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO schedule_events (schedule_id, run_job, event_type, message, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(schedule.map(|s| s.id.as_str()))
        .bind(run_job)
        .bind(event_type)
        .bind(message)
        .bind(&payload)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await?;
        let event = sqlx::query_as::<_, ScheduleEvent>("SELECT * FROM schedule_events WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *conn)
            .await?;
        Ok(event)
    }

    pub async fn events_for_schedule(&self, schedule_id: &str) -> Result<Vec<ScheduleEvent>> {
        let events = sqlx::query_as::<_, ScheduleEvent>(
            "SELECT * FROM schedule_events WHERE schedule_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(schedule_id)
        .fetch_all(self.pool())
        .await?;
        Ok(events)
    }

    pub async fn events_of_type(&self, event_type: EventType) -> Result<Vec<ScheduleEvent>> {
        let events = sqlx::query_as::<_, ScheduleEvent>(
            "SELECT * FROM schedule_events WHERE event_type = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(event_type)
        .fetch_all(self.pool())
        .await?;
        Ok(events)
    }

    pub async fn events_for_job(&self, job_id: &str) -> Result<Vec<ScheduleEvent>> {
        let events = sqlx::query_as::<_, ScheduleEvent>(
            "SELECT * FROM schedule_events WHERE run_job = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(job_id)
        .fetch_all(self.pool())
        .await?;
        Ok(events)
    }
}
