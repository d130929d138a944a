//! Scheduler worker heartbeat singleton (row id=1).
//!
//! Updated at the end of every scheduler cycle; the UI uses it to tell
//! whether the scheduler daemon is alive.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::Store;

impl Store {
    pub async fn record_heartbeat(&self, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_heartbeat (id, last_seen) VALUES (1, ?)
            ON CONFLICT (id) DO UPDATE SET last_seen = excluded.last_seen
            "#,
        )
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn heartbeat(&self) -> Result<Option<DateTime<Utc>>> {
        let last_seen: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT last_seen FROM scheduler_heartbeat WHERE id = 1")
                .fetch_optional(self.pool())
                .await?;
        Ok(last_seen)
    }
}
