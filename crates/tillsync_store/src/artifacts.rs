//! Canonical artifact rows: one per (tenant, target date, processed-at,
//! source hash). Ingesting the same physical file twice is idempotent, and
//! repeat ingests only ever add information.

use chrono::Utc;

use crate::error::Result;
use crate::models::{Artifact, ArtifactInput, Reliability};
use crate::Store;

impl Store {
    /// Atomic upsert on the uniqueness tuple. Returns the row and whether it
    /// was newly created.
    ///
    /// On conflict only monotonic updates are applied: the job link if
    /// unset, the source path if empty, reliability upgrades
    /// (warning -> high, never the reverse), and reconcile fields that are
    /// currently null. A present reconcile value is never overwritten.
    pub async fn ingest_artifact(
        &self,
        input: &ArtifactInput,
        run_job: Option<&str>,
    ) -> Result<(Artifact, bool)> {
        let mut tx = self.begin().await?;

        let existing = sqlx::query_as::<_, Artifact>(
            r#"
            SELECT * FROM run_artifacts
            WHERE tenant_key = ? AND target_date IS ? AND processed_at IS ? AND source_hash = ?
            "#,
        )
        .bind(&input.tenant_key)
        .bind(input.target_date)
        .bind(input.processed_at)
        .bind(&input.source_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let (id, created) = match existing {
            None => {
                let id: i64 = sqlx::query_scalar(
                    r#"
                    INSERT INTO run_artifacts (
                        run_job, tenant_key, target_date, processed_at, source_path,
                        source_hash, reliability, rows_total, rows_kept, rows_non_target,
                        upload_stats, reconcile_status, reconcile_difference,
                        reconcile_epos_total, reconcile_qbo_total, reconcile_epos_count,
                        reconcile_qbo_count, raw_file, processed_files, nearest_log_file,
                        imported_at
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    RETURNING id
                    "#,
                )
                .bind(run_job)
                .bind(&input.tenant_key)
                .bind(input.target_date)
                .bind(input.processed_at)
                .bind(&input.source_path)
                .bind(&input.source_hash)
                .bind(input.reliability)
                .bind(input.rows_total)
                .bind(input.rows_kept)
                .bind(input.rows_non_target)
                .bind(input.upload_stats.to_string())
                .bind(&input.reconcile_status)
                .bind(input.reconcile_difference)
                .bind(input.reconcile_epos_total)
                .bind(input.reconcile_qbo_total)
                .bind(input.reconcile_epos_count)
                .bind(input.reconcile_qbo_count)
                .bind(&input.raw_file)
                .bind(
                    serde_json::to_string(&input.processed_files)
                        .unwrap_or_else(|_| "[]".to_string()),
                )
                .bind(&input.nearest_log_file)
                .bind(Utc::now())
                .fetch_one(&mut *tx)
                .await?;
                (id, true)
            }
            Some(row) => {
                let upgrade_reliability = row.reliability == Reliability::Warning
                    && input.reliability == Reliability::High;
                sqlx::query(
                    r#"
                    UPDATE run_artifacts
                    SET run_job = COALESCE(run_job, ?),
                        source_path = CASE WHEN source_path = '' THEN ? ELSE source_path END,
                        reliability = CASE WHEN ? THEN 'high' ELSE reliability END,
                        reconcile_status = CASE WHEN reconcile_status = '' THEN ? ELSE reconcile_status END,
                        reconcile_difference = COALESCE(reconcile_difference, ?),
                        reconcile_epos_total = COALESCE(reconcile_epos_total, ?),
                        reconcile_qbo_total = COALESCE(reconcile_qbo_total, ?),
                        reconcile_epos_count = COALESCE(reconcile_epos_count, ?),
                        reconcile_qbo_count = COALESCE(reconcile_qbo_count, ?)
                    WHERE id = ?
                    "#,
                )
                .bind(run_job)
                .bind(&input.source_path)
                .bind(upgrade_reliability)
                .bind(&input.reconcile_status)
                .bind(input.reconcile_difference)
                .bind(input.reconcile_epos_total)
                .bind(input.reconcile_qbo_total)
                .bind(input.reconcile_epos_count)
                .bind(input.reconcile_qbo_count)
                .bind(row.id)
                .execute(&mut *tx)
                .await?;
                (row.id, false)
            }
        };

        let artifact = sqlx::query_as::<_, Artifact>("SELECT * FROM run_artifacts WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok((artifact, created))
    }

    /// Latest artifact for a tenant by processing time, then import time.
    pub async fn latest_artifact_for_tenant(&self, tenant_key: &str) -> Result<Option<Artifact>> {
        let artifact = sqlx::query_as::<_, Artifact>(
            r#"
            SELECT * FROM run_artifacts
            WHERE tenant_key = ?
            ORDER BY processed_at DESC, imported_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_key)
        .fetch_optional(self.pool())
        .await?;
        Ok(artifact)
    }

    /// Link or unlink an artifact's producing job.
    pub async fn set_artifact_run_job(&self, id: i64, run_job: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE run_artifacts SET run_job = ? WHERE id = ?")
            .bind(run_job)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn artifacts_for_job(&self, job_id: &str) -> Result<Vec<Artifact>> {
        let artifacts = sqlx::query_as::<_, Artifact>(
            "SELECT * FROM run_artifacts WHERE run_job = ? ORDER BY processed_at DESC, imported_at DESC",
        )
        .bind(job_id)
        .fetch_all(self.pool())
        .await?;
        Ok(artifacts)
    }
}
