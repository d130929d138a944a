//! Artifact ingestion: metadata JSON files emitted by pipeline runs are
//! parsed into canonical store rows, deduplicated by content hash, and
//! linked to the job that produced them.
//!
//! Corrupt or unreadable files are skipped, never fatal: a bad file in the
//! uploaded tree must not stop the scan.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use tillsync_store::{Artifact, ArtifactInput, Job, JobScope, Reliability};

use crate::Orchestrator;

/// Rolling metadata files are rewritten in place by every run; their
/// contents are only reliable until the next run overwrites them.
const ROLLING_PREFIX: &str = "last_";

/// Filename suffix of transform metadata files in the uploaded tree.
const METADATA_SUFFIX: &str = "_transform.json";

/// A log is a plausible match for an artifact when its mtime is within
/// this window of the artifact's processing time.
const NEAREST_LOG_WINDOW_SECS: i64 = 12 * 3600;

/// How much of a log file to scan for a tenant-key mention.
const LOG_MENTION_SCAN_BYTES: usize = 50_000;

/// Score bonus (seconds) for logs that mention the tenant.
const LOG_MENTION_BONUS_SECS: f64 = 60.0;

/// Streaming SHA-256 of a file, hex-encoded.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn parse_date(value: Option<&Value>) -> Option<NaiveDate> {
    let raw = value?.as_str()?;
    if raw.len() < 10 {
        return None;
    }
    NaiveDate::parse_from_str(&raw[..10], "%Y-%m-%d").ok()
}

fn parse_datetime(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let raw = value?.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // Naive timestamps are taken as UTC.
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn value_as_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn value_as_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    }
}

fn reliability_for(path: &Path) -> Reliability {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    if name.starts_with(ROLLING_PREFIX) {
        Reliability::Warning
    } else {
        Reliability::High
    }
}

fn mtime_utc(path: &Path) -> Option<DateTime<Utc>> {
    let modified = path.metadata().ok()?.modified().ok()?;
    let secs = modified.duration_since(SystemTime::UNIX_EPOCH).ok()?;
    DateTime::from_timestamp(secs.as_secs() as i64, secs.subsec_nanos())
}

fn log_mentions_tenant(path: &Path, tenant_key: &str) -> bool {
    if tenant_key.is_empty() {
        return false;
    }
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut head = vec![0u8; LOG_MENTION_SCAN_BYTES];
    let mut filled = 0;
    while filled < head.len() {
        match file.read(&mut head[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return false,
        }
    }
    head.truncate(filled);
    String::from_utf8_lossy(&head).contains(tenant_key)
}

/// The run log most likely to belong to an artifact: closest mtime within
/// ±12 h of `processed_at`, preferring logs that mention the tenant.
/// Empty string when nothing qualifies.
fn nearest_log(run_logs_dir: &Path, processed_at: Option<DateTime<Utc>>, tenant_key: &str) -> String {
    let Some(processed_at) = processed_at else {
        return String::new();
    };
    let Ok(entries) = std::fs::read_dir(run_logs_dir) else {
        return String::new();
    };
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("log"))
        .collect();
    candidates.sort();

    let mut best: Option<(f64, PathBuf)> = None;
    for path in candidates {
        let Some(modified) = mtime_utc(&path) else {
            continue;
        };
        let delta = (modified - processed_at).num_seconds().abs();
        if delta > NEAREST_LOG_WINDOW_SECS {
            continue;
        }
        let mut score = delta as f64;
        if log_mentions_tenant(&path, tenant_key) {
            score -= LOG_MENTION_BONUS_SECS;
        }
        if best.as_ref().map_or(true, |(current, _)| score < *current) {
            best = Some((score, path));
        }
    }
    best.map(|(_, path)| path.display().to_string())
        .unwrap_or_default()
}

/// Parse one metadata file. Returns `None` for unreadable/corrupt files and
/// files without a tenant key; the caller logs and skips.
pub fn parse_metadata_file(path: &Path, run_logs_dir: &Path) -> Option<ArtifactInput> {
    let raw = std::fs::read_to_string(path).ok()?;
    let data: Value = serde_json::from_str(&raw).ok()?;

    let tenant_key = data
        .get("tenant_key")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if tenant_key.is_empty() {
        return None;
    }

    let source_hash = sha256_file(path).ok()?;
    let reconcile = match data.get("reconcile") {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        _ => Value::Object(serde_json::Map::new()),
    };
    let upload_stats = match data.get("upload_stats") {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        _ => Value::Object(serde_json::Map::new()),
    };
    let processed_files = match data.get("processed_files") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    let processed_at = parse_datetime(data.get("processed_at"));

    Some(ArtifactInput {
        nearest_log_file: nearest_log(run_logs_dir, processed_at, &tenant_key),
        target_date: parse_date(data.get("target_date")),
        processed_at,
        source_path: path.display().to_string(),
        source_hash,
        reliability: reliability_for(path),
        rows_total: value_as_i64(data.get("rows_total")),
        rows_kept: value_as_i64(data.get("rows_kept")),
        rows_non_target: value_as_i64(data.get("rows_non_target")),
        reconcile_status: reconcile
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        reconcile_difference: value_as_f64(reconcile.get("difference")),
        reconcile_epos_total: value_as_f64(reconcile.get("epos_total")),
        reconcile_qbo_total: value_as_f64(reconcile.get("qbo_total")),
        reconcile_epos_count: value_as_i64(reconcile.get("epos_count")),
        reconcile_qbo_count: value_as_i64(reconcile.get("qbo_count")),
        raw_file: data
            .get("raw_file")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        processed_files,
        upload_stats,
        tenant_key,
    })
}

/// Parse and upsert one metadata file. `None` when the file was skipped.
pub async fn ingest_metadata_file(
    orch: &Orchestrator,
    path: &Path,
    run_job: Option<&str>,
) -> Result<Option<(Artifact, bool)>> {
    let Some(input) = parse_metadata_file(path, &orch.config.run_logs_dir()) else {
        debug!("skipping unparseable metadata file: {}", path.display());
        return Ok(None);
    };
    let result = orch.store.ingest_artifact(&input, run_job).await?;
    Ok(Some(result))
}

/// All rolling metadata files under the uploaded tree, sorted by path.
fn rolling_metadata_files(uploaded_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(uploaded_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            name.starts_with(ROLLING_PREFIX) && name.ends_with(METADATA_SUFFIX)
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// Backfill artifacts from metadata files modified within the last `days`.
/// Returns how many rows were newly created.
pub async fn ingest_history(orch: &Orchestrator, days: i64) -> Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::days(days);
    let mut created_count = 0;
    for path in rolling_metadata_files(&orch.config.uploaded_dir()) {
        match mtime_utc(&path) {
            Some(modified) if modified >= cutoff => {}
            _ => continue,
        }
        match ingest_metadata_file(orch, &path, None).await {
            Ok(Some((_, true))) => created_count += 1,
            Ok(_) => {}
            Err(e) => warn!("failed to ingest {}: {e}", path.display()),
        }
    }
    Ok(created_count)
}

/// Link freshly ingested artifacts to the job that just finished.
///
/// For a single-tenant job, artifacts of other tenants are never linked;
/// if history left such a link pointing at this job, it is actively
/// removed. Returns how many artifacts ended up linked to the job.
pub async fn attach_recent_artifacts(orch: &Orchestrator, job: &Job) -> Result<usize> {
    let mut attached = 0;
    for path in rolling_metadata_files(&orch.config.uploaded_dir()) {
        let Some((artifact, _)) = ingest_metadata_file(orch, &path, None).await? else {
            continue;
        };
        if job.scope == JobScope::Single && Some(artifact.tenant_key.as_str()) != job.tenant_key.as_deref()
        {
            // Repair rule for historical cross-tenant links.
            if artifact.run_job.as_deref() == Some(job.id.as_str()) {
                orch.store.set_artifact_run_job(artifact.id, None).await?;
            }
            continue;
        }
        let mut run_job = artifact.run_job.clone();
        if run_job.is_none() {
            orch.store
                .set_artifact_run_job(artifact.id, Some(&job.id))
                .await?;
            run_job = Some(job.id.clone());
        }
        if run_job.as_deref() == Some(job.id.as_str()) {
            attached += 1;
        }
    }
    Ok(attached)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tillsync_store::{NewJob, Store};

    use crate::config::OrchestratorConfig;

    async fn orchestrator(dir: &Path) -> Orchestrator {
        let store = Store::in_memory().await.unwrap();
        store.init().await.unwrap();
        let config = OrchestratorConfig::for_state_root(dir);
        std::fs::create_dir_all(config.uploaded_dir()).unwrap();
        std::fs::create_dir_all(config.run_logs_dir()).unwrap();
        Orchestrator::new(Arc::new(store), Arc::new(config))
    }

    fn metadata_json(tenant: &str) -> String {
        format!(
            r#"{{
                "tenant_key": "{tenant}",
                "target_date": "2026-02-11",
                "processed_at": "2026-02-12T06:15:00Z",
                "rows_total": 120,
                "rows_kept": 118,
                "rows_non_target": 2,
                "upload_stats": {{ "uploaded": 118, "created": 0, "skipped": 0, "failed": 0 }},
                "reconcile": {{
                    "status": "MATCH",
                    "difference": 0.0,
                    "epos_total": 10250.5,
                    "qbo_total": 10250.5,
                    "epos_count": 118,
                    "qbo_count": 118
                }},
                "raw_file": "{tenant}_raw.csv",
                "processed_files": ["{tenant}_clean.csv"]
            }}"#
        )
    }

    fn write_metadata(orch: &Orchestrator, tenant: &str) -> PathBuf {
        let dir = orch.config.uploaded_dir().join(tenant);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("last_{tenant}_transform.json"));
        std::fs::write(&path, metadata_json(tenant)).unwrap();
        path
    }

    #[tokio::test]
    async fn parse_extracts_all_fields() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        let path = write_metadata(&orch, "acme");

        let input = parse_metadata_file(&path, &orch.config.run_logs_dir()).unwrap();
        assert_eq!(input.tenant_key, "acme");
        assert_eq!(input.target_date, NaiveDate::from_ymd_opt(2026, 2, 11));
        assert!(input.processed_at.is_some());
        assert_eq!(input.rows_total, Some(120));
        assert_eq!(input.reliability, Reliability::Warning);
        assert_eq!(input.reconcile_status, "MATCH");
        assert_eq!(input.reconcile_epos_total, Some(10250.5));
        assert_eq!(input.processed_files, vec!["acme_clean.csv".to_string()]);
        assert_eq!(input.source_hash.len(), 64);
    }

    #[tokio::test]
    async fn dated_snapshots_are_high_reliability() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        let path = orch.config.uploaded_dir().join("2026-02-11_acme_transform.json");
        std::fs::write(&path, metadata_json("acme")).unwrap();
        let input = parse_metadata_file(&path, &orch.config.run_logs_dir()).unwrap();
        assert_eq!(input.reliability, Reliability::High);
    }

    #[tokio::test]
    async fn missing_tenant_key_and_corrupt_json_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;

        let no_tenant = orch.config.uploaded_dir().join("last_x_transform.json");
        std::fs::write(&no_tenant, r#"{ "target_date": "2026-02-11" }"#).unwrap();
        assert!(parse_metadata_file(&no_tenant, &orch.config.run_logs_dir()).is_none());

        let corrupt = orch.config.uploaded_dir().join("last_y_transform.json");
        std::fs::write(&corrupt, "{ not json").unwrap();
        assert!(parse_metadata_file(&corrupt, &orch.config.run_logs_dir()).is_none());

        // And the ingest entry point treats both as non-fatal skips.
        assert!(ingest_metadata_file(&orch, &corrupt, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn ingesting_the_same_file_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        let path = write_metadata(&orch, "acme");

        let (first, created) = ingest_metadata_file(&orch, &path, None).await.unwrap().unwrap();
        assert!(created);
        let (second, created) = ingest_metadata_file(&orch, &path, None).await.unwrap().unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn ingest_history_respects_the_age_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        write_metadata(&orch, "acme");
        write_metadata(&orch, "globex");

        // Fresh files are picked up.
        assert_eq!(ingest_history(&orch, 60).await.unwrap(), 2);
        // Second pass creates nothing new.
        assert_eq!(ingest_history(&orch, 60).await.unwrap(), 0);
        // A zero-day window excludes everything older than now... files were
        // written moments ago, so use a negative cutoff to push it into the
        // future.
        assert_eq!(ingest_history(&orch, -1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn attach_links_matching_tenant_and_unlinks_foreign_ones() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        write_metadata(&orch, "acme");
        write_metadata(&orch, "globex");

        let job = orch.store.insert_job(NewJob::single("acme")).await.unwrap();

        let attached = attach_recent_artifacts(&orch, &job).await.unwrap();
        assert_eq!(attached, 1);

        let acme = orch
            .store
            .latest_artifact_for_tenant("acme")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acme.run_job.as_deref(), Some(job.id.as_str()));
        let globex = orch
            .store
            .latest_artifact_for_tenant("globex")
            .await
            .unwrap()
            .unwrap();
        assert!(globex.run_job.is_none());

        // A historical bad link from a foreign tenant to this job gets
        // repaired.
        orch.store
            .set_artifact_run_job(globex.id, Some(&job.id))
            .await
            .unwrap();
        attach_recent_artifacts(&orch, &job).await.unwrap();
        let globex = orch
            .store
            .latest_artifact_for_tenant("globex")
            .await
            .unwrap()
            .unwrap();
        assert!(globex.run_job.is_none());
    }

    #[tokio::test]
    async fn attach_for_all_scope_links_every_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        write_metadata(&orch, "acme");
        write_metadata(&orch, "globex");

        let job = orch.store.insert_job(NewJob::all()).await.unwrap();
        let attached = attach_recent_artifacts(&orch, &job).await.unwrap();
        assert_eq!(attached, 2);
    }

    #[tokio::test]
    async fn nearest_log_prefers_tenant_mentions_within_window() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        let logs = orch.config.run_logs_dir();

        // Two logs with current mtimes; processed_at must be near now for
        // the 12-hour window to include them.
        std::fs::write(logs.join("aaa.log"), "some other run\n").unwrap();
        std::fs::write(logs.join("bbb.log"), "processing tenant acme rows\n").unwrap();

        let found = nearest_log(&logs, Some(Utc::now()), "acme");
        assert!(found.ends_with("bbb.log"), "found: {found}");

        // Outside the window nothing matches.
        let found = nearest_log(
            &logs,
            Some(Utc::now() - chrono::Duration::hours(24)),
            "acme",
        );
        assert_eq!(found, "");
    }
}
