//! Per-tenant health classification.
//!
//! A pure decision table over the tenant config, credential freshness, the
//! latest job, and the latest artifact. Rules are evaluated in order; the
//! first match decides the level, and every matching rule contributes its
//! reason code. Run activity is derived from the latest job independently
//! of the level.

use anyhow::Result;
use serde_json::Value;

use tillsync_store::{Artifact, Job, JobStatus};

use crate::credentials::{CredentialFreshness, CredentialLevel, CredentialProbe};
use crate::{tenants, Orchestrator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

impl HealthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Warning => "warning",
            HealthLevel::Critical => "critical",
            HealthLevel::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunActivity {
    Idle,
    Running,
    Queued,
    Cancelled,
}

impl RunActivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunActivity::Idle => "idle",
            RunActivity::Running => "running",
            RunActivity::Queued => "queued",
            RunActivity::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    EposConfigMissing,
    TokenCritical,
    LatestRunFailed,
    UploadFailure,
    TokenExpiringSoon,
    NoArtifactMetadata,
    ReconMismatch,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::EposConfigMissing => "EPOS_CONFIG_MISSING",
            ReasonCode::TokenCritical => "TOKEN_CRITICAL",
            ReasonCode::LatestRunFailed => "LATEST_RUN_FAILED",
            ReasonCode::UploadFailure => "UPLOAD_FAILURE",
            ReasonCode::TokenExpiringSoon => "TOKEN_EXPIRING_SOON",
            ReasonCode::NoArtifactMetadata => "NO_ARTIFACT_METADATA",
            ReasonCode::ReconMismatch => "RECON_MISMATCH",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub level: HealthLevel,
    pub reason_codes: Vec<ReasonCode>,
    pub run_activity: RunActivity,
}

/// Inputs gathered by the caller; classification itself touches nothing
/// but these.
#[derive(Debug)]
pub struct HealthInputs<'a> {
    pub has_credential_env_keys: bool,
    pub credential: CredentialFreshness,
    pub latest_job: Option<&'a Job>,
    pub latest_artifact: Option<&'a Artifact>,
    /// Absolute reconcile difference above which a mismatch warning fires.
    pub reconcile_diff_warning: f64,
}

pub fn classify(inputs: &HealthInputs<'_>) -> HealthSnapshot {
    let mut matches: Vec<(HealthLevel, ReasonCode)> = Vec::new();

    if !inputs.has_credential_env_keys {
        matches.push((HealthLevel::Warning, ReasonCode::EposConfigMissing));
    }
    if inputs.credential.level() == CredentialLevel::Critical {
        matches.push((HealthLevel::Critical, ReasonCode::TokenCritical));
    }
    if inputs
        .latest_job
        .map(|job| job.status == JobStatus::Failed)
        .unwrap_or(false)
    {
        matches.push((HealthLevel::Critical, ReasonCode::LatestRunFailed));
    }
    if inputs
        .latest_artifact
        .map(|artifact| artifact.failed_uploads() > 0)
        .unwrap_or(false)
    {
        matches.push((HealthLevel::Critical, ReasonCode::UploadFailure));
    }
    if inputs.credential.level() == CredentialLevel::Warning {
        matches.push((HealthLevel::Warning, ReasonCode::TokenExpiringSoon));
    }
    if inputs.latest_artifact.is_none() {
        matches.push((HealthLevel::Unknown, ReasonCode::NoArtifactMetadata));
    }
    if let Some(difference) = inputs
        .latest_artifact
        .and_then(|artifact| artifact.reconcile_difference)
    {
        if difference.abs() > inputs.reconcile_diff_warning {
            matches.push((HealthLevel::Warning, ReasonCode::ReconMismatch));
        }
    }

    let level = matches
        .first()
        .map(|(level, _)| *level)
        .unwrap_or(HealthLevel::Healthy);
    HealthSnapshot {
        level,
        reason_codes: matches.into_iter().map(|(_, reason)| reason).collect(),
        run_activity: run_activity_of(inputs.latest_job),
    }
}

fn run_activity_of(latest_job: Option<&Job>) -> RunActivity {
    match latest_job.map(|job| job.status) {
        Some(JobStatus::Running) => RunActivity::Running,
        Some(JobStatus::Queued) => RunActivity::Queued,
        Some(JobStatus::Cancelled) => RunActivity::Cancelled,
        _ => RunActivity::Idle,
    }
}

/// Gather inputs for one tenant from the store and classify.
pub async fn tenant_health(
    orch: &Orchestrator,
    probe: &dyn CredentialProbe,
    tenant_key: &str,
    config: &Value,
) -> Result<HealthSnapshot> {
    let latest_job = orch.store.latest_job_for_tenant(tenant_key).await?;
    let latest_artifact = orch.store.latest_artifact_for_tenant(tenant_key).await?;
    let inputs = HealthInputs {
        has_credential_env_keys: tenants::has_credential_env_keys(config),
        credential: probe.probe(tenant_key, config),
        latest_job: latest_job.as_ref(),
        latest_artifact: latest_artifact.as_ref(),
        reconcile_diff_warning: orch
            .config
            .effective_reconcile_diff_warning(&orch.store)
            .await,
    };
    Ok(classify(&inputs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn artifact(failed_uploads: i64, reconcile_difference: Option<f64>) -> Artifact {
        Artifact {
            id: 1,
            run_job: None,
            tenant_key: "acme".to_string(),
            target_date: None,
            processed_at: None,
            source_path: "/tmp/health-matrix.json".to_string(),
            source_hash: "health-matrix".to_string(),
            reliability: tillsync_store::Reliability::High,
            rows_total: None,
            rows_kept: None,
            rows_non_target: None,
            upload_stats: format!(r#"{{"failed": {failed_uploads}}}"#),
            reconcile_status: String::new(),
            reconcile_difference,
            reconcile_epos_total: None,
            reconcile_qbo_total: None,
            reconcile_epos_count: None,
            reconcile_qbo_count: None,
            raw_file: String::new(),
            processed_files: "[]".to_string(),
            nearest_log_file: String::new(),
            imported_at: Utc::now(),
        }
    }

    fn job(status: JobStatus) -> Job {
        Job {
            id: "job-1".to_string(),
            scope: tillsync_store::JobScope::Single,
            tenant_key: Some("acme".to_string()),
            target_date: None,
            from_date: None,
            to_date: None,
            skip_download: false,
            parallel: 1,
            stagger_seconds: 0,
            continue_on_failure: false,
            command_display: None,
            status,
            pid: None,
            exit_code: None,
            log_file_path: None,
            failure_reason: None,
            requested_by: None,
            scheduled_by: None,
            queued_at: Utc::now(),
            dispatched_at: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        }
    }

    struct Case {
        name: &'static str,
        has_keys: bool,
        credential: CredentialFreshness,
        artifact: Option<Artifact>,
        job: Option<Job>,
        expected_level: HealthLevel,
        expected_reason: Option<ReasonCode>,
        expected_activity: Option<RunActivity>,
    }

    #[test]
    fn classifier_matrix_levels_and_reasons() {
        let cases = [
            Case {
                name: "missing credential env keys",
                has_keys: false,
                credential: CredentialFreshness::Connected,
                artifact: Some(artifact(0, None)),
                job: None,
                expected_level: HealthLevel::Warning,
                expected_reason: Some(ReasonCode::EposConfigMissing),
                expected_activity: None,
            },
            Case {
                name: "critical token",
                has_keys: true,
                credential: CredentialFreshness::Missing,
                artifact: Some(artifact(0, None)),
                job: None,
                expected_level: HealthLevel::Critical,
                expected_reason: Some(ReasonCode::TokenCritical),
                expected_activity: None,
            },
            Case {
                name: "failed latest run",
                has_keys: true,
                credential: CredentialFreshness::Connected,
                artifact: Some(artifact(0, None)),
                job: Some(job(JobStatus::Failed)),
                expected_level: HealthLevel::Critical,
                expected_reason: Some(ReasonCode::LatestRunFailed),
                expected_activity: None,
            },
            Case {
                name: "failed uploads",
                has_keys: true,
                credential: CredentialFreshness::Connected,
                artifact: Some(artifact(2, None)),
                job: None,
                expected_level: HealthLevel::Critical,
                expected_reason: Some(ReasonCode::UploadFailure),
                expected_activity: None,
            },
            Case {
                name: "token expiring",
                has_keys: true,
                credential: CredentialFreshness::RefreshExpiring { days: 2 },
                artifact: Some(artifact(0, None)),
                job: None,
                expected_level: HealthLevel::Warning,
                expected_reason: Some(ReasonCode::TokenExpiringSoon),
                expected_activity: None,
            },
            Case {
                name: "no artifact yet",
                has_keys: true,
                credential: CredentialFreshness::Connected,
                artifact: None,
                job: None,
                expected_level: HealthLevel::Unknown,
                expected_reason: Some(ReasonCode::NoArtifactMetadata),
                expected_activity: None,
            },
            Case {
                name: "reconciliation mismatch",
                has_keys: true,
                credential: CredentialFreshness::Connected,
                artifact: Some(artifact(0, Some(2.25))),
                job: None,
                expected_level: HealthLevel::Warning,
                expected_reason: Some(ReasonCode::ReconMismatch),
                expected_activity: None,
            },
            Case {
                name: "healthy with running activity",
                has_keys: true,
                credential: CredentialFreshness::Connected,
                artifact: Some(artifact(0, None)),
                job: Some(job(JobStatus::Running)),
                expected_level: HealthLevel::Healthy,
                expected_reason: None,
                expected_activity: Some(RunActivity::Running),
            },
        ];

        for case in cases {
            let snapshot = classify(&HealthInputs {
                has_credential_env_keys: case.has_keys,
                credential: case.credential,
                latest_job: case.job.as_ref(),
                latest_artifact: case.artifact.as_ref(),
                reconcile_diff_warning: 1.0,
            });
            assert_eq!(snapshot.level, case.expected_level, "{}", case.name);
            match case.expected_reason {
                Some(reason) => assert!(
                    snapshot.reason_codes.contains(&reason),
                    "{}: {:?}",
                    case.name,
                    snapshot.reason_codes
                ),
                None => assert!(
                    snapshot.reason_codes.is_empty(),
                    "{}: {:?}",
                    case.name,
                    snapshot.reason_codes
                ),
            }
            if let Some(activity) = case.expected_activity {
                assert_eq!(snapshot.run_activity, activity, "{}", case.name);
            }
        }
    }

    #[test]
    fn first_match_wins_but_all_reasons_are_reported() {
        // Config-missing is rule 1, so it decides the level even though
        // later rules are critical; every match still lands in the list.
        let snapshot = classify(&HealthInputs {
            has_credential_env_keys: false,
            credential: CredentialFreshness::Missing,
            latest_job: None,
            latest_artifact: Some(&artifact(3, Some(5.0))),
            reconcile_diff_warning: 1.0,
        });
        assert_eq!(snapshot.level, HealthLevel::Warning);
        assert_eq!(
            snapshot.reason_codes,
            vec![
                ReasonCode::EposConfigMissing,
                ReasonCode::TokenCritical,
                ReasonCode::UploadFailure,
                ReasonCode::ReconMismatch,
            ]
        );
    }

    #[test]
    fn small_reconcile_difference_is_healthy() {
        let snapshot = classify(&HealthInputs {
            has_credential_env_keys: true,
            credential: CredentialFreshness::Connected,
            latest_job: Some(&job(JobStatus::Succeeded)),
            latest_artifact: Some(&artifact(0, Some(0.5))),
            reconcile_diff_warning: 1.0,
        });
        assert_eq!(snapshot.level, HealthLevel::Healthy);
        assert!(snapshot.reason_codes.is_empty());
        assert_eq!(snapshot.run_activity, RunActivity::Idle);
    }

    #[test]
    fn run_activity_tracks_latest_job() {
        for (status, expected) in [
            (JobStatus::Queued, RunActivity::Queued),
            (JobStatus::Running, RunActivity::Running),
            (JobStatus::Cancelled, RunActivity::Cancelled),
            (JobStatus::Succeeded, RunActivity::Idle),
            (JobStatus::Failed, RunActivity::Idle),
        ] {
            let activity = run_activity_of(Some(&job(status)));
            assert_eq!(activity, expected, "{status}");
        }
        assert_eq!(run_activity_of(None), RunActivity::Idle);
    }
}
