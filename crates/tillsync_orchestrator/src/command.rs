//! Subprocess argv construction for the pipeline contract.
//!
//! Single-tenant runs use the `pipeline` binary, all-tenant runs the
//! `all-tenants` binary. The working directory is always the pipeline root;
//! relative binary paths are resolved against it.

use std::path::PathBuf;

use tillsync_store::{Job, JobScope};

use crate::config::OrchestratorConfig;

/// A ready-to-spawn command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl RunCommand {
    /// Human-readable command line for run bookkeeping.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

pub fn build_command(job: &Job, config: &OrchestratorConfig) -> RunCommand {
    let (bin, mut args) = match job.scope {
        JobScope::Single => {
            let tenant = job.tenant_key.clone().unwrap_or_default();
            (
                &config.single_tenant_bin,
                vec!["--tenant".to_string(), tenant],
            )
        }
        JobScope::All => (
            &config.all_tenants_bin,
            vec![
                "--parallel".to_string(),
                job.parallel.to_string(),
                "--stagger-seconds".to_string(),
                job.stagger_seconds.to_string(),
            ],
        ),
    };
    if job.scope == JobScope::All && job.continue_on_failure {
        args.push("--continue-on-failure".to_string());
    }

    if let Some(target_date) = job.target_date {
        args.push("--target-date".to_string());
        args.push(target_date.format("%Y-%m-%d").to_string());
    } else if let (Some(from), Some(to)) = (job.from_date, job.to_date) {
        args.push("--from-date".to_string());
        args.push(from.format("%Y-%m-%d").to_string());
        args.push("--to-date".to_string());
        args.push(to.format("%Y-%m-%d").to_string());
        if job.skip_download {
            args.push("--skip-download".to_string());
        }
    }

    let program = if bin.is_absolute() {
        bin.clone()
    } else {
        config.pipeline_root.join(bin)
    };
    RunCommand { program, args }
}
