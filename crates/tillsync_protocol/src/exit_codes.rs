//! Exit-code guide for pipeline subprocesses.
//!
//! Codes 3 and -1 are synthesized by the orchestrator itself (spawn failure
//! and reconciled stale run); everything else comes from the subprocess.

/// Exit code synthesized when the subprocess could not be started.
pub const EXIT_CODE_SPAWN_FAILED: i64 = 3;

/// Exit code synthesized when the reconciler reaps a dead run.
pub const EXIT_CODE_RECONCILED: i64 = -1;

/// Interpretation of one exit code for operators.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ExitCodeInfo {
    pub label: &'static str,
    pub description: String,
}

/// Reference table rendered on the run-detail page.
pub const EXIT_CODE_REFERENCE: &[(&str, &str)] = &[
    ("0", "Success."),
    ("1", "Pipeline failed during execution. Check the live log for the root cause."),
    ("2", "Run blocked by an active lock or invalid CLI usage."),
    ("3", "Orchestrator failed to start the subprocess."),
    ("-1", "Run reconciler marked a stale process as failed (PID not alive)."),
    ("126", "Subprocess command invoked but not executable."),
    ("127", "Subprocess command or required dependency not found."),
];

/// Describe a captured exit code.
pub fn exit_code_info(code: i64) -> ExitCodeInfo {
    match code {
        0 => ExitCodeInfo {
            label: "Success",
            description: "Process completed normally.".to_string(),
        },
        1 => ExitCodeInfo {
            label: "Pipeline failure",
            description:
                "The pipeline reported an execution error. Check the live log for the underlying phase error."
                    .to_string(),
        },
        2 => ExitCodeInfo {
            label: "Blocked or invalid invocation",
            description:
                "Usually means a run lock blocked execution or CLI arguments were invalid."
                    .to_string(),
        },
        EXIT_CODE_SPAWN_FAILED => ExitCodeInfo {
            label: "Subprocess start failure",
            description: "The orchestrator could not start the runner subprocess.".to_string(),
        },
        EXIT_CODE_RECONCILED => ExitCodeInfo {
            label: "Reconciled stale run",
            description:
                "The reaper marked a stuck running job as failed because its PID was no longer alive."
                    .to_string(),
        },
        126 => ExitCodeInfo {
            label: "Not executable",
            description: "Command exists but is not executable in the current environment."
                .to_string(),
        },
        127 => ExitCodeInfo {
            label: "Command missing",
            description: "Command or required runtime dependency could not be found.".to_string(),
        },
        code if code < 0 => ExitCodeInfo {
            label: "Terminated by signal",
            description: format!("Process ended from OS signal {}.", -code),
        },
        _ => ExitCodeInfo {
            label: "Unhandled non-zero exit",
            description:
                "Process returned a non-zero code. Check the live log and failure reason for details."
                    .to_string(),
        },
    }
}
