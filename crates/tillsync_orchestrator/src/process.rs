//! Platform process helpers: liveness probes, termination signals, and
//! exit-code extraction.

use std::process::ExitStatus;

/// Whether a PID refers to a live process. Uses the null signal on Unix.
///
/// On non-Unix targets the probe cannot be performed and conservatively
/// reports alive, so the reconciler never reaps a job it cannot verify.
#[cfg(unix)]
pub fn pid_alive(pid: i64) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: i64) -> bool {
    true
}

/// Ask a process to terminate gracefully (SIGTERM).
#[cfg(unix)]
pub fn request_termination(pid: i64) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
pub fn request_termination(_pid: i64) {}

/// Hard-kill a process (SIGKILL).
#[cfg(unix)]
pub fn force_kill(pid: i64) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn force_kill(_pid: i64) {}

/// Exit code of a finished subprocess. A signal death maps to the negative
/// signal number, matching the exit-code guide.
pub fn exit_code_of(status: ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return code as i64;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -(signal as i64);
        }
    }
    -1
}
