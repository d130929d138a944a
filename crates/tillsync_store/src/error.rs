//! Errors from store operations.

use thiserror::Error;

use crate::models::JobStatus;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),

    #[error("job {id} status changed: expected {expected}, found {found}")]
    StatusChanged {
        id: String,
        expected: JobStatus,
        found: JobStatus,
    },

    #[error("illegal job transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    #[error("run lock is busy: held by {holder}")]
    LockBusy { holder: String },

    #[error("invalid job payload: {0}")]
    InvalidJob(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("system-managed schedules cannot be deleted")]
    SystemManagedSchedule,
}

pub type Result<T> = std::result::Result<T, StoreError>;
