//! Shared domain vocabulary for the TillSync orchestration core.
//!
//! Everything here is pure: cron expression parsing and next-fire math,
//! business trading-date resolution, the subprocess exit-code guide, and
//! small value types shared between the store and the orchestrator. No I/O,
//! no database.

pub mod business_date;
pub mod cron;
pub mod exit_codes;
pub mod types;

pub use business_date::{business_trading_date, previous_trading_date};
pub use cron::{CronError, CronExpr};
pub use exit_codes::{exit_code_info, ExitCodeInfo, EXIT_CODE_REFERENCE};
pub use types::{is_valid_tenant_key, resolve_timezone, RunSource, TimezoneError};
