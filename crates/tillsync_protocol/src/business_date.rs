//! Business trading-date resolution.
//!
//! The "trading date" is the accounting day whose data should now be
//! complete. Before the daily cutoff (default 05:00 local) the previous
//! day's figures are still settling, so the trading date is two days back;
//! after the cutoff it is one day back.

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;

/// Default business timezone when the environment does not override it.
pub const DEFAULT_BUSINESS_TIMEZONE: &str = "Africa/Lagos";

/// Default daily cutoff, local (hour, minute).
pub const DEFAULT_CUTOFF: (u32, u32) = (5, 0);

/// Trading date for `now` in the given business timezone.
pub fn business_trading_date(now: DateTime<Utc>, tz: Tz, cutoff: (u32, u32)) -> NaiveDate {
    let local = now.with_timezone(&tz);
    let days_back = if (local.hour(), local.minute()) < cutoff {
        2
    } else {
        1
    };
    local.date_naive() - Duration::days(days_back)
}

/// The trading date immediately before `target_date`.
pub fn previous_trading_date(target_date: NaiveDate) -> NaiveDate {
    target_date - Duration::days(1)
}
