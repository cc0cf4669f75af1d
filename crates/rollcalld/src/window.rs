//! The look-back window a dispatcher tick considers due.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

/// Time-of-day ranges (inclusive) on `date` whose entries are due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueWindow {
    pub date: NaiveDate,
    pub ranges: Vec<(NaiveTime, NaiveTime)>,
}

/// Window for a tick at `now`: `[now - lookback, now]`, both ends truncated to
/// the minute, restricted to today's entries.
///
/// When the start falls on the previous day the range wraps midnight and is
/// split into `[start, 23:59:59]` and `[00:00:00, end]`.
pub fn due_window(now: NaiveDateTime, lookback: Duration) -> DueWindow {
    let end = truncate_to_minute(now.time());
    let start = truncate_to_minute((now - lookback).time());

    let ranges = if start <= end {
        vec![(start, end)]
    } else {
        vec![(start, last_second()), (NaiveTime::MIN, end)]
    };

    DueWindow {
        date: now.date(),
        ranges,
    }
}

/// Entries scheduled before this instant can no longer become due.
pub fn stale_before(now: NaiveDateTime, lookback: Duration) -> NaiveDateTime {
    let start = now - lookback;
    start.date().and_time(truncate_to_minute(start.time()))
}

fn truncate_to_minute(time: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time)
}

fn last_second() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}
