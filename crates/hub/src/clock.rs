//! Wall-clock helpers. Everything persisted is Unix seconds (UTC); the local
//! offset only matters when parsing or printing human-facing timestamps.

use anyhow::{Context, Result};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

const LOCAL_SECONDS: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
const LOCAL_MINUTES: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]");

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Truncate a Unix timestamp to the start of its minute.
pub fn minute_floor(ts: i64) -> i64 {
    ts - ts.rem_euclid(60)
}

/// Seconds until the next multiple of `period_sec` (always in `1..=period_sec`).
pub fn secs_until_next(ts: i64, period_sec: i64) -> i64 {
    period_sec - ts.rem_euclid(period_sec)
}

/// Format as `YYYY-MM-DD HH:MM:SS` in the given offset.
pub fn format_local(ts: i64, offset: UtcOffset) -> String {
    OffsetDateTime::from_unix_timestamp(ts)
        .map(|t| t.to_offset(offset))
        .ok()
        .and_then(|t| t.format(LOCAL_SECONDS).ok())
        .unwrap_or_else(|| ts.to_string())
}

/// Parse a local `YYYY-MM-DD HH:MM[:SS]` string (what the ML forecast
/// returns) into Unix seconds.
pub fn parse_local(s: &str, offset: UtcOffset) -> Result<i64> {
    let s = s.trim();
    let naive = PrimitiveDateTime::parse(s, LOCAL_SECONDS)
        .or_else(|_| PrimitiveDateTime::parse(s, LOCAL_MINUTES))
        .with_context(|| format!("unrecognised local timestamp: {s:?}"))?;
    Ok(naive.assume_offset(offset).unix_timestamp())
}

pub fn utc_offset_from_hours(hours: i8) -> Result<UtcOffset> {
    UtcOffset::from_hms(hours, 0, 0).with_context(|| format!("invalid UTC offset: {hours}h"))
}
