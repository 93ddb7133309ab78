use chrono::{DateTime, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{CoreError, Result};

/// Parse an IANA timezone name ("Europe/Prague").
pub fn parse_zone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| CoreError::UnknownTimezone(name.to_string()))
}

/// Current wall-clock time in `tz`.
pub fn now_in_zone(tz: Tz) -> DateTime<Tz> {
    Utc::now().with_timezone(&tz)
}

/// Today's calendar date as seen from `tz`.
pub fn local_today(tz: Tz) -> NaiveDate {
    now_in_zone(tz).date_naive()
}

/// Parse a configured time-of-day: "HH:MM" or "HH:MM:SS".
///
/// Used for digest times, where a malformed value is a caller error and
/// must be rejected, unlike feed event times which are merely skipped.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    let trimmed = s.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
        .map_err(|_| CoreError::InvalidTimeOfDay(s.to_string()))
}

/// Feed rows without a concrete clock time ("All Day", bank holidays).
/// These are expected and skipped quietly; anything else that fails to
/// parse is worth a warning.
pub fn is_untimed_marker(s: &str) -> bool {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return true;
    }
    matches!(
        trimmed.to_ascii_lowercase().as_str(),
        "all day" | "tentative" | "day 1" | "day 2"
    )
}

/// Parse an event's feed time-of-day string.
///
/// Accepts 24-hour forms ("14:30", "14:30:00") and the 12-hour forms some
/// feeds emit ("8:30am", "8:30 pm"). Returns None for empty strings and
/// all-day markers; callers skip those events instead of guessing a time.
pub fn parse_event_time(s: &str) -> Option<NaiveTime> {
    let trimmed = s.trim();
    if is_untimed_marker(trimmed) {
        return None;
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.ends_with("am") || lower.ends_with("pm") {
        // Normalise "8:30 am" to "8:30am" for a single format string.
        let compact = lower.replace(' ', "");
        return NaiveTime::parse_from_str(&compact, "%I:%M%p").ok();
    }

    NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
        .ok()
}

/// Resolve an event's (date, local time) to an absolute instant in `tz`.
///
/// DST gaps make some local datetimes nonexistent and some ambiguous.
/// Ambiguous times resolve to the earlier offset; nonexistent times return
/// None and the event is skipped for that tick.
pub fn local_instant(date: NaiveDate, time: NaiveTime, tz: Tz) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&date.and_time(time)) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(earlier, _later) => Some(earlier),
        LocalResult::None => None,
    }
}
