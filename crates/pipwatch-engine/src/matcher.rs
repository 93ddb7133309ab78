use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::warn;

use pipwatch_core::config::DUE_TOLERANCE_SECS;
use pipwatch_core::timeutil;
use pipwatch_core::types::{NewsEvent, RecipientPreference};

/// A news event that is due for a reminder right now, as seen from one
/// recipient's clock. Built per matcher run and discarded after dispatch.
#[derive(Debug, Clone)]
pub struct DueEvent {
    pub event: NewsEvent,
    /// The event's absolute instant, for ordering groups.
    pub instant: DateTime<Utc>,
    /// Signed minutes from `now` to the event, rounded to the nearest
    /// minute. Display only; the due decision runs on seconds.
    pub minutes_until: i64,
}

/// Find the events in `events` that are due for `pref` at `now`.
///
/// An event is due when its distance to `now` matches the recipient's lead
/// time within the fixed tolerance, so each event fires one reminder at
/// the configured lead, not a reminder per tick on the way in. Events the
/// recipient does not follow (impact or currency) are dropped first, rows
/// without a parsable time are skipped, and duplicate feed rows collapse
/// to their first occurrence. Feed order is preserved.
pub fn find_due_events(
    events: &[NewsEvent],
    pref: &RecipientPreference,
    now: DateTime<Utc>,
) -> Vec<DueEvent> {
    let tz = match timeutil::parse_zone(&pref.timezone) {
        Ok(tz) => tz,
        Err(_) => {
            warn!(
                recipient_id = pref.recipient_id,
                timezone = %pref.timezone,
                "recipient has an unknown timezone; skipping reminders this tick"
            );
            return Vec::new();
        }
    };

    let lead_secs = pref.lead_minutes * 60;
    let mut seen: HashSet<String> = HashSet::new();
    let mut due = Vec::new();

    for event in events {
        if !pref.wants_reminder_impact(event.impact) {
            continue;
        }
        if !pref.follows_currency(&event.currency) {
            continue;
        }
        if !seen.insert(event.identity()) {
            continue;
        }

        let time = match timeutil::parse_event_time(&event.time) {
            Some(t) => t,
            None => {
                if !timeutil::is_untimed_marker(&event.time) {
                    warn!(
                        currency = %event.currency,
                        title = %event.title,
                        time = %event.time,
                        "event has unparsable time; skipping"
                    );
                }
                continue;
            }
        };

        let instant = match timeutil::local_instant(event.date, time, tz) {
            Some(t) => t.with_timezone(&Utc),
            None => {
                warn!(
                    currency = %event.currency,
                    title = %event.title,
                    time = %event.time,
                    "event time does not exist in recipient timezone; skipping"
                );
                continue;
            }
        };

        let seconds_until = (instant - now).num_seconds();
        if (seconds_until - lead_secs).abs() <= DUE_TOLERANCE_SECS {
            due.push(DueEvent {
                event: event.clone(),
                instant,
                minutes_until: round_to_minutes(seconds_until),
            });
        }
    }

    due
}

fn round_to_minutes(seconds: i64) -> i64 {
    let half = if seconds >= 0 { 30 } else { -30 };
    (seconds + half) / 60
}
