use std::collections::BTreeMap;

use chrono::NaiveDate;

use pipwatch_core::timeutil;
use pipwatch_core::types::{ImpactLevel, NewsEvent};

use crate::group::EventGroup;

/// Sent when a recipient's digest filter matches nothing today.
pub const EMPTY_DIGEST_TEXT: &str = "✅ No news events for your preferences today.";

/// Impact buckets in display order for grouped reminders.
const BUCKET_ORDER: [ImpactLevel; 6] = [
    ImpactLevel::High,
    ImpactLevel::Medium,
    ImpactLevel::Low,
    ImpactLevel::Tentative,
    ImpactLevel::None,
    ImpactLevel::Unknown,
];

/// Render the reminder text for one event group.
///
/// Single events get a one-line summary; simultaneous events get a header
/// plus impact buckets, high first, feed order within a bucket.
pub fn render_reminder(group: &EventGroup, lead_minutes: i64) -> String {
    if !group.is_multi() {
        let event = &group.primary().event;
        return format!(
            "⚠️ In {} minutes: {} news!\n{} | {} | {} | {} {} Impact",
            lead_minutes,
            event.impact,
            event.time,
            event.currency,
            event.title,
            event.impact.emoji(),
            event.impact.label()
        );
    }

    let mut text = format!("⚠️ In {} minutes: Multiple news events!\n", lead_minutes);
    for impact in BUCKET_ORDER {
        let bucket: Vec<&NewsEvent> = group
            .members
            .iter()
            .map(|d| &d.event)
            .filter(|e| e.impact == impact)
            .collect();
        if bucket.is_empty() {
            continue;
        }
        text.push_str(&format!("\n{} {} Impact:\n", impact.emoji(), impact.label()));
        for event in bucket {
            text.push_str(&format!(
                "• {} | {} | {}\n",
                event.time, event.currency, event.title
            ));
        }
    }
    text.trim_end().to_string()
}

/// Render a daily digest over pre-filtered events, grouped by currency.
///
/// Currencies are sorted; within a currency, events run in time order with
/// untimed rows last. The date reads `6.3.2026` (no zero padding).
pub fn render_digest(date: NaiveDate, events: &[NewsEvent]) -> String {
    let mut by_currency: BTreeMap<&str, Vec<&NewsEvent>> = BTreeMap::new();
    for event in events {
        by_currency.entry(&event.currency).or_default().push(event);
    }

    let mut text = format!("📅 Daily Digest for {}\n", date.format("%-d.%-m.%Y"));
    for (currency, mut rows) in by_currency {
        // Untimed rows ("All Day") sort after every timed row.
        rows.sort_by_key(|e| {
            let t = timeutil::parse_event_time(&e.time);
            (t.is_none(), t)
        });
        text.push_str(&format!("\n💎 {}\n", currency));
        for event in rows {
            text.push_str(&format!(
                "⏰ {} {} {}\n",
                event.time,
                event.impact.emoji(),
                event.title
            ));
        }
    }
    text.trim_end().to_string()
}

/// Major pair used for the sentiment poll of a given currency.
pub fn pair_for_currency(currency: &str) -> Option<&'static str> {
    match currency.to_ascii_uppercase().as_str() {
        "USD" => Some("USDJPY"),
        "EUR" => Some("EURUSD"),
        "GBP" => Some("GBPUSD"),
        "CAD" => Some("USDCAD"),
        "JPY" => Some("USDJPY"),
        "AUD" => Some("AUDUSD"),
        "NZD" => Some("NZDUSD"),
        "CHF" => Some("USDCHF"),
        _ => None,
    }
}

pub fn poll_question(pair: &str) -> String {
    format!("Do you think {} will go down or up?", pair)
}

pub fn poll_options() -> Vec<String> {
    vec!["⬇️ Down".to_string(), "⬆️ Up".to_string()]
}
