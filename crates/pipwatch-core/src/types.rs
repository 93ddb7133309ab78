use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Market impact of a calendar event.
///
/// `High`/`Medium`/`Low` are the levels recipients can subscribe to;
/// `Tentative` and `None` appear in the feed and are kept for display,
/// `Unknown` absorbs anything the upstream feed invents later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    High,
    Medium,
    Low,
    Tentative,
    None,
    Unknown,
}

impl ImpactLevel {
    /// Marker emoji used in every outbound message.
    pub fn emoji(&self) -> &'static str {
        match self {
            ImpactLevel::High => "🔴",
            ImpactLevel::Medium => "🟠",
            ImpactLevel::Low => "🟡",
            ImpactLevel::Tentative => "⏳",
            ImpactLevel::None => "⚪️",
            ImpactLevel::Unknown => "❓",
        }
    }

    /// Capitalised label for message text ("High", "Medium", ...).
    pub fn label(&self) -> &'static str {
        match self {
            ImpactLevel::High => "High",
            ImpactLevel::Medium => "Medium",
            ImpactLevel::Low => "Low",
            ImpactLevel::Tentative => "Tentative",
            ImpactLevel::None => "None",
            ImpactLevel::Unknown => "Unknown",
        }
    }

    /// Bucket order for grouped messages: high first, unknowns last.
    pub fn rank(&self) -> u8 {
        match self {
            ImpactLevel::High => 0,
            ImpactLevel::Medium => 1,
            ImpactLevel::Low => 2,
            ImpactLevel::Tentative => 3,
            ImpactLevel::None => 4,
            ImpactLevel::Unknown => 5,
        }
    }
}

impl fmt::Display for ImpactLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImpactLevel::High => "high",
            ImpactLevel::Medium => "medium",
            ImpactLevel::Low => "low",
            ImpactLevel::Tentative => "tentative",
            ImpactLevel::None => "none",
            ImpactLevel::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ImpactLevel {
    type Err = std::convert::Infallible;

    /// Never fails: unrecognised feed values map to `Unknown` so a feed
    /// format drift degrades display instead of dropping events.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "high" => ImpactLevel::High,
            "medium" => ImpactLevel::Medium,
            "low" => ImpactLevel::Low,
            "tentative" => ImpactLevel::Tentative,
            "none" => ImpactLevel::None,
            _ => ImpactLevel::Unknown,
        })
    }
}

/// Chart rendering style a recipient can pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChartStyle {
    /// One candle chart for the event's currency pair.
    #[default]
    Single,
    /// Combined chart across the major pairs of the currency.
    Multi,
}

impl fmt::Display for ChartStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChartStyle::Single => write!(f, "single"),
            ChartStyle::Multi => write!(f, "multi"),
        }
    }
}

impl std::str::FromStr for ChartStyle {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "single" => Ok(ChartStyle::Single),
            "multi" => Ok(ChartStyle::Multi),
            other => Err(format!("unknown chart style: {}", other)),
        }
    }
}

/// One scheduled economic release, as delivered by the calendar feed.
///
/// The feed may omit or recycle its own row ids, so nothing in the engine
/// keys on them; event identity is (currency, title, local time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsEvent {
    /// Calendar date the event belongs to.
    pub date: NaiveDate,
    /// Local time-of-day string as scraped ("14:30", "8:30am", "All Day").
    pub time: String,
    /// ISO currency code ("USD", "EUR", ...).
    pub currency: String,
    pub title: String,
    pub impact: ImpactLevel,
    pub actual: Option<String>,
    pub forecast: Option<String>,
    pub previous: Option<String>,
    /// Free-text analysis attached by an upstream enrichment step.
    pub analysis: Option<String>,
}

impl NewsEvent {
    /// Stable identity key: the upstream feed reuses and omits row ids,
    /// so two rows with the same currency, title and time are one event.
    pub fn identity(&self) -> String {
        format!("{}|{}|{}", self.currency, self.title, self.time)
    }
}

/// Per-recipient delivery configuration, read-only to the engine.
///
/// Owned by the preference store; the engine re-reads it on every resync
/// and tolerates it changing between ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientPreference {
    /// Internal recipient id (stable across chat migrations).
    pub recipient_id: i64,
    /// Transport destination (chat id).
    pub chat_id: i64,
    /// IANA timezone name, e.g. "Europe/Prague".
    pub timezone: String,
    /// Followed currencies; empty means all currencies.
    pub currencies: Vec<String>,
    /// Impact levels included in the daily digest.
    pub digest_impact: Vec<ImpactLevel>,
    /// Impact levels that trigger event reminders.
    pub reminder_impact: Vec<ImpactLevel>,
    /// Reminder lead time in minutes (15/30/60).
    pub lead_minutes: i64,
    pub notifications_enabled: bool,
    pub digest_enabled: bool,
    /// Digest time-of-day, "HH:MM" or "HH:MM:SS".
    pub digest_time: String,
    pub charts_enabled: bool,
    pub chart_style: ChartStyle,
    /// Hours of price history around the event shown in charts.
    pub chart_window_hours: u32,
}

impl RecipientPreference {
    /// Empty currency list means "follow everything".
    pub fn follows_currency(&self, currency: &str) -> bool {
        self.currencies.is_empty() || self.currencies.iter().any(|c| c == currency)
    }

    pub fn wants_reminder_impact(&self, impact: ImpactLevel) -> bool {
        self.reminder_impact.contains(&impact)
    }

    pub fn wants_digest_impact(&self, impact: ImpactLevel) -> bool {
        self.digest_impact.contains(&impact)
    }
}
