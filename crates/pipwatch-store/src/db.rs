use chrono::NaiveDate;
use rusqlite::{Connection, Result};

use pipwatch_core::types::{ChartStyle, ImpactLevel, NewsEvent, RecipientPreference};

/// Column list shared by every event query in this crate.
pub(crate) const EVENT_SELECT_SQL: &str =
    "SELECT date, time, currency, title, impact, actual, forecast, previous, analysis
     FROM news_events";

/// Column list shared by every recipient query in this crate.
pub(crate) const RECIPIENT_SELECT_SQL: &str =
    "SELECT recipient_id, chat_id, timezone, currencies, digest_impact, reminder_impact,
            lead_minutes, notifications_enabled, digest_enabled, digest_time,
            charts_enabled, chart_style, chart_window_hours
     FROM recipients";

/// Map a SELECT row (column order from EVENT_SELECT_SQL) to a NewsEvent.
/// Centralised here so every query in this crate stays consistent.
pub(crate) fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<NewsEvent> {
    use std::str::FromStr;
    let date_str: String = row.get(0)?;
    let date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let impact = ImpactLevel::from_str(&row.get::<_, String>(4)?).unwrap_or(ImpactLevel::Unknown);
    Ok(NewsEvent {
        date,
        time: row.get(1)?,
        currency: row.get(2)?,
        title: row.get(3)?,
        impact,
        actual: row.get(5)?,
        forecast: row.get(6)?,
        previous: row.get(7)?,
        analysis: row.get(8)?,
    })
}

/// Map a SELECT row (column order from RECIPIENT_SELECT_SQL) to a
/// RecipientPreference.
pub(crate) fn row_to_recipient(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecipientPreference> {
    use std::str::FromStr;
    let currencies: Vec<String> =
        serde_json::from_str(&row.get::<_, String>(3)?).unwrap_or_default();
    let digest_impact: Vec<ImpactLevel> =
        serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or_default();
    let reminder_impact: Vec<ImpactLevel> =
        serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default();
    let chart_style = ChartStyle::from_str(&row.get::<_, String>(11)?).unwrap_or_default();
    Ok(RecipientPreference {
        recipient_id: row.get(0)?,
        chat_id: row.get(1)?,
        timezone: row.get(2)?,
        currencies,
        digest_impact,
        reminder_impact,
        lead_minutes: row.get(6)?,
        notifications_enabled: row.get::<_, i32>(7)? != 0,
        digest_enabled: row.get::<_, i32>(8)? != 0,
        digest_time: row.get(9)?,
        charts_enabled: row.get::<_, i32>(10)? != 0,
        chart_style,
        chart_window_hours: row.get(12)?,
    })
}

/// Initialise all tables for the storage layer. Safe to call on every
/// startup; CREATE IF NOT EXISTS makes it idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_news_events_table(conn)?;
    create_recipients_table(conn)?;
    create_outcomes_table(conn)?;
    Ok(())
}

fn create_news_events_table(conn: &Connection) -> Result<()> {
    // UNIQUE(date, time, currency, title) lets a feed refresh re-insert a
    // day without duplicating rows; idx_news_events_date serves the hot
    // path: events_for_date.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS news_events (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            date        TEXT NOT NULL,               -- ISO calendar date
            time        TEXT NOT NULL DEFAULT '',    -- local wall time as published
            currency    TEXT NOT NULL,
            title       TEXT NOT NULL,
            impact      TEXT NOT NULL DEFAULT 'unknown',
            actual      TEXT,
            forecast    TEXT,
            previous    TEXT,
            analysis    TEXT,
            created_at  TEXT NOT NULL,
            UNIQUE(date, time, currency, title)
        );
        CREATE INDEX IF NOT EXISTS idx_news_events_date
            ON news_events (date);",
    )
}

fn create_recipients_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS recipients (
            recipient_id          INTEGER PRIMARY KEY NOT NULL,
            chat_id               INTEGER NOT NULL,
            timezone              TEXT NOT NULL DEFAULT 'UTC',
            currencies            TEXT NOT NULL DEFAULT '[]',                -- JSON array
            digest_impact         TEXT NOT NULL DEFAULT '[\"high\",\"medium\"]', -- JSON array
            reminder_impact       TEXT NOT NULL DEFAULT '[\"high\"]',        -- JSON array
            lead_minutes          INTEGER NOT NULL DEFAULT 30,
            notifications_enabled INTEGER NOT NULL DEFAULT 1,
            digest_enabled        INTEGER NOT NULL DEFAULT 1,
            digest_time           TEXT NOT NULL DEFAULT '08:00',
            charts_enabled        INTEGER NOT NULL DEFAULT 0,
            chart_style           TEXT NOT NULL DEFAULT 'single',
            chart_window_hours    INTEGER NOT NULL DEFAULT 2,
            created_at            TEXT NOT NULL,
            updated_at            TEXT NOT NULL
        );",
    )
}

fn create_outcomes_table(conn: &Connection) -> Result<()> {
    // created_at is RFC 3339 UTC, so string comparison doubles as time
    // comparison for the retention prune.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS outcomes (
            id              TEXT PRIMARY KEY NOT NULL,
            recipient_id    INTEGER NOT NULL,
            kind            TEXT NOT NULL,
            fingerprint     TEXT,
            status          TEXT NOT NULL,
            detail          TEXT,
            retries         INTEGER NOT NULL DEFAULT 0,
            chart_degraded  INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_outcomes_created
            ON outcomes (created_at);",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert!(tables.contains(&"news_events".to_string()));
        assert!(tables.contains(&"recipients".to_string()));
        assert!(tables.contains(&"outcomes".to_string()));
    }

    #[test]
    fn schema_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    // The gateway opens one connection per store against a single file;
    // rows written through one must be visible through another.
    #[test]
    fn separate_connections_share_one_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipwatch.db");

        let writer = Connection::open(&path).unwrap();
        writer.execute_batch("PRAGMA journal_mode=WAL;").unwrap();
        init_db(&writer).unwrap();
        writer
            .execute(
                "INSERT INTO news_events (date, time, currency, title, impact, created_at)
                 VALUES ('2026-02-06', '14:30', 'USD', 'Non-Farm Payrolls', 'high',
                         '2026-02-06T00:00:00Z')",
                [],
            )
            .unwrap();

        let reader = Connection::open(&path).unwrap();
        let count: i64 = reader
            .query_row(
                "SELECT COUNT(*) FROM news_events WHERE date = '2026-02-06'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
