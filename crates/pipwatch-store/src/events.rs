use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use rusqlite::Connection;
use tracing::debug;

use pipwatch_core::types::NewsEvent;

use crate::db::{init_db, row_to_event, EVENT_SELECT_SQL};
use crate::error::Result;

/// Calendar events, one row per (date, time, currency, title).
pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
}

impl EventStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Replace one calendar day wholesale, the way a feed refresh works.
    /// Runs in a transaction so readers never see a half-replaced day.
    pub fn replace_day(&self, date: NaiveDate, events: &[NewsEvent]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        tx.execute(
            "DELETE FROM news_events WHERE date = ?1",
            [date.to_string()],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO news_events
                 (date, time, currency, title, impact,
                  actual, forecast, previous, analysis, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            )?;
            for event in events {
                stmt.execute(rusqlite::params![
                    event.date.to_string(),
                    event.time,
                    event.currency,
                    event.title,
                    event.impact.to_string(),
                    event.actual,
                    event.forecast,
                    event.previous,
                    event.analysis,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        debug!(%date, count = events.len(), "calendar day replaced");
        Ok(events.len())
    }

    /// All events stored for `date`, in feed order.
    pub fn events_for_date(&self, date: NaiveDate) -> Result<Vec<NewsEvent>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("{} WHERE date = ?1 ORDER BY id", EVENT_SELECT_SQL);
        let mut stmt = conn.prepare_cached(&sql)?;
        let events = stmt
            .query_map([date.to_string()], row_to_event)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipwatch_core::types::ImpactLevel;

    fn store() -> EventStore {
        EventStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn event(date: NaiveDate, currency: &str, title: &str, time: &str) -> NewsEvent {
        NewsEvent {
            date,
            time: time.to_string(),
            currency: currency.to_string(),
            title: title.to_string(),
            impact: ImpactLevel::High,
            actual: None,
            forecast: Some("0.5%".to_string()),
            previous: Some("0.3%".to_string()),
            analysis: None,
        }
    }

    #[test]
    fn replace_and_read_round_trips() {
        let store = store();
        let date = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        let events = vec![
            event(date, "USD", "Non-Farm Payrolls", "14:30"),
            event(date, "EUR", "ECB Press Conference", "10:00"),
        ];

        assert_eq!(store.replace_day(date, &events).unwrap(), 2);
        let read = store.events_for_date(date).unwrap();
        assert_eq!(read, events);
    }

    #[test]
    fn replacing_a_day_drops_stale_rows() {
        let store = store();
        let date = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        store
            .replace_day(
                date,
                &[
                    event(date, "USD", "Non-Farm Payrolls", "14:30"),
                    event(date, "USD", "Unemployment Rate", "14:30"),
                ],
            )
            .unwrap();
        store
            .replace_day(date, &[event(date, "USD", "Non-Farm Payrolls", "14:30")])
            .unwrap();

        let read = store.events_for_date(date).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].title, "Non-Farm Payrolls");
    }

    #[test]
    fn days_are_isolated() {
        let store = store();
        let first = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        let second = NaiveDate::from_ymd_opt(2026, 1, 16).unwrap();
        store
            .replace_day(first, &[event(first, "USD", "CPI", "14:30")])
            .unwrap();
        store
            .replace_day(second, &[event(second, "GBP", "BoE Rate Decision", "13:00")])
            .unwrap();

        assert_eq!(store.events_for_date(first).unwrap().len(), 1);
        assert_eq!(
            store.events_for_date(second).unwrap()[0].currency,
            "GBP"
        );
    }

    #[test]
    fn unrecognised_stored_impact_reads_as_unknown() {
        let store = store();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO news_events
                 (date, time, currency, title, impact, created_at)
                 VALUES ('2026-01-15', '14:30', 'USD', 'Mystery Release', 'catastrophic', '2026-01-15T00:00:00Z')",
                [],
            )
            .unwrap();
        }
        let date = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        let read = store.events_for_date(date).unwrap();
        assert_eq!(read[0].impact, ImpactLevel::Unknown);
    }
}
