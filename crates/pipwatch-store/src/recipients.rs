use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use pipwatch_core::types::RecipientPreference;

use crate::db::{init_db, row_to_recipient, RECIPIENT_SELECT_SQL};
use crate::error::Result;

/// Recipient notification preferences, one row per recipient.
pub struct RecipientStore {
    conn: Arc<Mutex<Connection>>,
}

impl RecipientStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or fully overwrite a recipient's preferences.
    pub fn upsert(&self, pref: &RecipientPreference) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO recipients
             (recipient_id, chat_id, timezone, currencies, digest_impact, reminder_impact,
              lead_minutes, notifications_enabled, digest_enabled, digest_time,
              charts_enabled, chart_style, chart_window_hours, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?14)
             ON CONFLICT(recipient_id) DO UPDATE SET
              chat_id = excluded.chat_id,
              timezone = excluded.timezone,
              currencies = excluded.currencies,
              digest_impact = excluded.digest_impact,
              reminder_impact = excluded.reminder_impact,
              lead_minutes = excluded.lead_minutes,
              notifications_enabled = excluded.notifications_enabled,
              digest_enabled = excluded.digest_enabled,
              digest_time = excluded.digest_time,
              charts_enabled = excluded.charts_enabled,
              chart_style = excluded.chart_style,
              chart_window_hours = excluded.chart_window_hours,
              updated_at = excluded.updated_at",
            rusqlite::params![
                pref.recipient_id,
                pref.chat_id,
                pref.timezone,
                serde_json::to_string(&pref.currencies)?,
                serde_json::to_string(&pref.digest_impact)?,
                serde_json::to_string(&pref.reminder_impact)?,
                pref.lead_minutes,
                pref.notifications_enabled,
                pref.digest_enabled,
                pref.digest_time,
                pref.charts_enabled,
                pref.chart_style.to_string(),
                pref.chart_window_hours,
                now,
            ],
        )?;
        debug!(recipient_id = pref.recipient_id, "recipient upserted");
        Ok(())
    }

    /// Remove a recipient. True if a row was deleted.
    pub fn remove(&self, recipient_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM recipients WHERE recipient_id = ?1",
            [recipient_id],
        )?;
        Ok(n > 0)
    }

    pub fn get(&self, recipient_id: i64) -> Result<Option<RecipientPreference>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("{} WHERE recipient_id = ?1", RECIPIENT_SELECT_SQL);
        let pref = conn
            .query_row(&sql, [recipient_id], row_to_recipient)
            .optional()?;
        Ok(pref)
    }

    /// Recipients with event reminders switched on.
    pub fn with_notifications(&self) -> Result<Vec<RecipientPreference>> {
        self.select_where("notifications_enabled = 1")
    }

    /// Recipients with the daily digest switched on.
    pub fn with_digest(&self) -> Result<Vec<RecipientPreference>> {
        self.select_where("digest_enabled = 1")
    }

    fn select_where(&self, clause: &str) -> Result<Vec<RecipientPreference>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "{} WHERE {} ORDER BY recipient_id",
            RECIPIENT_SELECT_SQL, clause
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let prefs = stmt
            .query_map([], row_to_recipient)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(prefs)
    }
}
