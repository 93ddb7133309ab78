use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tracing::debug;

use pipwatch_engine::outcome::{DispatchOutcome, DispatchStatus, OutcomeKind};

use crate::db::init_db;
use crate::error::Result;

const OUTCOME_SELECT_SQL: &str =
    "SELECT id, recipient_id, kind, fingerprint, status, detail, retries,
            chart_degraded, created_at
     FROM outcomes";

/// Append-only audit log of every dispatch decision.
pub struct OutcomeLog {
    conn: Arc<Mutex<Connection>>,
}

impl OutcomeLog {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn append(&self, outcome: &DispatchOutcome) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO outcomes
             (id, recipient_id, kind, fingerprint, status, detail, retries,
              chart_degraded, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            rusqlite::params![
                outcome.id,
                outcome.recipient_id,
                outcome.kind.to_string(),
                outcome.fingerprint,
                outcome.status.to_string(),
                outcome.detail,
                outcome.retries,
                outcome.chart_degraded,
                outcome.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Latest `limit` outcomes, newest first. Rows that no longer decode
    /// after a vocabulary change are skipped rather than failing the read.
    pub fn recent(&self, limit: usize) -> Result<Vec<DispatchOutcome>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("{} ORDER BY created_at DESC LIMIT ?1", OUTCOME_SELECT_SQL);
        let mut stmt = conn.prepare_cached(&sql)?;
        let outcomes = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,         // id
                    row.get::<_, i64>(1)?,            // recipient_id
                    row.get::<_, String>(2)?,         // kind
                    row.get::<_, Option<String>>(3)?, // fingerprint
                    row.get::<_, String>(4)?,         // status
                    row.get::<_, Option<String>>(5)?, // detail
                    row.get::<_, u32>(6)?,            // retries
                    row.get::<_, i32>(7)?,            // chart_degraded
                    row.get::<_, String>(8)?,         // created_at
                ))
            })?
            .filter_map(|r| {
                let (
                    id,
                    recipient_id,
                    kind_str,
                    fingerprint,
                    status_str,
                    detail,
                    retries,
                    chart_degraded,
                    created_str,
                ) = r.ok()?;
                let kind: OutcomeKind = kind_str.parse().ok()?;
                let status: DispatchStatus = status_str.parse().ok()?;
                let created_at = DateTime::parse_from_rfc3339(&created_str)
                    .ok()?
                    .with_timezone(&Utc);
                Some(DispatchOutcome {
                    id,
                    recipient_id,
                    kind,
                    fingerprint,
                    status,
                    detail,
                    retries,
                    chart_degraded: chart_degraded != 0,
                    created_at,
                })
            })
            .collect();
        Ok(outcomes)
    }

    /// Drop rows older than `days` days. Returns the number removed.
    pub fn prune_older_than(&self, days: i64) -> Result<usize> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM outcomes WHERE created_at < ?1", [cutoff])?;
        if n > 0 {
            debug!(removed = n, "outcome rows pruned");
        }
        Ok(n)
    }
}
