use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

use pipwatch_core::config::{CHART_RETENTION_HOURS, NOTIFICATION_RETENTION_HOURS};

use crate::fingerprint::Fingerprint;

/// Full purge sweep runs once per this many store operations; individual
/// entries are still expiry-checked on every lookup, so the sweep only
/// bounds memory, never correctness.
const PURGE_EVERY_OPS: u64 = 256;

#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("deduplication store unavailable: {0}")]
    Unavailable(String),
}

/// Shared dedup and chart-cooldown state.
///
/// `should_send` is the at-most-once gate: it must atomically check and
/// record the fingerprint. Callers fail open when a method errors, so an
/// implementation backed by an external store should surface outages as
/// `Unavailable` rather than blocking.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// True iff this fingerprint was not sent within the retention window;
    /// records it as sent in the same atomic step.
    async fn should_send(&self, fingerprint: &Fingerprint) -> Result<bool, DedupError>;

    /// True iff the recipient's last chart is at least `cooldown` old.
    /// Not an atomic reserve; the dispatcher's per-recipient serialization
    /// keeps check and mark from racing.
    async fn can_send_chart(
        &self,
        recipient_id: i64,
        cooldown: Duration,
    ) -> Result<bool, DedupError>;

    /// Record that a chart went out to this recipient just now.
    async fn mark_chart_sent(&self, recipient_id: i64) -> Result<(), DedupError>;

    /// Drop every expired entry. Returns the number removed. Invoked by
    /// the daily maintenance tick; regular calls already purge lazily.
    async fn purge_expired(&self) -> Result<usize, DedupError>;
}

/// In-process `DedupStore` for single-instance deployments.
///
/// Concurrent-map entries hold the last-sent instant; the map's per-shard
/// locking makes check-and-insert atomic without a global lock.
pub struct MemoryDedupStore {
    sent: DashMap<String, DateTime<Utc>>,
    charts: DashMap<i64, DateTime<Utc>>,
    retention: Duration,
    chart_retention: Duration,
    ops: AtomicU64,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::with_retention(
            Duration::hours(NOTIFICATION_RETENTION_HOURS),
            Duration::hours(CHART_RETENTION_HOURS),
        )
    }

    pub fn with_retention(retention: Duration, chart_retention: Duration) -> Self {
        Self {
            sent: DashMap::new(),
            charts: DashMap::new(),
            retention,
            chart_retention,
            ops: AtomicU64::new(0),
        }
    }

    /// Clock-explicit core of `should_send`, driven directly by tests.
    pub fn should_send_at(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> bool {
        self.bump_ops(now);
        match self.sent.entry(fingerprint.as_str().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if now - *entry.get() >= self.retention {
                    // Expired entry: this counts as a fresh send.
                    entry.insert(now);
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    pub fn can_send_chart_at(
        &self,
        recipient_id: i64,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        self.bump_ops(now);
        match self.charts.get(&recipient_id) {
            Some(last) => {
                if now - *last >= self.chart_retention {
                    drop(last);
                    self.charts.remove(&recipient_id);
                    true
                } else {
                    now - *last >= cooldown
                }
            }
            None => true,
        }
    }

    pub fn mark_chart_sent_at(&self, recipient_id: i64, now: DateTime<Utc>) {
        self.charts.insert(recipient_id, now);
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.sent.len() + self.charts.len();
        self.sent.retain(|_, sent_at| now - *sent_at < self.retention);
        self.charts
            .retain(|_, sent_at| now - *sent_at < self.chart_retention);
        let removed = before - (self.sent.len() + self.charts.len());
        if removed > 0 {
            debug!(removed, "purged expired dedup entries");
        }
        removed
    }

    /// Amortized cleanup: every PURGE_EVERY_OPS store operations trigger a
    /// full sweep, so memory stays bounded without a dedicated timer.
    fn bump_ops(&self, now: DateTime<Utc>) {
        let count = self.ops.fetch_add(1, Ordering::Relaxed);
        if count % PURGE_EVERY_OPS == PURGE_EVERY_OPS - 1 {
            self.purge_expired_at(now);
        }
    }
}

impl Default for MemoryDedupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn should_send(&self, fingerprint: &Fingerprint) -> Result<bool, DedupError> {
        Ok(self.should_send_at(fingerprint, Utc::now()))
    }

    async fn can_send_chart(
        &self,
        recipient_id: i64,
        cooldown: Duration,
    ) -> Result<bool, DedupError> {
        Ok(self.can_send_chart_at(recipient_id, cooldown, Utc::now()))
    }

    async fn mark_chart_sent(&self, recipient_id: i64) -> Result<(), DedupError> {
        self.mark_chart_sent_at(recipient_id, Utc::now());
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, DedupError> {
        Ok(self.purge_expired_at(Utc::now()))
    }
}
