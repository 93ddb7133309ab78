use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// What kind of send produced an outcome row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Reminder,
    Digest,
    Broadcast,
    Poll,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeKind::Reminder => "reminder",
            OutcomeKind::Digest => "digest",
            OutcomeKind::Broadcast => "broadcast",
            OutcomeKind::Poll => "poll",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for OutcomeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "reminder" => Ok(OutcomeKind::Reminder),
            "digest" => Ok(OutcomeKind::Digest),
            "broadcast" => Ok(OutcomeKind::Broadcast),
            "poll" => Ok(OutcomeKind::Poll),
            other => Err(format!("unknown outcome kind: {}", other)),
        }
    }
}

/// Terminal state of one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Sent,
    Failed,
    SkippedDuplicate,
    SkippedRateLimited,
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DispatchStatus::Sent => "sent",
            DispatchStatus::Failed => "failed",
            DispatchStatus::SkippedDuplicate => "skipped_duplicate",
            DispatchStatus::SkippedRateLimited => "skipped_rate_limited",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for DispatchStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sent" => Ok(DispatchStatus::Sent),
            "failed" => Ok(DispatchStatus::Failed),
            "skipped_duplicate" => Ok(DispatchStatus::SkippedDuplicate),
            "skipped_rate_limited" => Ok(DispatchStatus::SkippedRateLimited),
            other => Err(format!("unknown dispatch status: {}", other)),
        }
    }
}

/// Record of one dispatch attempt, emitted to the outcome log.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub id: String,
    pub recipient_id: i64,
    pub kind: OutcomeKind,
    /// Dedup key of the attempt; absent for sends that are not dedup-gated
    /// (the poll side effect).
    pub fingerprint: Option<String>,
    pub status: DispatchStatus,
    pub detail: Option<String>,
    /// Transport retries consumed (0 = first attempt succeeded).
    pub retries: u32,
    /// True when a chart was wanted but the message went out text-only.
    pub chart_degraded: bool,
    pub created_at: DateTime<Utc>,
}

impl DispatchOutcome {
    pub fn new(recipient_id: i64, kind: OutcomeKind, status: DispatchStatus) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            recipient_id,
            kind,
            fingerprint: None,
            status,
            detail: None,
            retries: 0,
            chart_degraded: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: &crate::fingerprint::Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint.as_str().to_string());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_chart_degraded(mut self) -> Self {
        self.chart_degraded = true;
        self
    }
}
