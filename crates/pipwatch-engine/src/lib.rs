//! `pipwatch-engine`: scheduling and dispatch core.
//!
//! # Overview
//!
//! Two timing surfaces drive everything. The [`scheduler::DigestScheduler`]
//! holds one job per (timezone, time-of-day) pair and fires each at most
//! once per local day; the reminder poller re-scans upcoming events every
//! couple of minutes and picks out those entering a recipient's lead
//! window. Both paths funnel into dispatchers that deduplicate by
//! fingerprint, attach a rate-limited chart where enabled, deliver through
//! the transport port with bounded retries, and record a
//! [`outcome::DispatchOutcome`] for every decision.
//!
//! # Dispatch pipeline
//!
//! | Stage   | Module        | Job                                         |
//! |---------|---------------|---------------------------------------------|
//! | Match   | [`matcher`]   | lead-window and preference filtering        |
//! | Group   | [`group`]     | merge simultaneous events into one message  |
//! | Guard   | [`dedup`]     | at-most-once fingerprints, chart cooldown   |
//! | Render  | [`format`]    | reminder, digest and poll texts             |
//! | Deliver | [`dispatch`]  | retries, timeouts, chart degradation        |

pub mod dedup;
pub mod digest;
pub mod dispatch;
pub mod error;
pub mod fingerprint;
pub mod format;
pub mod group;
pub mod matcher;
pub mod outcome;
pub mod scheduler;

pub use dedup::{DedupError, DedupStore, MemoryDedupStore};
pub use digest::DigestDispatcher;
pub use dispatch::{
    run_reminder_poller, DispatchSettings, NotificationDispatcher, RecipientLocks, TickStats,
};
pub use error::{EngineError, Result};
pub use fingerprint::Fingerprint;
pub use outcome::{DispatchOutcome, DispatchStatus, OutcomeKind};
pub use scheduler::{
    run_digest_scheduler, run_resync, BroadcastTarget, DigestScheduler, EngineHealth, JobInfo,
};
