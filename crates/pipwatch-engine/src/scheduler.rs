use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use pipwatch_core::config::DigestConfig;
use pipwatch_core::timeutil;
use pipwatch_core::types::RecipientPreference;

use crate::digest::DigestDispatcher;
use crate::dispatch::with_data_timeout;
use crate::error::Result;

/// Scheduler wall-clock resolution. Three chances per trigger minute.
const SCHEDULER_TICK_SECS: u64 = 20;

/// One digest trigger: every recipient sharing a timezone and a local
/// time-of-day fires together.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    /// Canonical IANA zone name.
    pub timezone: String,
    pub hour: u32,
    pub minute: u32,
}

impl JobKey {
    pub fn new(timezone: &str, time_of_day: &str) -> Result<Self> {
        let tz = timeutil::parse_zone(timezone)?;
        let time = timeutil::parse_time_of_day(time_of_day)?;
        Ok(Self {
            timezone: tz.name().to_string(),
            hour: time.hour(),
            minute: time.minute(),
        })
    }

    /// Stable job identifier, e.g. `digest_Europe_Prague_08_00`.
    pub fn id(&self) -> String {
        format!(
            "digest_{}_{:02}_{:02}",
            self.timezone.replace('/', "_"),
            self.hour,
            self.minute
        )
    }

    /// The zone parsed back from its canonical name. The name originated
    /// from a successfully parsed `Tz`, so the fallback is unreachable.
    fn zone(&self) -> Tz {
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}

#[derive(Debug, Clone, Default)]
struct JobEntry {
    recipients: BTreeSet<i64>,
    /// Local date of the last fire; the once-per-day guard.
    last_fired: Option<NaiveDate>,
}

/// A key whose local wall clock matched its trigger minute.
#[derive(Debug, Clone)]
pub struct FiredJob {
    pub key: JobKey,
    pub tz: Tz,
    pub members: BTreeSet<i64>,
}

/// Snapshot of one schedule entry for the ops surface.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub timezone: String,
    pub time: String,
    pub recipients: usize,
    pub next_fire_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineHealth {
    pub running: bool,
    pub job_count: usize,
}

/// Counters from one schedule reconciliation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub added: usize,
    pub removed: usize,
    pub keys_added: usize,
    pub keys_removed: usize,
}

impl SyncStats {
    pub fn changed(&self) -> bool {
        self.added + self.removed + self.keys_added + self.keys_removed > 0
    }
}

/// In-memory digest schedule keyed by (timezone, time-of-day).
///
/// Shared between the engine loop (fires), the resync task (reconciles)
/// and the HTTP surface (reads), so every method takes `&self` and locks
/// internally.
pub struct DigestScheduler {
    jobs: Mutex<HashMap<JobKey, JobEntry>>,
    running: AtomicBool,
}

impl DigestScheduler {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Add or move a recipient's digest trigger. Scheduling under a new
    /// key removes any previous membership; empty keys are torn down.
    pub fn schedule_recipient_digest(
        &self,
        recipient_id: i64,
        timezone: &str,
        time_of_day: &str,
    ) -> Result<JobKey> {
        let key = JobKey::new(timezone, time_of_day)?;
        let mut jobs = self.jobs.lock().unwrap();
        remove_everywhere(&mut jobs, recipient_id, Some(&key));
        let entry = jobs.entry(key.clone()).or_default();
        if entry.recipients.insert(recipient_id) {
            debug!(job = %key.id(), recipient_id, "recipient scheduled");
        }
        Ok(key)
    }

    /// Remove a recipient from the schedule. True if they were scheduled.
    pub fn unschedule_recipient_digest(&self, recipient_id: i64) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        let removed = remove_everywhere(&mut jobs, recipient_id, None);
        if removed {
            debug!(recipient_id, "recipient unscheduled");
        }
        removed
    }

    /// Reconcile the schedule against the full digest-enabled preference
    /// set. Surviving keys keep `last_fired`, so a resync can never
    /// re-fire a minute that already ran today.
    pub(crate) fn sync(&self, prefs: &[RecipientPreference]) -> SyncStats {
        let mut desired: HashMap<JobKey, BTreeSet<i64>> = HashMap::new();
        for pref in prefs {
            if !pref.digest_enabled {
                continue;
            }
            match JobKey::new(&pref.timezone, &pref.digest_time) {
                Ok(key) => {
                    desired.entry(key).or_default().insert(pref.recipient_id);
                }
                Err(e) => warn!(
                    recipient_id = pref.recipient_id,
                    err = %e,
                    "digest preference cannot be scheduled"
                ),
            }
        }

        let mut jobs = self.jobs.lock().unwrap();
        let mut stats = SyncStats::default();

        jobs.retain(|key, entry| match desired.get(key) {
            Some(want) => {
                let before = entry.recipients.len();
                entry.recipients.retain(|id| want.contains(id));
                stats.removed += before - entry.recipients.len();
                true
            }
            None => {
                stats.removed += entry.recipients.len();
                stats.keys_removed += 1;
                false
            }
        });

        for (key, want) in desired {
            let entry = jobs.entry(key).or_insert_with(|| {
                stats.keys_added += 1;
                JobEntry::default()
            });
            for id in want {
                if entry.recipients.insert(id) {
                    stats.added += 1;
                }
            }
        }
        stats
    }

    /// Keys whose local wall clock sits in the trigger minute and which
    /// have not fired yet today. Marked fired before this returns, so a
    /// slow dispatch cannot double-fire on the next tick.
    pub(crate) fn due_jobs(&self, now: DateTime<Utc>) -> Vec<FiredJob> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut fired = Vec::new();
        for (key, entry) in jobs.iter_mut() {
            let tz = key.zone();
            let local = now.with_timezone(&tz);
            if local.hour() != key.hour || local.minute() != key.minute {
                continue;
            }
            let today = local.date_naive();
            if entry.last_fired == Some(today) {
                continue;
            }
            entry.last_fired = Some(today);
            fired.push(FiredJob {
                key: key.clone(),
                tz,
                members: entry.recipients.clone(),
            });
        }
        fired
    }

    /// Snapshot for the ops surface, sorted by job id.
    pub fn list_scheduled_jobs(&self) -> Vec<JobInfo> {
        self.list_jobs_at(Utc::now())
    }

    fn list_jobs_at(&self, now: DateTime<Utc>) -> Vec<JobInfo> {
        let jobs = self.jobs.lock().unwrap();
        let mut infos: Vec<JobInfo> = jobs
            .iter()
            .map(|(key, entry)| JobInfo {
                id: key.id(),
                timezone: key.timezone.clone(),
                time: format!("{:02}:{:02}", key.hour, key.minute),
                recipients: entry.recipients.len(),
                next_fire_utc: next_fire(key, entry, now),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn health_check(&self) -> EngineHealth {
        EngineHealth {
            running: self.running.load(Ordering::Relaxed),
            job_count: self.jobs.lock().unwrap().len(),
        }
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }
}

impl Default for DigestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop `recipient_id` from every key except `keep`; tear down keys left
/// empty. Returns whether any membership was removed.
fn remove_everywhere(
    jobs: &mut HashMap<JobKey, JobEntry>,
    recipient_id: i64,
    keep: Option<&JobKey>,
) -> bool {
    let mut removed = false;
    jobs.retain(|key, entry| {
        if Some(key) == keep {
            return true;
        }
        if entry.recipients.remove(&recipient_id) {
            removed = true;
        }
        !entry.recipients.is_empty()
    });
    removed
}

/// Next UTC instant this key fires: the first future local trigger on a
/// day it has not fired yet. Skips days where the local time does not
/// exist (spring-forward gap).
fn next_fire(key: &JobKey, entry: &JobEntry, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let tz = key.zone();
    let target = NaiveTime::from_hms_opt(key.hour, key.minute, 0)?;
    let mut date = now.with_timezone(&tz).date_naive();
    for _ in 0..4 {
        if entry.last_fired != Some(date) {
            if let Some(instant) = timeutil::local_instant(date, target, tz) {
                let instant = instant.with_timezone(&Utc);
                if instant > now {
                    return Some(instant);
                }
            }
        }
        date = date.succ_opt()?;
    }
    None
}

/// Fixed channel broadcast settings, resolved from config at startup.
#[derive(Debug, Clone)]
pub struct BroadcastTarget {
    pub chat_id: i64,
    pub tz: Tz,
    pub hour: u32,
    pub minute: u32,
}

impl BroadcastTarget {
    /// None when no broadcast chat is configured.
    pub fn from_config(config: &DigestConfig) -> Result<Option<Self>> {
        let Some(chat_id) = config.broadcast_chat_id else {
            return Ok(None);
        };
        let tz = timeutil::parse_zone(&config.broadcast_timezone)?;
        let time = timeutil::parse_time_of_day(&config.broadcast_time)?;
        Ok(Some(Self {
            chat_id,
            tz,
            hour: time.hour(),
            minute: time.minute(),
        }))
    }
}

/// Main digest loop. Checks the schedule every twenty seconds until
/// `shutdown` broadcasts `true`.
pub async fn run_digest_scheduler(
    scheduler: Arc<DigestScheduler>,
    dispatcher: Arc<DigestDispatcher>,
    broadcast: Option<BroadcastTarget>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("digest scheduler started");
    scheduler.set_running(true);
    let mut last_broadcast: Option<NaiveDate> = None;

    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(SCHEDULER_TICK_SECS));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Utc::now();
                for job in scheduler.due_jobs(now) {
                    info!(job = %job.key.id(), recipients = job.members.len(), "digest job fired");
                    dispatcher.run_for_key(job.tz, &job.members, now).await;
                }
                if let Some(ref target) = broadcast {
                    let local = now.with_timezone(&target.tz);
                    if local.hour() == target.hour
                        && local.minute() == target.minute
                        && last_broadcast != Some(local.date_naive())
                    {
                        last_broadcast = Some(local.date_naive());
                        dispatcher.run_broadcast(target.chat_id, target.tz, now).await;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("digest scheduler shutting down");
                    break;
                }
            }
        }
    }
    scheduler.set_running(false);
}

/// Periodic schedule reconciliation against the data layer. The first
/// tick completes immediately, which doubles as the startup sync.
pub async fn run_resync(
    scheduler: Arc<DigestScheduler>,
    data: Arc<dyn pipwatch_core::ports::DataLayer>,
    every: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match with_data_timeout(data.recipients_with_digest()).await {
                    Ok(prefs) => {
                        let stats = scheduler.sync(&prefs);
                        if stats.changed() {
                            info!(
                                added = stats.added,
                                removed = stats.removed,
                                keys_added = stats.keys_added,
                                keys_removed = stats.keys_removed,
                                "digest schedule resynced"
                            );
                        }
                    }
                    Err(e) => error!("digest resync failed: {e}"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("digest resync shutting down");
                    break;
                }
            }
        }
    }
}
