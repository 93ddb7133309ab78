use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use pipwatch_core::config::PipwatchConfig;
use pipwatch_core::ports::{ChartRenderer, DataError, DataLayer, Transport, TransportError};
use pipwatch_core::timeutil;
use pipwatch_core::types::{NewsEvent, RecipientPreference};

use crate::dedup::DedupStore;
use crate::format;
use crate::group::{group_due_events, EventGroup};
use crate::matcher::find_due_events;
use crate::outcome::{DispatchOutcome, DispatchStatus, OutcomeKind};

/// Base backoff between transport retries; scales with the attempt number.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Cap on any single data-layer call so a hung backend cannot stall a tick.
const DATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Run one data-layer call under [`DATA_TIMEOUT`], mapping elapse onto the
/// layer's own unavailability error.
pub(crate) async fn with_data_timeout<T>(
    call: impl std::future::Future<Output = Result<T, DataError>>,
) -> Result<T, DataError> {
    match timeout(DATA_TIMEOUT, call).await {
        Ok(result) => result,
        Err(_) => Err(DataError::Unavailable("call timed out".to_string())),
    }
}

/// Per-recipient dispatch locks.
///
/// Reminder ticks and digest fires can overlap for the same recipient;
/// serializing per recipient keeps fingerprint check-and-send sequences
/// from racing. Entries are a few words each and live for the process.
#[derive(Default)]
pub struct RecipientLocks {
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl RecipientLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, recipient_id: i64) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(recipient_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        lock.lock_owned().await
    }
}

/// Tuning knobs shared by both dispatchers, lifted out of the full config.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub chart_timeout: Duration,
    pub transport_timeout: Duration,
    pub send_retries: u32,
    pub max_concurrent_sends: usize,
    pub chart_cooldown: ChronoDuration,
}

impl DispatchSettings {
    pub fn from_config(config: &PipwatchConfig) -> Self {
        Self {
            chart_timeout: Duration::from_secs(config.charts.timeout_secs),
            transport_timeout: Duration::from_secs(config.engine.transport_timeout_secs),
            send_retries: config.engine.send_retries,
            max_concurrent_sends: config.engine.max_concurrent_sends,
            chart_cooldown: ChronoDuration::minutes(config.charts.cooldown_minutes),
        }
    }
}

/// Counters for one reminder tick, for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub recipients: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped_duplicate: usize,
    pub skipped_rate_limited: usize,
}

impl TickStats {
    pub(crate) fn record(&mut self, status: DispatchStatus) {
        match status {
            DispatchStatus::Sent => self.sent += 1,
            DispatchStatus::Failed => self.failed += 1,
            DispatchStatus::SkippedDuplicate => self.skipped_duplicate += 1,
            DispatchStatus::SkippedRateLimited => self.skipped_rate_limited += 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sent + self.failed + self.skipped_duplicate + self.skipped_rate_limited == 0
    }
}

pub(crate) struct Delivery {
    pub(crate) retries: u32,
    pub(crate) image_dropped: bool,
}

/// Send with bounded retries, shared by the reminder and digest paths.
/// Transient errors retry with a growing backoff; a permanently rejected
/// image falls back to the bare text before the attempt is declared failed.
pub(crate) async fn deliver(
    transport: &dyn Transport,
    settings: &DispatchSettings,
    target: i64,
    text: &str,
    mut image: Option<Vec<u8>>,
) -> Result<Delivery, (TransportError, u32)> {
    let max_retries = settings.send_retries;
    let mut image_dropped = false;
    let mut attempt: u32 = 0;

    loop {
        let send = async {
            match &image {
                Some(img) => transport.send_image(target, img.clone(), text).await,
                None => transport.send_text(target, text).await,
            }
        };
        let result = match timeout(settings.transport_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(format!(
                "no response within {:?}",
                settings.transport_timeout
            ))),
        };

        match result {
            Ok(()) => {
                return Ok(Delivery {
                    retries: attempt,
                    image_dropped,
                })
            }
            Err(e) if e.is_transient() && attempt < max_retries => {
                warn!(target, err = %e, attempt, "transient send failure; retrying");
                tokio::time::sleep(RETRY_BACKOFF * (attempt + 1)).await;
                attempt += 1;
            }
            Err(e) if image.is_some() && !e.is_transient() => {
                warn!(target, err = %e, "image send rejected; falling back to text");
                image = None;
                image_dropped = true;
            }
            Err(e) => return Err((e, attempt)),
        }
    }
}

/// Orchestrates one reminder pass: fetch → match → dedupe → group →
/// chart → send → record.
pub struct NotificationDispatcher {
    data: Arc<dyn DataLayer>,
    charts: Arc<dyn ChartRenderer>,
    transport: Arc<dyn Transport>,
    dedup: Arc<dyn DedupStore>,
    locks: Arc<RecipientLocks>,
    outcome_tx: mpsc::Sender<DispatchOutcome>,
    settings: DispatchSettings,
}

impl NotificationDispatcher {
    pub fn new(
        data: Arc<dyn DataLayer>,
        charts: Arc<dyn ChartRenderer>,
        transport: Arc<dyn Transport>,
        dedup: Arc<dyn DedupStore>,
        locks: Arc<RecipientLocks>,
        outcome_tx: mpsc::Sender<DispatchOutcome>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            data,
            charts,
            transport,
            dedup,
            locks,
            outcome_tx,
            settings,
        }
    }

    /// One fast-poll tick across every recipient with reminders enabled.
    ///
    /// Recipients run concurrently up to the configured cap; one
    /// recipient's failure never touches the others.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> TickStats {
        let recipients = match with_data_timeout(self.data.recipients_with_notifications()).await
        {
            Ok(recipients) => recipients,
            Err(e) => {
                warn!(err = %e, "could not load recipients; skipping reminder tick");
                return TickStats::default();
            }
        };
        if recipients.is_empty() {
            return TickStats::default();
        }

        let events_by_date = self.fetch_events_for(&recipients, now).await;

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_sends));
        let tasks = recipients.into_iter().filter_map(|pref| {
            let date = match recipient_local_date(&pref, now) {
                Some(date) => date,
                None => {
                    warn!(
                        recipient_id = pref.recipient_id,
                        timezone = %pref.timezone,
                        "unknown recipient timezone; skipping"
                    );
                    return None;
                }
            };
            let events = Arc::clone(events_by_date.get(&date)?);
            let semaphore = Arc::clone(&semaphore);
            Some(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return Vec::new(),
                };
                self.notify_recipient(pref, events, now).await
            })
        });

        let results = join_all(tasks).await;
        let mut stats = TickStats {
            recipients: results.len(),
            ..TickStats::default()
        };
        for statuses in results {
            for status in statuses {
                stats.record(status);
            }
        }
        stats
    }

    /// Fetch each distinct local date once, shared across recipients.
    /// A failed fetch leaves the date absent; its recipients sit out this
    /// tick and are served again on the next one.
    async fn fetch_events_for(
        &self,
        recipients: &[RecipientPreference],
        now: DateTime<Utc>,
    ) -> HashMap<NaiveDate, Arc<Vec<NewsEvent>>> {
        let mut by_date: HashMap<NaiveDate, Arc<Vec<NewsEvent>>> = HashMap::new();
        let mut attempted: HashSet<NaiveDate> = HashSet::new();

        for pref in recipients {
            let Some(date) = recipient_local_date(pref, now) else {
                continue;
            };
            if !attempted.insert(date) {
                continue;
            }
            match with_data_timeout(self.data.events_for_date(date)).await {
                Ok(events) => {
                    by_date.insert(date, Arc::new(events));
                }
                Err(e) => {
                    warn!(%date, err = %e, "event fetch failed; skipping this date for the tick");
                }
            }
        }
        by_date
    }

    async fn notify_recipient(
        &self,
        pref: RecipientPreference,
        events: Arc<Vec<NewsEvent>>,
        now: DateTime<Utc>,
    ) -> Vec<DispatchStatus> {
        let _guard = self.locks.acquire(pref.recipient_id).await;

        let due = find_due_events(&events, &pref, now);
        if due.is_empty() {
            return Vec::new();
        }
        let groups = group_due_events(due);
        debug!(
            recipient_id = pref.recipient_id,
            groups = groups.len(),
            "due event groups"
        );

        let mut statuses = Vec::with_capacity(groups.len());
        for group in groups {
            statuses.push(self.dispatch_group(&pref, group).await);
        }
        statuses
    }

    async fn dispatch_group(
        &self,
        pref: &RecipientPreference,
        group: EventGroup,
    ) -> DispatchStatus {
        let fingerprint = group.fingerprint(pref.recipient_id, pref.lead_minutes);
        match self.dedup.should_send(&fingerprint).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    recipient_id = pref.recipient_id,
                    fingerprint = %fingerprint,
                    "duplicate notification suppressed"
                );
                self.emit(
                    DispatchOutcome::new(
                        pref.recipient_id,
                        OutcomeKind::Reminder,
                        DispatchStatus::SkippedDuplicate,
                    )
                    .with_fingerprint(&fingerprint),
                );
                return DispatchStatus::SkippedDuplicate;
            }
            // Missed notifications hurt more than an occasional duplicate:
            // a broken dedup backend must not silence the engine.
            Err(e) => {
                warn!(err = %e, "dedup store unavailable; failing open and sending");
            }
        }

        let text = format::render_reminder(&group, pref.lead_minutes);
        let mut chart_degraded = false;
        let mut detail: Option<String> = None;
        let mut image: Option<Vec<u8>> = None;

        if pref.charts_enabled {
            match self
                .dedup
                .can_send_chart(pref.recipient_id, self.settings.chart_cooldown)
                .await
            {
                Ok(true) => {
                    image = self.render_chart(pref, &group).await;
                    chart_degraded = image.is_none();
                }
                Ok(false) => {
                    debug!(recipient_id = pref.recipient_id, "chart cooldown active");
                    detail = Some("chart on cooldown".to_string());
                }
                Err(e) => {
                    warn!(err = %e, "chart cooldown check failed; sending text only");
                    chart_degraded = true;
                }
            }
        }

        match deliver(
            self.transport.as_ref(),
            &self.settings,
            pref.chat_id,
            &text,
            image,
        )
        .await
        {
            Ok(delivery) => {
                let degraded = chart_degraded || delivery.image_dropped;
                let mut outcome = DispatchOutcome::new(
                    pref.recipient_id,
                    OutcomeKind::Reminder,
                    DispatchStatus::Sent,
                )
                .with_fingerprint(&fingerprint)
                .with_retries(delivery.retries);
                if degraded {
                    outcome = outcome.with_chart_degraded();
                }
                if let Some(detail) = detail {
                    outcome = outcome.with_detail(detail);
                }
                self.emit(outcome);
                info!(
                    recipient_id = pref.recipient_id,
                    events = group.members.len(),
                    retries = delivery.retries,
                    "reminder sent"
                );

                if group.is_multi() {
                    self.send_poll_for(pref, &group).await;
                }
                DispatchStatus::Sent
            }
            Err((err, retries)) => {
                warn!(
                    recipient_id = pref.recipient_id,
                    err = %err,
                    retries,
                    "reminder delivery failed"
                );
                let mut outcome = DispatchOutcome::new(
                    pref.recipient_id,
                    OutcomeKind::Reminder,
                    DispatchStatus::Failed,
                )
                .with_fingerprint(&fingerprint)
                .with_retries(retries)
                .with_detail(err.to_string());
                if chart_degraded {
                    outcome = outcome.with_chart_degraded();
                }
                self.emit(outcome);
                DispatchStatus::Failed
            }
        }
    }

    /// Render the group's chart, bounded by the chart timeout. Returns
    /// None on any failure; the notification goes out text-only.
    async fn render_chart(
        &self,
        pref: &RecipientPreference,
        group: &EventGroup,
    ) -> Option<Vec<u8>> {
        let primary = group.primary();
        let render = self.charts.render(
            &primary.event.currency,
            primary.instant,
            pref.chart_window_hours,
            pref.chart_style,
        );
        match timeout(self.settings.chart_timeout, render).await {
            Ok(Ok(png)) => {
                if let Err(e) = self.dedup.mark_chart_sent(pref.recipient_id).await {
                    warn!(err = %e, "could not record chart send");
                }
                Some(png)
            }
            Ok(Err(e)) => {
                warn!(
                    recipient_id = pref.recipient_id,
                    err = %e,
                    "chart render failed; sending text only"
                );
                None
            }
            Err(_) => {
                warn!(
                    recipient_id = pref.recipient_id,
                    timeout_secs = self.settings.chart_timeout.as_secs(),
                    "chart render timed out; sending text only"
                );
                None
            }
        }
    }

    /// One sentiment poll per multi-event group, keyed on the primary
    /// event's currency. Failures are logged and recorded but never affect
    /// the main notification.
    async fn send_poll_for(&self, pref: &RecipientPreference, group: &EventGroup) {
        let currency = &group.primary().event.currency;
        let Some(pair) = format::pair_for_currency(currency) else {
            debug!(%currency, "no sentiment pair for currency; poll skipped");
            return;
        };
        let question = format::poll_question(pair);
        let options = format::poll_options();

        let send = self.transport.send_poll(pref.chat_id, &question, &options);
        match timeout(self.settings.transport_timeout, send).await {
            Ok(Ok(())) => {
                self.emit(DispatchOutcome::new(
                    pref.recipient_id,
                    OutcomeKind::Poll,
                    DispatchStatus::Sent,
                ));
            }
            Ok(Err(e)) => {
                warn!(recipient_id = pref.recipient_id, err = %e, "sentiment poll failed");
                self.emit(
                    DispatchOutcome::new(
                        pref.recipient_id,
                        OutcomeKind::Poll,
                        DispatchStatus::Failed,
                    )
                    .with_detail(e.to_string()),
                );
            }
            Err(_) => {
                warn!(
                    recipient_id = pref.recipient_id,
                    "sentiment poll timed out"
                );
                self.emit(
                    DispatchOutcome::new(
                        pref.recipient_id,
                        OutcomeKind::Poll,
                        DispatchStatus::Failed,
                    )
                    .with_detail("poll send timed out"),
                );
            }
        }
    }

    fn emit(&self, outcome: DispatchOutcome) {
        if self.outcome_tx.try_send(outcome).is_err() {
            warn!("outcome channel full; dropping record");
        }
    }
}

fn recipient_local_date(pref: &RecipientPreference, now: DateTime<Utc>) -> Option<NaiveDate> {
    let tz = timeutil::parse_zone(&pref.timezone).ok()?;
    Some(now.with_timezone(&tz).date_naive())
}

/// Reminder fast-poll loop. Each tick scans every notification-enabled
/// recipient for events entering their lead window, until `shutdown`
/// broadcasts `true`.
pub async fn run_reminder_poller(
    dispatcher: Arc<NotificationDispatcher>,
    every: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!(every_secs = every.as_secs(), "reminder poller started");
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let stats = dispatcher.run_tick(Utc::now()).await;
                if !stats.is_empty() {
                    info!(
                        sent = stats.sent,
                        failed = stats.failed,
                        skipped_duplicate = stats.skipped_duplicate,
                        "reminder tick"
                    );
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("reminder poller shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone};
    use pipwatch_core::ports::{ChartError, DataError};
    use pipwatch_core::types::{ChartStyle, ImpactLevel};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use crate::dedup::{DedupError, MemoryDedupStore};
    use crate::fingerprint::Fingerprint;

    struct MockData {
        events: Vec<NewsEvent>,
        recipients: Vec<RecipientPreference>,
        fail: bool,
    }

    #[async_trait]
    impl DataLayer for MockData {
        async fn events_for_date(&self, _date: NaiveDate) -> Result<Vec<NewsEvent>, DataError> {
            if self.fail {
                return Err(DataError::Unavailable("mock outage".to_string()));
            }
            Ok(self.events.clone())
        }

        async fn recipients_with_notifications(
            &self,
        ) -> Result<Vec<RecipientPreference>, DataError> {
            if self.fail {
                return Err(DataError::Unavailable("mock outage".to_string()));
            }
            Ok(self.recipients.clone())
        }

        async fn recipients_with_digest(&self) -> Result<Vec<RecipientPreference>, DataError> {
            Ok(Vec::new())
        }
    }

    struct MockCharts {
        renders: AtomicUsize,
        delay: Option<Duration>,
        fail: bool,
    }

    impl MockCharts {
        fn ok() -> Self {
            Self {
                renders: AtomicUsize::new(0),
                delay: None,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl ChartRenderer for MockCharts {
        async fn render(
            &self,
            _currency: &str,
            _event_instant: DateTime<Utc>,
            _window_hours: u32,
            _style: ChartStyle,
        ) -> Result<Vec<u8>, ChartError> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(ChartError::Unavailable("mock render failure".to_string()));
            }
            Ok(vec![0x89, 0x50, 0x4e, 0x47])
        }
    }

    #[derive(Default)]
    struct MockTransport {
        text_attempts: AtomicUsize,
        image_attempts: AtomicUsize,
        polls: AtomicUsize,
        transient_failures_left: AtomicUsize,
        always_unreachable: bool,
        last_text: StdMutex<Option<String>>,
    }

    impl MockTransport {
        fn failing_transiently(times: usize) -> Self {
            Self {
                transient_failures_left: AtomicUsize::new(times),
                ..Self::default()
            }
        }

        fn unreachable() -> Self {
            Self {
                always_unreachable: true,
                ..Self::default()
            }
        }

        fn take_failure(&self) -> Option<TransportError> {
            if self.always_unreachable {
                return Some(TransportError::Unreachable("blocked".to_string()));
            }
            let left = self.transient_failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.transient_failures_left.store(left - 1, Ordering::SeqCst);
                return Some(TransportError::Network("connection reset".to_string()));
            }
            None
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_text(&self, _target: i64, text: &str) -> Result<(), TransportError> {
            self.text_attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.take_failure() {
                return Err(err);
            }
            *self.last_text.lock().unwrap() = Some(text.to_string());
            Ok(())
        }

        async fn send_image(
            &self,
            _target: i64,
            _image: Vec<u8>,
            _caption: &str,
        ) -> Result<(), TransportError> {
            self.image_attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.take_failure() {
                return Err(err);
            }
            Ok(())
        }

        async fn send_poll(
            &self,
            _target: i64,
            _question: &str,
            _options: &[String],
        ) -> Result<(), TransportError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct BrokenDedup;

    #[async_trait]
    impl DedupStore for BrokenDedup {
        async fn should_send(&self, _fingerprint: &Fingerprint) -> Result<bool, DedupError> {
            Err(DedupError::Unavailable("mock backend down".to_string()))
        }

        async fn can_send_chart(
            &self,
            _recipient_id: i64,
            _cooldown: ChronoDuration,
        ) -> Result<bool, DedupError> {
            Err(DedupError::Unavailable("mock backend down".to_string()))
        }

        async fn mark_chart_sent(&self, _recipient_id: i64) -> Result<(), DedupError> {
            Err(DedupError::Unavailable("mock backend down".to_string()))
        }

        async fn purge_expired(&self) -> Result<usize, DedupError> {
            Err(DedupError::Unavailable("mock backend down".to_string()))
        }
    }

    fn pref(charts: bool) -> RecipientPreference {
        RecipientPreference {
            recipient_id: 7,
            chat_id: 700,
            timezone: "Europe/Prague".to_string(),
            currencies: vec![],
            digest_impact: vec![ImpactLevel::High, ImpactLevel::Medium],
            reminder_impact: vec![ImpactLevel::High],
            lead_minutes: 30,
            notifications_enabled: true,
            digest_enabled: true,
            digest_time: "08:00".to_string(),
            charts_enabled: charts,
            chart_style: ChartStyle::Single,
            chart_window_hours: 2,
        }
    }

    fn event(title: &str, time: &str) -> NewsEvent {
        NewsEvent {
            date: NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
            time: time.to_string(),
            currency: "USD".to_string(),
            title: title.to_string(),
            impact: ImpactLevel::High,
            actual: None,
            forecast: None,
            previous: None,
            analysis: None,
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            chart_timeout: Duration::from_millis(200),
            transport_timeout: Duration::from_secs(2),
            send_retries: 1,
            max_concurrent_sends: 4,
            chart_cooldown: ChronoDuration::minutes(120),
        }
    }

    /// 13:00 UTC = 14:00 in Prague (winter): 30 minutes before 14:30.
    fn due_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 13, 0, 0).unwrap()
    }

    struct Harness {
        dispatcher: NotificationDispatcher,
        transport: Arc<MockTransport>,
        charts: Arc<MockCharts>,
        outcome_rx: mpsc::Receiver<DispatchOutcome>,
    }

    fn harness(
        data: MockData,
        charts: MockCharts,
        transport: MockTransport,
        dedup: Arc<dyn DedupStore>,
    ) -> Harness {
        let (outcome_tx, outcome_rx) = mpsc::channel(64);
        let transport = Arc::new(transport);
        let charts = Arc::new(charts);
        let dispatcher = NotificationDispatcher::new(
            Arc::new(data),
            Arc::clone(&charts) as Arc<dyn ChartRenderer>,
            Arc::clone(&transport) as Arc<dyn Transport>,
            dedup,
            Arc::new(RecipientLocks::new()),
            outcome_tx,
            settings(),
        );
        Harness {
            dispatcher,
            transport,
            charts,
            outcome_rx,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<DispatchOutcome>) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(outcome) = rx.try_recv() {
            outcomes.push(outcome);
        }
        outcomes
    }

    #[tokio::test]
    async fn simultaneous_events_send_one_message_and_one_poll() {
        let data = MockData {
            events: vec![event("Non-Farm Payrolls", "14:30"), event("Unemployment Rate", "14:30")],
            recipients: vec![pref(false)],
            fail: false,
        };
        let mut h = harness(data, MockCharts::ok(), MockTransport::default(), Arc::new(MemoryDedupStore::new()));

        let stats = h.dispatcher.run_tick(due_now()).await;
        assert_eq!(stats.sent, 1);
        assert_eq!(h.transport.text_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.polls.load(Ordering::SeqCst), 1);

        let text = h.transport.last_text.lock().unwrap().clone().unwrap();
        assert!(text.starts_with("⚠️ In 30 minutes: Multiple news events!"));

        // Same tick again: the group fingerprint suppresses a resend.
        let stats = h.dispatcher.run_tick(due_now()).await;
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.skipped_duplicate, 1);
        assert_eq!(h.transport.text_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chart_timeout_degrades_to_text() {
        let data = MockData {
            events: vec![event("Non-Farm Payrolls", "14:30")],
            recipients: vec![pref(true)],
            fail: false,
        };
        let slow_charts = MockCharts {
            renders: AtomicUsize::new(0),
            delay: Some(Duration::from_secs(5)),
            fail: false,
        };
        let mut h = harness(data, slow_charts, MockTransport::default(), Arc::new(MemoryDedupStore::new()));

        let stats = h.dispatcher.run_tick(due_now()).await;
        assert_eq!(stats.sent, 1);
        assert_eq!(h.transport.text_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.image_attempts.load(Ordering::SeqCst), 0);

        let outcomes = drain(&mut h.outcome_rx);
        let sent = outcomes
            .iter()
            .find(|o| o.status == DispatchStatus::Sent)
            .unwrap();
        assert!(sent.chart_degraded);
    }

    #[tokio::test]
    async fn chart_cooldown_allows_one_chart() {
        let dedup = Arc::new(MemoryDedupStore::new());
        let first = MockData {
            events: vec![event("CPI", "14:30")],
            recipients: vec![pref(true)],
            fail: false,
        };
        let mut h = harness(first, MockCharts::ok(), MockTransport::default(), Arc::clone(&dedup) as Arc<dyn DedupStore>);

        let stats = h.dispatcher.run_tick(due_now()).await;
        assert_eq!(stats.sent, 1);
        assert_eq!(h.transport.image_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.text_attempts.load(Ordering::SeqCst), 0);

        // A different event half an hour later: still inside the cooldown.
        let second = MockData {
            events: vec![event("Retail Sales", "15:00")],
            recipients: vec![pref(true)],
            fail: false,
        };
        let mut h2 = harness(second, MockCharts::ok(), MockTransport::default(), Arc::clone(&dedup) as Arc<dyn DedupStore>);
        let later = Utc.with_ymd_and_hms(2026, 1, 15, 13, 30, 0).unwrap();
        let stats = h2.dispatcher.run_tick(later).await;
        assert_eq!(stats.sent, 1);
        assert_eq!(h2.transport.image_attempts.load(Ordering::SeqCst), 0);
        assert_eq!(h2.transport.text_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(h2.charts.renders.load(Ordering::SeqCst), 0);

        let outcomes = drain(&mut h2.outcome_rx);
        let sent = outcomes
            .iter()
            .find(|o| o.status == DispatchStatus::Sent)
            .unwrap();
        assert_eq!(sent.detail.as_deref(), Some("chart on cooldown"));
    }

    #[tokio::test]
    async fn transient_failure_retries_once() {
        let data = MockData {
            events: vec![event("Non-Farm Payrolls", "14:30")],
            recipients: vec![pref(false)],
            fail: false,
        };
        let mut h = harness(
            data,
            MockCharts::ok(),
            MockTransport::failing_transiently(1),
            Arc::new(MemoryDedupStore::new()),
        );

        let stats = h.dispatcher.run_tick(due_now()).await;
        assert_eq!(stats.sent, 1);
        assert_eq!(h.transport.text_attempts.load(Ordering::SeqCst), 2);

        let outcomes = drain(&mut h.outcome_rx);
        let sent = outcomes
            .iter()
            .find(|o| o.status == DispatchStatus::Sent)
            .unwrap();
        assert_eq!(sent.retries, 1);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let data = MockData {
            events: vec![event("Non-Farm Payrolls", "14:30")],
            recipients: vec![pref(false)],
            fail: false,
        };
        let mut h = harness(
            data,
            MockCharts::ok(),
            MockTransport::unreachable(),
            Arc::new(MemoryDedupStore::new()),
        );

        let stats = h.dispatcher.run_tick(due_now()).await;
        assert_eq!(stats.failed, 1);
        assert_eq!(h.transport.text_attempts.load(Ordering::SeqCst), 1);

        let outcomes = drain(&mut h.outcome_rx);
        let failed = outcomes
            .iter()
            .find(|o| o.status == DispatchStatus::Failed)
            .unwrap();
        assert_eq!(failed.retries, 0);
        // The fingerprint stays marked: no resend storm on the next tick.
        let stats = h.dispatcher.run_tick(due_now()).await;
        assert_eq!(stats.skipped_duplicate, 1);
    }

    #[tokio::test]
    async fn data_outage_skips_the_whole_tick() {
        let data = MockData {
            events: vec![event("Non-Farm Payrolls", "14:30")],
            recipients: vec![pref(false)],
            fail: true,
        };
        let h = harness(data, MockCharts::ok(), MockTransport::default(), Arc::new(MemoryDedupStore::new()));

        let stats = h.dispatcher.run_tick(due_now()).await;
        assert_eq!(stats, TickStats::default());
        assert_eq!(h.transport.text_attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn broken_dedup_store_fails_open() {
        let data = MockData {
            events: vec![event("Non-Farm Payrolls", "14:30")],
            recipients: vec![pref(false)],
            fail: false,
        };
        let h = harness(data, MockCharts::ok(), MockTransport::default(), Arc::new(BrokenDedup));

        let stats = h.dispatcher.run_tick(due_now()).await;
        assert_eq!(stats.sent, 1);
        assert_eq!(h.transport.text_attempts.load(Ordering::SeqCst), 1);
    }
}
