use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use pipwatch_core::ports::{DataLayer, Transport};
use pipwatch_core::types::{ImpactLevel, NewsEvent, RecipientPreference};

use crate::dedup::DedupStore;
use crate::dispatch::{deliver, with_data_timeout, DispatchSettings, RecipientLocks, TickStats};
use crate::fingerprint::Fingerprint;
use crate::format;
use crate::outcome::{DispatchOutcome, DispatchStatus, OutcomeKind};

/// Delivers daily digests for fired schedule keys and for the configured
/// broadcast channel.
pub struct DigestDispatcher {
    data: Arc<dyn DataLayer>,
    transport: Arc<dyn Transport>,
    dedup: Arc<dyn DedupStore>,
    locks: Arc<RecipientLocks>,
    outcome_tx: mpsc::Sender<DispatchOutcome>,
    settings: DispatchSettings,
}

impl DigestDispatcher {
    pub fn new(
        data: Arc<dyn DataLayer>,
        transport: Arc<dyn Transport>,
        dedup: Arc<dyn DedupStore>,
        locks: Arc<RecipientLocks>,
        outcome_tx: mpsc::Sender<DispatchOutcome>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            data,
            transport,
            dedup,
            locks,
            outcome_tx,
            settings,
        }
    }

    /// Deliver digests for one fired (timezone, time) key.
    ///
    /// `member_ids` is the scheduler's snapshot for the key; preferences
    /// are re-read here so filter edits made since the last resync still
    /// apply. The key's local-date events are fetched once and shared.
    pub async fn run_for_key(
        &self,
        tz: Tz,
        member_ids: &BTreeSet<i64>,
        now: DateTime<Utc>,
    ) -> TickStats {
        let mut stats = TickStats::default();

        let recipients = match with_data_timeout(self.data.recipients_with_digest()).await {
            Ok(recipients) => recipients,
            Err(e) => {
                warn!(err = %e, "could not load digest recipients; key skipped");
                return stats;
            }
        };
        let selected: Vec<RecipientPreference> = recipients
            .into_iter()
            .filter(|pref| member_ids.contains(&pref.recipient_id))
            .collect();
        if selected.is_empty() {
            return stats;
        }

        let date = now.with_timezone(&tz).date_naive();
        let events = match with_data_timeout(self.data.events_for_date(date)).await {
            Ok(events) => events,
            Err(e) => {
                warn!(%date, err = %e, "event fetch failed; digest key skipped");
                return stats;
            }
        };

        stats.recipients = selected.len();
        for pref in selected {
            let status = self.send_digest(&pref, date, &events).await;
            stats.record(status);
        }
        info!(
            timezone = %tz,
            %date,
            recipients = stats.recipients,
            sent = stats.sent,
            failed = stats.failed,
            "digest key delivered"
        );
        stats
    }

    async fn send_digest(
        &self,
        pref: &RecipientPreference,
        date: chrono::NaiveDate,
        events: &[NewsEvent],
    ) -> DispatchStatus {
        let _guard = self.locks.acquire(pref.recipient_id).await;

        let fingerprint = Fingerprint::digest(pref.recipient_id, date);
        match self.dedup.should_send(&fingerprint).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    recipient_id = pref.recipient_id,
                    %date,
                    "digest already sent today"
                );
                self.emit(
                    DispatchOutcome::new(
                        pref.recipient_id,
                        OutcomeKind::Digest,
                        DispatchStatus::SkippedDuplicate,
                    )
                    .with_fingerprint(&fingerprint),
                );
                return DispatchStatus::SkippedDuplicate;
            }
            Err(e) => {
                warn!(err = %e, "dedup store unavailable; failing open and sending");
            }
        }

        let selected: Vec<NewsEvent> = events
            .iter()
            .filter(|event| {
                pref.wants_digest_impact(event.impact) && pref.follows_currency(&event.currency)
            })
            .cloned()
            .collect();
        let text = if selected.is_empty() {
            format::EMPTY_DIGEST_TEXT.to_string()
        } else {
            format::render_digest(date, &selected)
        };

        self.deliver_digest(
            pref.recipient_id,
            pref.chat_id,
            OutcomeKind::Digest,
            &fingerprint,
            &text,
        )
        .await
    }

    /// The channel broadcast: fixed high+medium filter, no personalization,
    /// and nothing at all on a day without matching events.
    pub async fn run_broadcast(&self, chat_id: i64, tz: Tz, now: DateTime<Utc>) {
        let date = now.with_timezone(&tz).date_naive();
        let events = match with_data_timeout(self.data.events_for_date(date)).await {
            Ok(events) => events,
            Err(e) => {
                warn!(%date, err = %e, "event fetch failed; broadcast skipped");
                return;
            }
        };
        let selected: Vec<NewsEvent> = events
            .into_iter()
            .filter(|event| {
                matches!(event.impact, ImpactLevel::High | ImpactLevel::Medium)
            })
            .collect();
        if selected.is_empty() {
            debug!(%date, "no high or medium events; broadcast skipped");
            return;
        }

        let fingerprint = Fingerprint::digest(chat_id, date);
        match self.dedup.should_send(&fingerprint).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(chat_id, %date, "broadcast already sent today");
                return;
            }
            Err(e) => {
                warn!(err = %e, "dedup store unavailable; failing open and sending");
            }
        }

        let text = format::render_digest(date, &selected);
        let status = self
            .deliver_digest(chat_id, chat_id, OutcomeKind::Broadcast, &fingerprint, &text)
            .await;
        info!(chat_id, %date, status = %status, "broadcast digest finished");
    }

    async fn deliver_digest(
        &self,
        recipient_id: i64,
        chat_id: i64,
        kind: OutcomeKind,
        fingerprint: &Fingerprint,
        text: &str,
    ) -> DispatchStatus {
        match deliver(self.transport.as_ref(), &self.settings, chat_id, text, None).await {
            Ok(delivery) => {
                self.emit(
                    DispatchOutcome::new(recipient_id, kind, DispatchStatus::Sent)
                        .with_fingerprint(fingerprint)
                        .with_retries(delivery.retries),
                );
                DispatchStatus::Sent
            }
            Err((err, retries)) => {
                warn!(recipient_id, err = %err, retries, "digest delivery failed");
                self.emit(
                    DispatchOutcome::new(recipient_id, kind, DispatchStatus::Failed)
                        .with_fingerprint(fingerprint)
                        .with_retries(retries)
                        .with_detail(err.to_string()),
                );
                DispatchStatus::Failed
            }
        }
    }

    fn emit(&self, outcome: DispatchOutcome) {
        if self.outcome_tx.try_send(outcome).is_err() {
            warn!("outcome channel full; dropping record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone};
    use pipwatch_core::ports::{DataError, TransportError};
    use pipwatch_core::types::ChartStyle;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use crate::dedup::MemoryDedupStore;

    struct MockData {
        events: Vec<NewsEvent>,
        recipients: Vec<RecipientPreference>,
    }

    #[async_trait]
    impl DataLayer for MockData {
        async fn events_for_date(&self, _date: NaiveDate) -> Result<Vec<NewsEvent>, DataError> {
            Ok(self.events.clone())
        }

        async fn recipients_with_notifications(
            &self,
        ) -> Result<Vec<RecipientPreference>, DataError> {
            Ok(Vec::new())
        }

        async fn recipients_with_digest(&self) -> Result<Vec<RecipientPreference>, DataError> {
            Ok(self.recipients.clone())
        }
    }

    #[derive(Default)]
    struct MockTransport {
        sent: StdMutex<Vec<(i64, String)>>,
        fail_targets: HashSet<i64>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_text(&self, target: i64, text: &str) -> Result<(), TransportError> {
            if self.fail_targets.contains(&target) {
                return Err(TransportError::Unreachable("blocked".to_string()));
            }
            self.sent.lock().unwrap().push((target, text.to_string()));
            Ok(())
        }

        async fn send_image(
            &self,
            _target: i64,
            _image: Vec<u8>,
            _caption: &str,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send_poll(
            &self,
            _target: i64,
            _question: &str,
            _options: &[String],
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn pref(recipient_id: i64, currencies: &[&str]) -> RecipientPreference {
        RecipientPreference {
            recipient_id,
            chat_id: recipient_id * 100,
            timezone: "Europe/Prague".to_string(),
            currencies: currencies.iter().map(|c| c.to_string()).collect(),
            digest_impact: vec![ImpactLevel::High, ImpactLevel::Medium],
            reminder_impact: vec![ImpactLevel::High],
            lead_minutes: 30,
            notifications_enabled: true,
            digest_enabled: true,
            digest_time: "08:00".to_string(),
            charts_enabled: false,
            chart_style: ChartStyle::Single,
            chart_window_hours: 2,
        }
    }

    fn event(currency: &str, title: &str, time: &str, impact: ImpactLevel) -> NewsEvent {
        NewsEvent {
            date: NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
            time: time.to_string(),
            currency: currency.to_string(),
            title: title.to_string(),
            impact,
            actual: None,
            forecast: None,
            previous: None,
            analysis: None,
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            chart_timeout: Duration::from_secs(1),
            transport_timeout: Duration::from_secs(2),
            send_retries: 1,
            max_concurrent_sends: 4,
            chart_cooldown: chrono::Duration::minutes(120),
        }
    }

    fn harness(
        data: MockData,
        transport: MockTransport,
    ) -> (DigestDispatcher, Arc<MockTransport>, mpsc::Receiver<DispatchOutcome>) {
        let (outcome_tx, outcome_rx) = mpsc::channel(64);
        let transport = Arc::new(transport);
        let dispatcher = DigestDispatcher::new(
            Arc::new(data),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(MemoryDedupStore::new()),
            Arc::new(RecipientLocks::new()),
            outcome_tx,
            settings(),
        );
        (dispatcher, transport, outcome_rx)
    }

    fn prague() -> Tz {
        "Europe/Prague".parse().unwrap()
    }

    /// 06:30 UTC is 07:30 in Prague (winter), local date 15.1.2026.
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 6, 30, 0).unwrap()
    }

    #[tokio::test]
    async fn renders_and_dedupes_per_date() {
        let data = MockData {
            events: vec![
                event("USD", "Non-Farm Payrolls", "14:30", ImpactLevel::High),
                event("EUR", "ECB Press Conference", "10:00", ImpactLevel::Medium),
            ],
            recipients: vec![pref(1, &[])],
        };
        let (dispatcher, transport, _rx) = harness(data, MockTransport::default());
        let members: BTreeSet<i64> = [1].into_iter().collect();

        let stats = dispatcher.run_for_key(prague(), &members, now()).await;
        assert_eq!(stats.sent, 1);
        {
            let sent = transport.sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].0, 100);
            assert!(sent[0].1.contains("📅 Daily Digest for 15.1.2026"));
            assert!(sent[0].1.contains("💎 EUR"));
            assert!(sent[0].1.contains("💎 USD"));
        }

        let stats = dispatcher.run_for_key(prague(), &members, now()).await;
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.skipped_duplicate, 1);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_selection_sends_placeholder() {
        let data = MockData {
            events: vec![event("USD", "Non-Farm Payrolls", "14:30", ImpactLevel::High)],
            recipients: vec![pref(1, &["GBP"])],
        };
        let (dispatcher, transport, _rx) = harness(data, MockTransport::default());
        let members: BTreeSet<i64> = [1].into_iter().collect();

        let stats = dispatcher.run_for_key(prague(), &members, now()).await;
        assert_eq!(stats.sent, 1);
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].1, format::EMPTY_DIGEST_TEXT);
    }

    #[tokio::test]
    async fn only_key_members_receive_the_digest() {
        let data = MockData {
            events: vec![event("USD", "Non-Farm Payrolls", "14:30", ImpactLevel::High)],
            recipients: vec![pref(1, &[]), pref(2, &[])],
        };
        let (dispatcher, transport, _rx) = harness(data, MockTransport::default());
        let members: BTreeSet<i64> = [2].into_iter().collect();

        let stats = dispatcher.run_for_key(prague(), &members, now()).await;
        assert_eq!(stats.sent, 1);
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 200);
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_batch() {
        let data = MockData {
            events: vec![event("USD", "Non-Farm Payrolls", "14:30", ImpactLevel::High)],
            recipients: vec![pref(1, &[]), pref(2, &[])],
        };
        let transport = MockTransport {
            fail_targets: [100].into_iter().collect(),
            ..MockTransport::default()
        };
        let (dispatcher, transport, mut rx) = harness(data, transport);
        let members: BTreeSet<i64> = [1, 2].into_iter().collect();

        let stats = dispatcher.run_for_key(prague(), &members, now()).await;
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);

        let mut statuses = Vec::new();
        while let Ok(outcome) = rx.try_recv() {
            statuses.push((outcome.recipient_id, outcome.status));
        }
        assert!(statuses.contains(&(1, DispatchStatus::Failed)));
        assert!(statuses.contains(&(2, DispatchStatus::Sent)));
    }

    #[tokio::test]
    async fn broadcast_keeps_high_and_medium_only() {
        let data = MockData {
            events: vec![
                event("USD", "Non-Farm Payrolls", "14:30", ImpactLevel::High),
                event("EUR", "German Factory Orders", "08:00", ImpactLevel::Low),
            ],
            recipients: vec![],
        };
        let (dispatcher, transport, _rx) = harness(data, MockTransport::default());

        dispatcher.run_broadcast(-1000, prague(), now()).await;
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, -1000);
        assert!(sent[0].1.contains("Non-Farm Payrolls"));
        assert!(!sent[0].1.contains("German Factory Orders"));
    }

    #[tokio::test]
    async fn broadcast_skips_an_empty_day() {
        let data = MockData {
            events: vec![event("EUR", "German Factory Orders", "08:00", ImpactLevel::Low)],
            recipients: vec![],
        };
        let (dispatcher, transport, _rx) = harness(data, MockTransport::default());

        dispatcher.run_broadcast(-1000, prague(), now()).await;
        assert!(transport.sent.lock().unwrap().is_empty());
    }
}
