use chrono::{DateTime, Utc};

use crate::fingerprint::Fingerprint;
use crate::matcher::DueEvent;

/// One or more due events sharing the same feed time-of-day string.
///
/// Members keep the order the matcher produced (feed order); rendering
/// partitions them into impact buckets without reordering inside a bucket.
#[derive(Debug, Clone)]
pub struct EventGroup {
    /// The shared time-of-day label, exactly as the feed spells it.
    pub time_label: String,
    /// Absolute instant of the shared time, for ordering groups.
    pub instant: DateTime<Utc>,
    pub members: Vec<DueEvent>,
}

impl EventGroup {
    /// The event that represents the group for charts and polls.
    pub fn primary(&self) -> &DueEvent {
        &self.members[0]
    }

    pub fn is_multi(&self) -> bool {
        self.members.len() > 1
    }

    /// Dedup key for this group's notification to `recipient_id`.
    ///
    /// Single-event groups key on the event itself; multi-event groups key
    /// on the sorted member set, so the cluster counts as one notification
    /// even when two ticks assemble it in different orders.
    pub fn fingerprint(&self, recipient_id: i64, lead_minutes: i64) -> Fingerprint {
        if self.is_multi() {
            let identities: Vec<String> =
                self.members.iter().map(|d| d.event.identity()).collect();
            Fingerprint::group(recipient_id, &identities, lead_minutes)
        } else {
            Fingerprint::event(recipient_id, &self.primary().event.identity(), lead_minutes)
        }
    }
}

/// Cluster due events by their shared time label, earliest group first.
pub fn group_due_events(due: Vec<DueEvent>) -> Vec<EventGroup> {
    let mut groups: Vec<EventGroup> = Vec::new();
    for d in due {
        match groups.iter_mut().find(|g| g.time_label == d.event.time) {
            Some(group) => group.members.push(d),
            None => groups.push(EventGroup {
                time_label: d.event.time.clone(),
                instant: d.instant,
                members: vec![d],
            }),
        }
    }
    groups.sort_by_key(|g| g.instant);
    groups
}
