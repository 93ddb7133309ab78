use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use std::fmt;

/// Deterministic dedup key for one notification attempt.
///
/// The key is a kind prefix plus a SHA-256 over the canonical components,
/// so equal attempts collide exactly and the raw recipient/event data never
/// leaks into logs or an external store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Key for a single-event reminder.
    pub fn event(recipient_id: i64, identity: &str, lead_minutes: i64) -> Self {
        Self(format!(
            "evt:{}",
            digest_hex(&format!("{}:{}:{}", recipient_id, lead_minutes, identity))
        ))
    }

    /// Key for a multi-event group reminder.
    ///
    /// Member identities are sorted before hashing so the same simultaneous
    /// cluster produces the same key even when two ticks match the events
    /// in different orders.
    pub fn group(recipient_id: i64, identities: &[String], lead_minutes: i64) -> Self {
        let mut sorted: Vec<&str> = identities.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        Self(format!(
            "grp:{}",
            digest_hex(&format!(
                "{}:{}:{}",
                recipient_id,
                lead_minutes,
                sorted.join(",")
            ))
        ))
    }

    /// Key for a daily digest send (one per recipient per local date).
    pub fn digest(recipient_id: i64, date: NaiveDate) -> Self {
        Self(format!(
            "dig:{}",
            digest_hex(&format!("{}:{}", recipient_id, date))
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn digest_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
