use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::types::{ChartStyle, NewsEvent, RecipientPreference};

/// Calendar data and recipient preferences, owned by an external store.
///
/// A failed call is logged and the current tick is skipped; the next tick
/// retries naturally, so implementations should not retry internally.
#[async_trait]
pub trait DataLayer: Send + Sync {
    /// All events scheduled for `date` (the recipient's local date).
    async fn events_for_date(&self, date: NaiveDate) -> Result<Vec<NewsEvent>, DataError>;

    /// Recipients with event reminders switched on.
    async fn recipients_with_notifications(&self)
        -> Result<Vec<RecipientPreference>, DataError>;

    /// Recipients with the daily digest switched on.
    async fn recipients_with_digest(&self) -> Result<Vec<RecipientPreference>, DataError>;
}

/// External chart-rendering service.
#[async_trait]
pub trait ChartRenderer: Send + Sync {
    /// Render a price chart around `event_instant` for `currency`.
    /// Returns encoded image bytes (PNG). Callers bound this with a timeout.
    async fn render(
        &self,
        currency: &str,
        event_instant: DateTime<Utc>,
        window_hours: u32,
        style: ChartStyle,
    ) -> Result<Vec<u8>, ChartError>;
}

/// Outbound message delivery to a chat target.
///
/// The engine hands over plain text; markup escaping and delivery-format
/// fallback are the adapter's concern.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(&self, target: i64, text: &str) -> Result<(), TransportError>;

    async fn send_image(
        &self,
        target: i64,
        image: Vec<u8>,
        caption: &str,
    ) -> Result<(), TransportError>;

    async fn send_poll(
        &self,
        target: i64,
        question: &str,
        options: &[String],
    ) -> Result<(), TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("data layer unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    Query(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ChartError {
    #[error("chart service unavailable: {0}")]
    Unavailable(String),

    #[error("chart render failed ({status}): {message}")]
    Render { status: u16, message: String },

    #[error("chart service returned no image data")]
    Empty,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("send timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    /// Recipient blocked the bot or the chat no longer exists.
    #[error("recipient unreachable: {0}")]
    Unreachable(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Transient errors are worth one immediate retry; permanent
    /// rejections never are.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout(_) | TransportError::Network(_))
    }
}
