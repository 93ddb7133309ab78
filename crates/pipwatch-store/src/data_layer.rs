use async_trait::async_trait;
use chrono::NaiveDate;

use pipwatch_core::ports::{DataError, DataLayer};
use pipwatch_core::types::{NewsEvent, RecipientPreference};

use crate::error::StoreError;
use crate::events::EventStore;
use crate::recipients::RecipientStore;

/// SQLite-backed implementation of the engine's data port.
///
/// Queries are short point lookups; they run inline on the async worker
/// rather than through a blocking pool.
pub struct SqliteDataLayer {
    events: EventStore,
    recipients: RecipientStore,
}

impl SqliteDataLayer {
    pub fn new(events: EventStore, recipients: RecipientStore) -> Self {
        Self { events, recipients }
    }
}

fn to_data_error(e: StoreError) -> DataError {
    DataError::Query(e.to_string())
}

#[async_trait]
impl DataLayer for SqliteDataLayer {
    async fn events_for_date(&self, date: NaiveDate) -> Result<Vec<NewsEvent>, DataError> {
        self.events.events_for_date(date).map_err(to_data_error)
    }

    async fn recipients_with_notifications(
        &self,
    ) -> Result<Vec<RecipientPreference>, DataError> {
        self.recipients.with_notifications().map_err(to_data_error)
    }

    async fn recipients_with_digest(&self) -> Result<Vec<RecipientPreference>, DataError> {
        self.recipients.with_digest().map_err(to_data_error)
    }
}
