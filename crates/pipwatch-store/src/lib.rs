//! `pipwatch-store`: SQLite persistence for events, recipients and
//! dispatch outcomes.
//!
//! # Overview
//!
//! Three small services, each wrapping its own connection:
//! [`EventStore`] holds the calendar (a feed refresh replaces whole
//! days), [`RecipientStore`] holds per-recipient preferences, and
//! [`OutcomeLog`] is the append-only audit trail the gateway's writer
//! task feeds. [`SqliteDataLayer`] bundles the first two behind the
//! engine's data port.
//!
//! All schema lives in [`db::init_db`]; every service calls it on
//! construction, so opening order does not matter.

pub mod data_layer;
pub mod db;
pub mod error;
pub mod events;
pub mod outcomes;
pub mod recipients;

pub use data_layer::SqliteDataLayer;
pub use error::{Result, StoreError};
pub use events::EventStore;
pub use outcomes::OutcomeLog;
pub use recipients::RecipientStore;
