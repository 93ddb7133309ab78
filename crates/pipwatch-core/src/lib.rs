//! Shared foundation for the Pipwatch workspace: configuration, error
//! types, the domain model (news events, recipient preferences), timezone
//! helpers, and the trait seams to the external collaborators (data layer,
//! chart service, message transport).

pub mod config;
pub mod error;
pub mod ports;
pub mod timeutil;
pub mod types;

pub use config::PipwatchConfig;
pub use error::{CoreError, Result};
pub use ports::{ChartError, ChartRenderer, DataError, DataLayer, Transport, TransportError};
pub use types::{ChartStyle, ImpactLevel, NewsEvent, RecipientPreference};
