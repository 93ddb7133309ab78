use thiserror::Error;

/// Storage-layer errors. Kept separate from the engine's errors so the
/// gateway can decide per call whether an outage skips a tick or aborts
/// startup.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("stored value could not be decoded: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl StoreError {
    /// Stable machine-readable code for structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::Corrupt(_) => "CORRUPT_VALUE",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
