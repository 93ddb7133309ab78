use pipwatch_core::error::CoreError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A digest preference that cannot be turned into a schedule key
    /// (unknown timezone or unparsable time-of-day).
    #[error("unschedulable preference: {0}")]
    Unschedulable(#[from] CoreError),
}

impl EngineError {
    /// Stable machine-readable code for logs and API payloads.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Unschedulable(_) => "UNSCHEDULABLE",
        }
    }
}
