use thiserror::Error;

pub type AttributionResult<T> = Result<T, AttributionError>;

#[derive(Error, Debug)]
pub enum AttributionError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown attribution model: {0}")]
    UnknownModel(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AttributionError {
    /// Whether the error was caused by caller input rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::UnknownModel(_))
    }
}
