use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcessingError>;

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed reading payload '{payload}': {reason}")]
    Decode { payload: String, reason: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Transport error on topic {topic}: {message}")]
    Transport { topic: String, message: String },

    #[error("Station {station_id} not found")]
    StationNotFound { station_id: u32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Async task error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl ProcessingError {
    pub fn decode(payload: &str, reason: impl Into<String>) -> Self {
        ProcessingError::Decode {
            payload: payload.to_string(),
            reason: reason.into(),
        }
    }

    pub fn transport(topic: &str, message: impl Into<String>) -> Self {
        ProcessingError::Transport {
            topic: topic.to_string(),
            message: message.into(),
        }
    }

    /// Store and transport failures are transient and worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProcessingError::StoreUnavailable(_) | ProcessingError::Transport { .. }
        )
    }
}

impl From<::config::ConfigError> for ProcessingError {
    fn from(err: ::config::ConfigError) -> Self {
        ProcessingError::Config(err.to_string())
    }
}
