use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Workflow fetch failed: {0}")]
    WorkflowFetchFailed(String),

    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Geolocation lookup failed: {0}")]
    GeolocationFailed(String),

    #[error("Execution report failed: {0}")]
    ReportFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Engine shut down")]
    ShutDown,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("URL error: {0}")]
    UrlError(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Transient failures are worth another attempt; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::TimeoutError(_)
                | EngineError::HttpError(_)
                | EngineError::GeolocationFailed(_)
        )
    }
}
