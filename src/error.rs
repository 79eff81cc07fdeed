use crate::types::Provider;
use std::time::Duration;
use thiserror::Error;

/// Failure talking to a provider's billing API.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("fetch task aborted: {0}")]
    Task(String),
}

impl ProviderError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(e) => e.is_timeout() || e.is_connect(),
            ProviderError::Status { status, body } => {
                *status == 429
                    || (500..=599).contains(status)
                    || body.contains("ThrottlingException")
                    || body.contains("LimitExceededException")
            }
            ProviderError::Auth(_)
            | ProviderError::Decode(_)
            | ProviderError::Timeout(_)
            | ProviderError::Task(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum CostError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{provider} ingestion failed: {source}")]
    Ingestion {
        provider: Provider,
        #[source]
        source: ProviderError,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("store '{store}' is corrupt: {detail}")]
    DataIntegrity { store: String, detail: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("blocking store task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

impl CostError {
    pub fn ingestion(provider: Provider, source: ProviderError) -> Self {
        CostError::Ingestion { provider, source }
    }

    pub fn integrity(store: impl Into<String>, detail: impl Into<String>) -> Self {
        CostError::DataIntegrity {
            store: store.into(),
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CostError>;
