use skywatch_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("config error: {0}")]
    Config(#[from] skywatch_config::ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("verification task failed: {0}")]
    Verification(String),
    #[error("{0}")]
    Message(String),
}

/// Why a single oracle lookup could not answer.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
    #[error("oracle returned an invalid response: {0}")]
    InvalidResponse(String),
}
