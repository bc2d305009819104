use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] ward_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("No request body provided; pass --body, --file or pipe JSON on stdin")]
    EmptyBody,
    #[error("Invalid header {0:?}; expected NAME:VALUE")]
    InvalidHeader(String),
    #[error("Invalid mutation ID: {0}")]
    InvalidMutationId(String),
    #[error("No write endpoint configured. Pass --endpoint, set WARD_API_URL, or use --local.")]
    EndpointNotConfigured,
    #[error("Refusing to clear the queue without --yes")]
    ClearNotConfirmed,
}

impl From<ward_core::config::ConfigError> for CliError {
    fn from(error: ward_core::config::ConfigError) -> Self {
        Self::Config(error.to_string())
    }
}
