//! Error types shared by the agent and the manager

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Frame error: {0}")]
    FrameError(String),

    #[error("Topic error: {0}")]
    TopicError(String),

    #[error("Archive error: {0}")]
    ArchiveError(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
