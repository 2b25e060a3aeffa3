//! Error types for the deployment agent

use dt_common::errors::CommonError;
use thiserror::Error;

/// Main error type for the deployment agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Task error: {0}")]
    TaskError(String),

    #[error("Execution error: {0}")]
    ExecError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}
