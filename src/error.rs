use thiserror::Error;

/// Pipeline error types
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("Session already running")]
    AlreadyRunning,

    #[error("Session not running")]
    NotRunning,

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Sensor feed failed: {0}")]
    FeedFailed(String),

    #[error("Clock synchronization failed: {0}")]
    SyncFailed(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Invalid calibration: {0}")]
    InvalidCalibration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
