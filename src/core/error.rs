use thiserror::Error;

/// Centralized error types for the application
///
/// Pipeline workers convert every one of these into a `failed` Download record;
/// admission denials are not errors and never appear here.
#[derive(Error, Debug)]
pub enum AppError {
    /// Extraction engine failures (maps to a `failed` download)
    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    /// Messaging transport failures (maps to a `failed` upload)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Credit ledger failures
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Work queue failures
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Collaborator unreachable or settings invalid (fatal at startup)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Persistence collaborator errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Cache collaborator errors
    #[error("Cache error: {0}")]
    Cache(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The download was cancelled while a worker held it
    #[error("Download {0} was cancelled")]
    Cancelled(i64),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Type alias for Result with AppError
pub type AppResult<T> = Result<T, AppError>;

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Storage(err.to_string())
    }
}

impl From<r2d2::Error> for AppError {
    fn from(err: r2d2::Error) -> Self {
        AppError::Storage(format!("pool: {}", err))
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::Cache(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation(format!("json: {}", err))
    }
}

impl From<figment::Error> for AppError {
    fn from(err: figment::Error) -> Self {
        AppError::Configuration(err.to_string())
    }
}

/// Failures reported by the media extraction engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("live streams cannot be downloaded")]
    LiveStream,

    #[error("your plan does not support playlist downloads")]
    PlaylistNotAllowed,

    #[error("no file was produced")]
    NoOutput,

    #[error("file size ({size_mb:.1} MB) exceeds the allowed limit ({max_mb} MB)")]
    FileTooLarge { size_mb: f64, max_mb: u32 },

    #[error("extraction timed out")]
    Timeout,

    #[error("extractor process failed: {0}")]
    Process(String),

    #[error("{0}")]
    Engine(String),
}

/// Failures reported by the messaging transport.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The transport lost part of the file; the upload is retried once via the chunked path
    #[error("file part missing: {0}")]
    FilePartMissing(String),

    #[error("{0}")]
    Transport(String),
}

impl TransportError {
    pub fn is_file_part_missing(&self) -> bool {
        matches!(self, TransportError::FilePartMissing(_))
    }
}

/// Ledger failures. Insufficient balance is an expected outcome, never a partial debit.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("insufficient credits: balance {balance}, requested {requested}")]
    InsufficientCredits { balance: i64, requested: i64 },

    #[error("user {0} not found")]
    UserNotFound(i64),

    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("ledger storage failure: {0}")]
    Storage(String),
}

/// Work queue failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("{pipeline} queue is full ({capacity} tasks)")]
    Full { pipeline: &'static str, capacity: usize },

    #[error("{0} queue is closed")]
    Closed(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_part_missing_detection() {
        assert!(TransportError::FilePartMissing("part 3".into()).is_file_part_missing());
        assert!(!TransportError::Transport("timeout".into()).is_file_part_missing());
    }

    #[test]
    fn test_error_messages_are_human_readable() {
        let err = AppError::from(ExtractionError::FileTooLarge {
            size_mb: 150.0,
            max_mb: 100,
        });
        assert_eq!(
            err.to_string(),
            "Extraction error: file size (150.0 MB) exceeds the allowed limit (100 MB)"
        );

        let err = AppError::from(LedgerError::InsufficientCredits {
            balance: 2,
            requested: 5,
        });
        assert!(err.to_string().contains("balance 2, requested 5"));
    }
}
