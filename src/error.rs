use thiserror::Error;

/// Main error type for socialgraph
#[derive(Error, Debug)]
pub enum SocialGraphError {
    /// Checkpoint database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors, raised before any network call
    #[error("Configuration error: {0}")]
    Config(String),

    /// A fetch that must not be retried (auth failure, unknown account, bad response)
    #[error("Non-retryable fetch error: {0}")]
    NonRetryable(String),

    /// Every retry attempt was used up
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Convenient Result type using SocialGraphError
pub type Result<T> = std::result::Result<T, SocialGraphError>;
