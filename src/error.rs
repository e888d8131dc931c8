use thiserror::Error;

/// Errors that can occur while relaying a session
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("No streams available.")]
    NoSourcesFound,

    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Metadata unavailable: {0}")]
    MetadataUnavailable(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Transport error: {0}")]
    Transport(String),
}

impl RelayError {
    /// Transient failures are retried on the identifier-based open path.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::SourceNotFound(_) | RelayError::ConnectionFailed(_) | RelayError::Transport(_)
        )
    }
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
