use std::io;

/// Error taxonomy of the observation layer.
///
/// Every variant maps to a stable snake_case code via [`ObserverError::code`];
/// HTTP and CLI boundaries key their status mapping off the code, never off
/// the message text.
#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("canonicalization error: {0}")]
    Canonicalization(String),
    #[error("non-monotonic ingest: event_id {got} is not above last stored event_id {last}")]
    NonMonotonicIngest { last: u64, got: u64 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ObserverError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Canonicalization(_) => "canonicalization_error",
            Self::NonMonotonicIngest { .. } => "non_monotonic_ingest",
            Self::NotFound(_) => "not_found",
            Self::Io(_) => "io_error",
        }
    }
}
