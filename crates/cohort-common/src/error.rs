//! Error types for Cohort.

use thiserror::Error;

/// Result type alias for Cohort operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Cohort.
#[derive(Error, Debug)]
pub enum Error {
    /// A member's user data blob could not be decoded
    #[error("Malformed user data: {0}")]
    MalformedUserData(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
