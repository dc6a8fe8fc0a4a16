//! Errors raised by session stores.

use thiserror::Error;

/// Result type alias using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Failures of a session store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backing store could not be reached or failed the operation.
    #[error("session store unavailable: {0}")]
    Unavailable(String),

    /// A value could not be encoded or decoded.
    #[error("session value could not be serialized: {0}")]
    Serialization(String),

    /// The key is empty or too long.
    #[error("invalid session key: {0}")]
    InvalidKey(String),
}

impl StoreError {
    /// Creates an unavailability error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Whether the failure is the store's rather than the caller's. Only these
    /// trigger failover.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Decode(source) | sqlx::Error::ColumnDecode { source, .. } => {
                Self::Serialization(source.to_string())
            },
            other => Self::Unavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
