//! Error type shared by the persistence layers.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by repositories and model conversions.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// The backing database rejected or failed an operation.
    #[error("database error: {0}")]
    Database(String),

    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness or referential constraint was violated.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Caller supplied a value the model cannot represent.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A stored value could not be decoded into a model.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl CoreError {
    /// Returns true when the failure came from the storage backend itself
    /// rather than from the data.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            sqlx::Error::Database(db_err)
                if db_err.is_unique_violation() || db_err.is_foreign_key_violation() =>
            {
                Self::ConstraintViolation(db_err.to_string())
            },
            sqlx::Error::ColumnDecode { index, source } => {
                Self::Corrupt(format!("column {index}: {source}"))
            },
            sqlx::Error::Decode(source) => Self::Corrupt(source.to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}
