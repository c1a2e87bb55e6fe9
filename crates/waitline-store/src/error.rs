//! Error types for store operations.

use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in the fact store, dedup set, or entity index.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The embedded database failed.
    #[error("database error: {message}")]
    Database {
        /// Description of the database failure.
        message: String,
        /// The underlying rusqlite error.
        #[source]
        source: Option<rusqlite::Error>,
    },

    /// A CSV file could not be read or written.
    #[error("csv error: {message}")]
    Csv {
        /// Description of the CSV failure.
        message: String,
    },

    /// A filesystem operation failed.
    #[error(transparent)]
    Core(#[from] waitline_core::Error),
}

impl StoreError {
    /// Creates a database error wrapping a rusqlite failure.
    #[must_use]
    pub fn db(message: impl Into<String>, source: rusqlite::Error) -> Self {
        Self::Database {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Creates a database error from a message alone.
    #[must_use]
    pub fn db_msg(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a CSV error.
    #[must_use]
    pub fn csv(message: impl std::fmt::Display) -> Self {
        Self::Csv {
            message: message.to_string(),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::db("sqlite failure", e)
    }
}

impl From<csv::Error> for StoreError {
    fn from(e: csv::Error) -> Self {
        Self::csv(e)
    }
}
