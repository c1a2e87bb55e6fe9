//! Error types for ingest operations.

use thiserror::Error;

/// Result type alias for ingest operations.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Errors that can occur during source ingest or live staging.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A source read failed in a way worth retrying.
    #[error("transient source error: {message}")]
    Transient {
        /// Description of the transient failure.
        message: String,
    },

    /// A source object could not be parsed at all.
    #[error("unparseable source: {message}")]
    Unparseable {
        /// Description of the parse failure.
        message: String,
    },

    /// The live feed returned an unusable response.
    #[error("live feed error: {message}")]
    LiveFeed {
        /// Description of the feed failure.
        message: String,
    },

    /// A store-side failure aborted the current batch.
    #[error(transparent)]
    Store(#[from] waitline_store::StoreError),

    /// A core-level failure.
    #[error(transparent)]
    Core(#[from] waitline_core::Error),
}

impl IngestError {
    /// Creates a transient error (eligible for retry).
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates an unparseable-source error (not retried).
    #[must_use]
    pub fn unparseable(message: impl std::fmt::Display) -> Self {
        Self::Unparseable {
            message: message.to_string(),
        }
    }

    /// Whether this error should be retried with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            Self::transient(e.to_string())
        } else {
            Self::LiveFeed {
                message: e.to_string(),
            }
        }
    }
}
