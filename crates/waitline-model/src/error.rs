//! Error types for modeling operations.

use thiserror::Error;

/// Result type alias for modeling operations.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors that can occur in the modeling engine.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A dimension table is missing or malformed.
    #[error("dimension error: {message}")]
    Dimension {
        /// Description of the dimension problem.
        message: String,
    },

    /// Not enough data to proceed.
    #[error("insufficient data: {message}")]
    InsufficientData {
        /// What was missing.
        message: String,
    },

    /// A model artifact failed to persist or load.
    #[error("artifact error: {message}")]
    Artifact {
        /// Description of the artifact failure.
        message: String,
    },

    /// A columnar (parquet/arrow) operation failed.
    #[error("columnar error: {message}")]
    Columnar {
        /// Description of the failure.
        message: String,
    },

    /// A store-side failure.
    #[error(transparent)]
    Store(#[from] waitline_store::StoreError),

    /// A core-level failure.
    #[error(transparent)]
    Core(#[from] waitline_core::Error),
}

impl ModelError {
    /// Creates a dimension error.
    #[must_use]
    pub fn dimension(message: impl Into<String>) -> Self {
        Self::Dimension {
            message: message.into(),
        }
    }

    /// Creates an insufficient-data error.
    #[must_use]
    pub fn insufficient(message: impl Into<String>) -> Self {
        Self::InsufficientData {
            message: message.into(),
        }
    }

    /// Creates an artifact error.
    #[must_use]
    pub fn artifact(message: impl std::fmt::Display) -> Self {
        Self::Artifact {
            message: message.to_string(),
        }
    }

    /// Creates a columnar error.
    #[must_use]
    pub fn columnar(message: impl std::fmt::Display) -> Self {
        Self::Columnar {
            message: message.to_string(),
        }
    }
}

impl From<arrow::error::ArrowError> for ModelError {
    fn from(e: arrow::error::ArrowError) -> Self {
        Self::columnar(e)
    }
}

impl From<parquet::errors::ParquetError> for ModelError {
    fn from(e: parquet::errors::ParquetError) -> Self {
        Self::columnar(e)
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(e: serde_json::Error) -> Self {
        Self::artifact(e)
    }
}
