// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for classifier operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for classifier operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors that can occur while building, running or persisting a classifier
#[derive(Debug, Error)]
pub enum ModelError {
    /// A tensor did not have the dimensions the classifier expects
    #[error("Dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        /// What was being checked
        context: String,
        /// Expected dimensions
        expected: String,
        /// Dimensions actually supplied
        got: String,
    },

    /// Weight matrices are inconsistent with each other or the declared geometry
    #[error("Invalid weights: {reason}")]
    InvalidWeights {
        /// Reason for failure
        reason: String,
    },

    /// Weight file not found
    #[error("Weight file not found: {path}")]
    FileNotFound {
        /// Path that was attempted
        path: PathBuf,
    },

    /// Weight blob could not be decoded
    #[error("Failed to parse weight blob: {reason}")]
    ParseError {
        /// Reason for failure
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl ModelError {
    /// Create a dimension mismatch error
    pub fn dimension_mismatch(
        context: impl Into<String>,
        expected: impl std::fmt::Display,
        got: impl std::fmt::Display,
    ) -> Self {
        Self::DimensionMismatch {
            context: context.into(),
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    /// Create an invalid weights error
    pub fn invalid_weights(reason: impl Into<String>) -> Self {
        Self::InvalidWeights {
            reason: reason.into(),
        }
    }

    /// Create a parse error
    pub fn parse_error(reason: impl Into<String>) -> Self {
        Self::ParseError {
            reason: reason.into(),
        }
    }
}
