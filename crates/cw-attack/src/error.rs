// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for attack operations
//!
//! An example the search never fools is not an error: it keeps the
//! `1e10` distance sentinel in the outcome. Errors here are malformed input,
//! bad configuration and numerical breakdown.

use cw_models::ModelError;
use thiserror::Error;

/// Result type alias for attack operations
pub type Result<T> = std::result::Result<T, AttackError>;

/// Errors that can occur while configuring or running the attack
#[derive(Debug, Error)]
pub enum AttackError {
    /// Images or labels do not match the configured geometry
    #[error("Dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        /// What was being checked
        context: String,
        /// Expected dimensions
        expected: String,
        /// Dimensions actually supplied
        got: String,
    },

    /// A label row is not one-hot
    #[error("Invalid label row {row}: {reason}")]
    InvalidLabels {
        /// Example index
        row: usize,
        /// Reason for failure
        reason: String,
    },

    /// Configuration rejected at construction
    #[error("Invalid attack configuration: {reason}")]
    InvalidConfig {
        /// Reason for failure
        reason: String,
    },

    /// Aggregate loss became NaN or infinite
    #[error(
        "Non-finite loss {loss} in batch {batch}, outer step {outer_step}, iteration {iteration}"
    )]
    NonFinite {
        /// Batch index
        batch: usize,
        /// Binary-search step
        outer_step: usize,
        /// Inner iteration
        iteration: usize,
        /// Offending loss value
        loss: f32,
    },

    /// Classifier failure
    #[error("Classifier error: {source}")]
    Model {
        /// Underlying classifier error
        #[from]
        source: ModelError,
    },
}

impl AttackError {
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

    /// Create an invalid label error
    pub fn invalid_labels(row: usize, reason: impl Into<String>) -> Self {
        Self::InvalidLabels {
            row,
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_context() {
        let err = AttackError::dimension_mismatch("labels", "[4, 10]", "[4, 9]");
        assert_eq!(
            err.to_string(),
            "Dimension mismatch in labels: expected [4, 10], got [4, 9]"
        );
        let err = AttackError::NonFinite {
            batch: 1,
            outer_step: 2,
            iteration: 3,
            loss: f32::NAN,
        };
        assert!(err.to_string().contains("outer step 2"));
    }

    #[test]
    fn test_model_error_converts() {
        let err: AttackError = ModelError::parse_error("bad").into();
        assert!(matches!(err, AttackError::Model { .. }));
    }
}
