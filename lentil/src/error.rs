//! Error taxonomy of the factorization engine.

use crate::entity::Role;
use thiserror::Error;

/// Result type alias for the factorization engine.
pub type Result<T> = std::result::Result<T, HpfError>;

/// Errors raised while ingesting data, configuring or running inference.
#[derive(Debug, Error)]
pub enum HpfError {
    /// A negative, non-finite, misplaced or duplicated input triple.
    #[error("invalid observation at ({row}, {column}): {reason}")]
    InvalidObservation {
        /// Row index of the offending triple
        row: usize,
        /// Column index of the offending triple
        column: usize,
        /// What is wrong with it
        reason: String,
    },

    /// NaN/Inf or a non-positive value appeared in a shape or rate parameter.
    #[error("numerical divergence in {role} {index} at iteration {iteration}")]
    NumericalDivergence {
        /// Side of the factorization
        role: Role,
        /// Row or column index
        index: usize,
        /// Number of completed iterations when it happened
        iteration: usize,
    },

    /// Invalid options or unusable input, detected before any iteration.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// Query for a row or column that the fitted model does not have.
    #[error("{role} index {index} is out of range (size {bound})")]
    IndexOutOfRange {
        /// Side of the factorization
        role: Role,
        /// Requested index
        index: usize,
        /// Number of rows or columns
        bound: usize,
    },

    /// The worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl HpfError {
    pub(crate) fn config<S: Into<String>>(msg: S) -> Self {
        HpfError::ConfigurationError(msg.into())
    }
}
