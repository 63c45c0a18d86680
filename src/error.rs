//! Error types for the apex-subgraph library
//!
//! This module provides the main error and result types used throughout the library.
//! All errors use the `thiserror` crate for automatic trait implementations.

use crate::core::Symbol;
use thiserror::Error;

/// Main result type used throughout the apex-subgraph library
pub type ApexResult<T> = Result<T, ApexError>;

/// Main error type for the apex-subgraph library
///
/// None of these are recoverable locally: every operation either succeeds or
/// reports the precondition its input violated.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApexError {
    /// A block, vector or config operand has the wrong size for the operation
    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// A symbol referenced by one operand is absent from another
    #[error("Missing key: {0}")]
    MissingKey(Symbol),

    /// A symbol was inserted twice
    #[error("Duplicate key: {0}")]
    DuplicateKey(Symbol),

    /// Elimination hit a (near) zero pivot on a frontal column
    #[error("Singular pivot while eliminating {key}: weighted column norm {pivot:e}")]
    SingularPivot { key: Symbol, pivot: f64 },

    /// An errors sequence does not line up with the Bayes net / factor graph it is paired with
    #[error("Order mismatch: expected {expected} entries, got {actual}")]
    OrderMismatch { expected: usize, actual: usize },

    /// Invalid constructor arguments
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Sparse backend failures
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(String),
}

impl ApexError {
    pub(crate) fn dimension(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        ApexError::DimensionMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }
}

/// Convenience macro for creating invalid input errors
#[macro_export]
macro_rules! invalid_input {
    ($msg:expr) => {
        $crate::error::ApexError::InvalidInput($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ApexError::InvalidInput(format!($fmt, $($arg)*))
    };
}
