//! Core value types for the apex-subgraph library
//!
//! - [`Symbol`]: variable names
//! - [`VectorConfig`]: symbol-keyed collections of dense vectors
//! - [`Errors`]: ordered, unlabelled sequences of residual vectors

use std::collections::BTreeMap;

pub mod errors;
pub mod symbol;
pub mod vector_config;

pub use errors::Errors;
pub use symbol::Symbol;
pub use vector_config::VectorConfig;

/// Dimension of each variable, keyed by symbol
pub type Dimensions = BTreeMap<Symbol, usize>;
