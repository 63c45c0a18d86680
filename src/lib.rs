//! # Apex Subgraph
//!
//! Subgraph preconditioning for large sparse least-squares problems built from Gaussian
//! factor graphs (pose graphs, SLAM, bundle adjustment after linearization).
//!
//! The linear system `A x ≈ b` is split into a spanning subgraph `A1 x = b1`, already
//! eliminated into an upper-triangular Gaussian Bayes net `R1`, and the remaining
//! constraints `A2 x ≈ b2`. [`SubgraphPreconditioner`] exposes the transformed system
//! `[I; A2 R1⁻¹] y ≈ [0; b2 - A2 x̄]` through the handful of operator methods a
//! conjugate-gradient loop needs.
//!
//! ## Layout
//!
//! - [`core`]: symbols, named vector configs and ordered error sequences
//! - [`linear`]: linear factors, factor graphs, Gaussian conditionals and Bayes nets
//! - [`linalg`]: the weighted elimination kernel, sparse export and the preconditioner

pub mod core;
pub mod error;
pub mod linalg;
pub mod linear;
pub mod logger;

pub use core::{Dimensions, Errors, Symbol, VectorConfig};
pub use error::{ApexError, ApexResult};
pub use linalg::{LeastSquaresOperator, SubgraphPreconditioner};
pub use linear::{
    EliminationConfig, GaussianBayesNet, GaussianConditional, LinearFactor, LinearFactorGraph,
};
pub use logger::{init_logger, init_logger_with_level, init_test_logger};
