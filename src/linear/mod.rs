//! Linear Gaussian factor graph components
//!
//! - [`LinearFactor`]: one whitened block row `diag(1/σ)(Σ Aₖ xₖ − b)`
//! - [`LinearFactorGraph`]: ordered collection of linear factors
//! - [`GaussianConditional`]: one block row of an upper-triangular Bayes net
//! - [`GaussianBayesNet`]: conditionals in elimination order, with back-substitution
//!
//! Conventions: elimination produces unit-pivot rows and keeps the scale in
//! `sigmas`. Operator algebra works on the whitened triangle
//! `R̃ = diag(1/σ) R`, so `back_substitute(y)` solves `R̃ x = y`.

pub mod bayes_net;
pub mod conditional;
pub mod factor;
pub mod factor_graph;
pub mod small_example;

pub use bayes_net::GaussianBayesNet;
pub use conditional::GaussianConditional;
pub use factor::LinearFactor;
pub use factor_graph::LinearFactorGraph;

/// Configuration for eliminating linear factors
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EliminationConfig {
    /// Frontal columns whose weighted norm `sqrt(Σ wᵢ aᵢ²)` falls below this
    /// are singular; other columns below it are treated as rank deficient and skipped.
    pub pivot_tolerance: f64,
}

impl Default for EliminationConfig {
    fn default() -> Self {
        Self {
            pivot_tolerance: 1e-9,
        }
    }
}

impl EliminationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pivot_tolerance(mut self, pivot_tolerance: f64) -> Self {
        self.pivot_tolerance = pivot_tolerance;
        self
    }
}
