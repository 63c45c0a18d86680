//! Linear algebra kernels and the preconditioned operator.
//!
//! - Weighted elimination of stacked factor rows ([`qr`])
//! - Sparse export of factor graphs using faer
//! - The [`LeastSquaresOperator`] interface consumed by iterative solvers
//! - The [`SubgraphPreconditioner`] built on a spanning-subgraph Bayes net

use crate::core::{Errors, VectorConfig};
use crate::error::ApexResult;

pub mod qr;
pub mod subgraph;

pub use qr::{WeightedElimination, WeightedRow, weighted_eliminate};
pub use subgraph::SubgraphPreconditioner;

/// Type alias for sparse matrices using faer
pub type SparseMatrix = faer::sparse::SparseColMat<usize, f64>;

/// Linear least-squares system `½‖A v − b‖²` seen through operator applications only.
///
/// This is the whole surface an iterative solver (e.g. conjugate gradients)
/// needs. `multiply` and `transpose_multiply` must walk the errors sequence in
/// the same order.
pub trait LeastSquaresOperator {
    /// `½‖A v − b‖²`
    fn error(&self, v: &VectorConfig) -> ApexResult<f64>;

    /// `Aᵀ (A v − b)`
    fn gradient(&self, v: &VectorConfig) -> ApexResult<VectorConfig>;

    /// `A v`
    fn multiply(&self, v: &VectorConfig) -> ApexResult<Errors>;

    /// `A v` written into a pre-sized buffer
    fn multiply_in_place(&self, v: &VectorConfig, e: &mut Errors) -> ApexResult<()>;

    /// `Aᵀ e`
    fn transpose_multiply(&self, e: &Errors) -> ApexResult<VectorConfig>;

    /// `v += alpha Aᵀ e`
    fn transpose_multiply_add(
        &self,
        alpha: f64,
        e: &Errors,
        v: &mut VectorConfig,
    ) -> ApexResult<()>;
}

/// Sparse entries `(i, j, s)` with 1-based row and column indices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseTriplets {
    pub rows: Vec<usize>,
    pub cols: Vec<usize>,
    pub values: Vec<f64>,
}

impl SparseTriplets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: usize, col: usize, value: f64) {
        self.rows.push(row);
        self.cols.push(col);
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Append `other` with its rows shifted down by `row_offset`
    pub fn append_shifted(&mut self, other: &SparseTriplets, row_offset: usize) {
        self.rows.extend(other.rows.iter().map(|r| r + row_offset));
        self.cols.extend_from_slice(&other.cols);
        self.values.extend_from_slice(&other.values);
    }
}

/// Utility functions for sparse matrix operations
pub mod conversions {
    use super::*;
    use crate::error::ApexError;

    /// Create sparse matrix from 0-based triplets using faer
    pub fn triplets_to_sparse(
        rows: usize,
        cols: usize,
        row_indices: &[usize],
        col_indices: &[usize],
        values: &[f64],
    ) -> ApexResult<SparseMatrix> {
        let triplets: Vec<_> = row_indices
            .iter()
            .zip(col_indices.iter())
            .zip(values.iter())
            .map(|((&row, &col), &val)| faer::sparse::Triplet::new(row, col, val))
            .collect();

        faer::sparse::SparseColMat::try_new_from_triplets(rows, cols, &triplets).map_err(|e| {
            ApexError::LinearAlgebra(format!("Failed to create sparse matrix: {:?}", e))
        })
    }

    /// Create a sparse matrix from 1-based [`SparseTriplets`]
    pub fn one_based_to_sparse(
        rows: usize,
        cols: usize,
        triplets: &SparseTriplets,
    ) -> ApexResult<SparseMatrix> {
        if triplets.rows.contains(&0) || triplets.cols.contains(&0) {
            return Err(ApexError::LinearAlgebra(
                "1-based triplets contain a zero index".into(),
            ));
        }
        let row_indices: Vec<usize> = triplets.rows.iter().map(|r| r - 1).collect();
        let col_indices: Vec<usize> = triplets.cols.iter().map(|c| c - 1).collect();
        triplets_to_sparse(rows, cols, &row_indices, &col_indices, &triplets.values)
    }
}
