use std::collections::BTreeSet;
use std::sync::Arc;

use nalgebra::DVector;
use tracing::debug;

use super::EliminationConfig;
use super::bayes_net::GaussianBayesNet;
use super::conditional::GaussianConditional;
use super::factor::LinearFactor;
use crate::core::{Dimensions, Errors, Symbol, VectorConfig};
use crate::error::{ApexError, ApexResult};
use crate::linalg::{LeastSquaresOperator, SparseMatrix, SparseTriplets, conversions};

/// Ordered collection of linear factors defining `½‖A x − b‖²`.
///
/// Every errors sequence the graph produces or consumes has one entry per
/// factor, in factor order; empty factors contribute a zero-length entry.
#[derive(Debug, Clone, Default)]
pub struct LinearFactorGraph {
    factors: Vec<Arc<LinearFactor>>,
}

impl LinearFactorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, factor: LinearFactor) {
        self.factors.push(Arc::new(factor));
    }

    pub fn push_shared(&mut self, factor: Arc<LinearFactor>) {
        self.factors.push(factor);
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    /// Factor at `index` in insertion order
    pub fn get(&self, index: usize) -> Option<&LinearFactor> {
        self.factors.get(index).map(|f| f.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &LinearFactor> {
        self.factors.iter().map(|f| f.as_ref())
    }

    /// All variables touched by some factor
    pub fn keys(&self) -> BTreeSet<Symbol> {
        self.iter().flat_map(|f| f.keys().cloned()).collect()
    }

    /// Dimension of every variable, checked for consistency across factors
    pub fn dimensions(&self) -> ApexResult<Dimensions> {
        let mut dims = Dimensions::new();
        for factor in self.iter() {
            for (key, a) in factor.blocks() {
                match dims.get(key) {
                    Some(&dim) if dim != a.ncols() => {
                        return Err(ApexError::dimension(
                            format!("dimension of {key}"),
                            dim,
                            a.ncols(),
                        ));
                    }
                    Some(_) => {}
                    None => {
                        dims.insert(key.clone(), a.ncols());
                    }
                }
            }
        }
        Ok(dims)
    }

    /// Total number of scalar rows
    pub fn rows(&self) -> usize {
        self.iter().map(LinearFactor::rows).sum()
    }

    /// Whitened residuals `diag(1/σ)(A x − b)`, one entry per factor
    pub fn errors(&self, x: &VectorConfig) -> ApexResult<Errors> {
        self.iter().map(|f| f.error_vector(x)).collect()
    }

    /// Whitened residuals with the opposite sign, `diag(1/σ)(b − A x)`
    pub fn negated_errors(&self, x: &VectorConfig) -> ApexResult<Errors> {
        self.iter().map(|f| f.negated_error_vector(x)).collect()
    }

    /// `½‖A x − b‖²` summed over factors
    pub fn error(&self, x: &VectorConfig) -> ApexResult<f64> {
        self.iter().map(|f| f.error(x)).sum()
    }

    /// Whitened `A x`, one entry per factor
    pub fn multiply(&self, x: &VectorConfig) -> ApexResult<Errors> {
        self.iter().map(|f| f.multiply(x)).collect()
    }

    /// Write each factor's product into the next slot drawn from `slots`.
    ///
    /// Slots must already have the factor's row count. Running out of slots
    /// is an [`ApexError::OrderMismatch`].
    pub fn multiply_into<'a, I>(&self, x: &VectorConfig, slots: &mut I) -> ApexResult<()>
    where
        I: Iterator<Item = &'a mut DVector<f64>>,
    {
        for (i, factor) in self.iter().enumerate() {
            let slot = slots.next().ok_or(ApexError::OrderMismatch {
                expected: self.len(),
                actual: i,
            })?;
            factor.multiply_into(x, slot)?;
        }
        Ok(())
    }

    /// `Aᵀ e`
    pub fn transpose_multiply(&self, e: &Errors) -> ApexResult<VectorConfig> {
        let mut x = VectorConfig::new();
        self.transpose_multiply_add(1.0, e, &mut x)?;
        Ok(x)
    }

    /// `x += alpha Aᵀ e`; keys missing from `x` are inserted
    pub fn transpose_multiply_add(
        &self,
        alpha: f64,
        e: &Errors,
        x: &mut VectorConfig,
    ) -> ApexResult<()> {
        self.transpose_multiply_add_entries(alpha, e.as_slice(), x)
    }

    /// Same as [`transpose_multiply_add`](Self::transpose_multiply_add) on a
    /// borrowed run of entries, e.g. the tail of a longer sequence.
    pub fn transpose_multiply_add_entries(
        &self,
        alpha: f64,
        entries: &[DVector<f64>],
        x: &mut VectorConfig,
    ) -> ApexResult<()> {
        if entries.len() != self.len() {
            return Err(ApexError::OrderMismatch {
                expected: self.len(),
                actual: entries.len(),
            });
        }
        for (factor, e) in self.iter().zip(entries) {
            factor.transpose_multiply_add(alpha, e, x)?;
        }
        Ok(())
    }

    /// `Aᵀ (A x − b)`
    pub fn gradient(&self, x: &VectorConfig) -> ApexResult<VectorConfig> {
        let e = self.errors(x)?;
        self.transpose_multiply(&e)
    }

    /// Remove every factor involving `key` and return them stacked into one.
    pub fn remove_and_combine(&mut self, key: impl AsRef<str>) -> ApexResult<LinearFactor> {
        let key = key.as_ref();
        let (involved, rest): (Vec<_>, Vec<_>) =
            self.factors.drain(..).partition(|f| f.involves(key));
        self.factors = rest;
        let refs: Vec<&LinearFactor> = involved.iter().map(|f| f.as_ref()).collect();
        LinearFactor::combine(&refs)
    }

    /// Eliminate one variable, leaving the remainder factor in the graph.
    ///
    /// A variable no factor touches comes out as the trivial empty conditional.
    pub fn eliminate_one(
        &mut self,
        key: impl AsRef<str>,
        config: &EliminationConfig,
    ) -> ApexResult<GaussianConditional> {
        let key = key.as_ref();
        let combined = self.remove_and_combine(key)?;
        let (conditional, remainder) = combined.eliminate_with_config(key, config)?;
        if !remainder.is_empty() {
            self.push(remainder);
        }
        Ok(conditional)
    }

    /// Eliminate the variables in `ordering` into a Bayes net.
    pub fn eliminate(&self, ordering: &[Symbol]) -> ApexResult<GaussianBayesNet> {
        self.eliminate_with_config(ordering, &EliminationConfig::default())
    }

    pub fn eliminate_with_config(
        &self,
        ordering: &[Symbol],
        config: &EliminationConfig,
    ) -> ApexResult<GaussianBayesNet> {
        let mut graph = self.clone();
        let mut net = GaussianBayesNet::new();
        for key in ordering {
            let conditional = graph.eliminate_one(key, config)?;
            net.push(conditional)?;
        }
        if !graph.is_empty() {
            debug!(
                "{} factors on keys outside the ordering left after elimination",
                graph.len()
            );
        }
        Ok(net)
    }

    /// Least-squares solution by elimination and back-substitution
    pub fn optimize(&self, ordering: &[Symbol]) -> ApexResult<VectorConfig> {
        self.eliminate(ordering)?.optimize()
    }

    /// Whitened non-zero entries of `A` as 1-based triplets.
    ///
    /// Factor rows are stacked in factor order; columns follow `order`.
    pub fn sparse(&self, order: &[Symbol]) -> ApexResult<SparseTriplets> {
        let dims = self.dimensions()?;
        let mut triplets = SparseTriplets::new();
        let mut row_offset = 0;
        for factor in self.iter() {
            triplets.append_shifted(&factor.sparse(order, &dims)?, row_offset);
            row_offset += factor.rows();
        }
        Ok(triplets)
    }

    /// Whitened Jacobian `A` as a faer sparse matrix with columns in `order`
    pub fn sparse_jacobian(&self, order: &[Symbol]) -> ApexResult<SparseMatrix> {
        let dims = self.dimensions()?;
        let cols = order
            .iter()
            .map(|key| {
                dims.get(key)
                    .copied()
                    .ok_or_else(|| ApexError::MissingKey(key.clone()))
            })
            .sum::<ApexResult<usize>>()?;
        let triplets = self.sparse(order)?;
        conversions::one_based_to_sparse(self.rows(), cols, &triplets)
    }
}

impl FromIterator<LinearFactor> for LinearFactorGraph {
    fn from_iter<I: IntoIterator<Item = LinearFactor>>(iter: I) -> Self {
        Self {
            factors: iter.into_iter().map(Arc::new).collect(),
        }
    }
}

impl LeastSquaresOperator for LinearFactorGraph {
    fn error(&self, v: &VectorConfig) -> ApexResult<f64> {
        LinearFactorGraph::error(self, v)
    }

    fn gradient(&self, v: &VectorConfig) -> ApexResult<VectorConfig> {
        LinearFactorGraph::gradient(self, v)
    }

    fn multiply(&self, v: &VectorConfig) -> ApexResult<Errors> {
        LinearFactorGraph::multiply(self, v)
    }

    fn multiply_in_place(&self, v: &VectorConfig, e: &mut Errors) -> ApexResult<()> {
        if e.len() != self.len() {
            return Err(ApexError::OrderMismatch {
                expected: self.len(),
                actual: e.len(),
            });
        }
        self.multiply_into(v, &mut e.iter_mut())
    }

    fn transpose_multiply(&self, e: &Errors) -> ApexResult<VectorConfig> {
        LinearFactorGraph::transpose_multiply(self, e)
    }

    fn transpose_multiply_add(
        &self,
        alpha: f64,
        e: &Errors,
        v: &mut VectorConfig,
    ) -> ApexResult<()> {
        LinearFactorGraph::transpose_multiply_add(self, alpha, e, v)
    }
}
