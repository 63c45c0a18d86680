//! Subgraph preconditioning of a linear least-squares problem
//!
//! The factor graph is split into a spanning subgraph `Ab1` that is cheap to
//! eliminate and a constraint graph `Ab2` holding the remaining factors.
//! Eliminating `Ab1` gives the whitened triangle `R1` and the baseline
//! `x̄ = R1⁻¹ d1`. In the change of variables `y = R1 (x − x̄)` the problem
//! becomes
//!
//! ```text
//! ½ ‖A y − b̄‖²,   A = [ I ; A2 R1⁻¹ ],   b̄ = [ 0 ; b2 − A2 x̄ ]
//! ```
//!
//! which is much better conditioned when `Ab1` carries most of the
//! information, so conjugate gradients converge in far fewer iterations.
//!
//! Errors sequences for this system start with one entry per conditional of
//! `R1`, in [`GaussianBayesNet::ordering`] order, followed by one entry per
//! factor of `Ab2`. Both `multiply` and `transpose_multiply` walk `R1` through
//! the same iterator, so the two always agree on that layout.

use std::sync::Arc;

use tracing::debug;

use super::LeastSquaresOperator;
use crate::core::{Errors, Symbol, VectorConfig};
use crate::error::{ApexError, ApexResult};
use crate::invalid_input;
use crate::linear::{EliminationConfig, GaussianBayesNet, LinearFactorGraph};

/// Preconditioned operator `A = [ I ; A2 R1⁻¹ ]` with right-hand side
/// `b̄ = [ 0 ; b2 − A2 x̄ ]`.
///
/// All inputs are shared and immutable; `b2bar` is computed once at
/// construction.
#[derive(Debug, Clone)]
pub struct SubgraphPreconditioner {
    ab1: Arc<LinearFactorGraph>,
    ab2: Arc<LinearFactorGraph>,
    rc1: Arc<GaussianBayesNet>,
    xbar: Arc<VectorConfig>,
    b2bar: Errors,
}

impl SubgraphPreconditioner {
    /// Create a preconditioner from an already eliminated spanning subgraph.
    ///
    /// # Errors
    /// * [`ApexError::MissingKey`] if a variable of `ab2`, a parent in `rc1`
    ///   or a frontal missing from `xbar` is not covered
    /// * [`ApexError::DimensionMismatch`] if dimensions disagree between
    ///   `ab2`, `rc1` and `xbar`
    /// * [`ApexError::InvalidInput`] if `xbar` has keys that are not frontals
    pub fn new(
        ab1: Arc<LinearFactorGraph>,
        ab2: Arc<LinearFactorGraph>,
        rc1: Arc<GaussianBayesNet>,
        xbar: Arc<VectorConfig>,
    ) -> ApexResult<Self> {
        let frontal_dims = rc1.dimensions();

        for (key, dim) in ab2.dimensions()? {
            match frontal_dims.get(&key) {
                None => return Err(ApexError::MissingKey(key)),
                Some(&frontal) if frontal != dim => {
                    return Err(ApexError::dimension(
                        format!("constraint variable {key}"),
                        frontal,
                        dim,
                    ));
                }
                Some(_) => {}
            }
        }

        for conditional in rc1.iter() {
            if let Some(parent) = conditional.parent_keys().find(|p| !rc1.contains(*p)) {
                return Err(ApexError::MissingKey(parent.clone()));
            }
        }

        for (key, dim) in &frontal_dims {
            let value = xbar.get(key)?;
            if value.len() != *dim {
                return Err(ApexError::dimension(
                    format!("baseline of {key}"),
                    *dim,
                    value.len(),
                ));
            }
        }
        if let Some(extra) = xbar.keys().find(|key| !rc1.contains(*key)) {
            return Err(invalid_input!("baseline key {} is not eliminated", extra));
        }

        let b2bar = ab2.negated_errors(&xbar)?;
        debug!(
            "subgraph preconditioner: {} conditionals (dim {}), {} constraint factors ({} rows)",
            rc1.len(),
            rc1.dim(),
            ab2.len(),
            ab2.rows()
        );

        Ok(Self {
            ab1,
            ab2,
            rc1,
            xbar,
            b2bar,
        })
    }

    /// Eliminate `ab1` in `ordering` and precondition `ab2` with the result.
    ///
    /// The baseline is the spanning subgraph's own solution.
    pub fn from_subgraph(
        ab1: LinearFactorGraph,
        ab2: LinearFactorGraph,
        ordering: &[Symbol],
        config: &EliminationConfig,
    ) -> ApexResult<Self> {
        let rc1 = ab1.eliminate_with_config(ordering, config)?;
        let xbar = rc1.optimize()?;
        Self::new(Arc::new(ab1), Arc::new(ab2), Arc::new(rc1), Arc::new(xbar))
    }

    /// Spanning subgraph the Bayes net was eliminated from
    pub fn ab1(&self) -> &LinearFactorGraph {
        &self.ab1
    }

    /// Constraints left outside the spanning subgraph
    pub fn ab2(&self) -> &LinearFactorGraph {
        &self.ab2
    }

    /// Bayes net `R1` of the spanning subgraph; its frontals are the variables of `y`
    pub fn rc1(&self) -> &GaussianBayesNet {
        &self.rc1
    }

    /// Baseline `x̄` that `y = 0` maps to
    pub fn xbar(&self) -> &VectorConfig {
        &self.xbar
    }

    /// Whitened `b2 − A2 x̄`
    pub fn b2bar(&self) -> &Errors {
        &self.b2bar
    }

    /// Dimension of the preconditioned space
    pub fn dim(&self) -> usize {
        self.rc1.dim()
    }

    /// Origin of the preconditioned space, i.e. `x = x̄`
    pub fn zero_y(&self) -> VectorConfig {
        VectorConfig::zero(&self.rc1.dimensions())
    }

    /// Zero errors sequence laid out like the result of `multiply`
    pub fn zero_errors(&self) -> Errors {
        Errors::zeros(
            self.rc1
                .iter()
                .map(|c| c.dim())
                .chain(self.ab2.iter().map(|f| f.rows())),
        )
    }

    /// `x = x̄ + R1⁻¹ y`
    pub fn x(&self, y: &VectorConfig) -> ApexResult<VectorConfig> {
        self.check_y(y)?;
        self.xbar.add(&self.rc1.back_substitute(y)?)
    }

    /// `½‖A y − b̄‖² = ½‖y‖² + ½‖A2 x(y) − b2‖²`
    pub fn error(&self, y: &VectorConfig) -> ApexResult<f64> {
        let mut e = self.prefix(y)?;
        let x = self.x(y)?;
        e.splice(self.ab2.errors(&x)?);
        Ok(0.5 * e.dot(&e)?)
    }

    /// `Aᵀ(A y − b̄) = y + R1⁻ᵀ A2ᵀ (A2 R1⁻¹ y − b2bar)`
    pub fn gradient(&self, y: &VectorConfig) -> ApexResult<VectorConfig> {
        self.check_y(y)?;
        let x = self.rc1.back_substitute(y)?;
        let mut e2 = self.ab2.multiply(&x)?;
        e2.axpy(-1.0, &self.b2bar)?;
        let gx2 = self.ab2.transpose_multiply(&e2)?;
        y.add(&self.rc1.back_substitute_transpose(&gx2)?)
    }

    /// `A y = [ y ; A2 R1⁻¹ y ]`
    pub fn multiply(&self, y: &VectorConfig) -> ApexResult<Errors> {
        let mut e = self.prefix(y)?;
        let x = self.rc1.back_substitute(y)?;
        e.splice(self.ab2.multiply(&x)?);
        Ok(e)
    }

    /// [`multiply`](Self::multiply) into `e`, which must already have the
    /// layout of [`zero_errors`](Self::zero_errors).
    pub fn multiply_in_place(&self, y: &VectorConfig, e: &mut Errors) -> ApexResult<()> {
        self.check_y(y)?;
        self.check_len(e)?;
        let mut slots = e.iter_mut();
        for (conditional, slot) in self.rc1.iter().zip(slots.by_ref()) {
            let y_j = y.get(conditional.key())?;
            if slot.len() != y_j.len() {
                return Err(ApexError::dimension(
                    format!("errors entry for {}", conditional.key()),
                    y_j.len(),
                    slot.len(),
                ));
            }
            slot.copy_from(y_j);
        }
        let x = self.rc1.back_substitute(y)?;
        self.ab2.multiply_into(&x, &mut slots)
    }

    /// `Aᵀ e = e1 + R1⁻ᵀ A2ᵀ e2`
    pub fn transpose_multiply(&self, e: &Errors) -> ApexResult<VectorConfig> {
        self.check_len(e)?;
        let mut y = VectorConfig::new();
        for (conditional, e_j) in self.rc1.iter().zip(e.iter()) {
            self.check_entry(conditional.key(), conditional.dim(), e_j.len())?;
            y.insert(conditional.key().clone(), e_j.clone())?;
        }
        let gy2 = self.transpose_tail(e)?;
        y.add_assign(&gy2)?;
        Ok(y)
    }

    /// `y += alpha Aᵀ e`
    pub fn transpose_multiply_add(
        &self,
        alpha: f64,
        e: &Errors,
        y: &mut VectorConfig,
    ) -> ApexResult<()> {
        self.check_y(y)?;
        self.check_len(e)?;
        for (conditional, e_j) in self.rc1.iter().zip(e.iter()) {
            self.check_entry(conditional.key(), conditional.dim(), e_j.len())?;
            y.entry_mut(conditional.key())?.axpy(alpha, e_j, 1.0);
        }
        let gy2 = self.transpose_tail(e)?;
        y.axpy(alpha, &gy2)
    }

    /// Errors prefix `[ y_j ]` in elimination order
    fn prefix(&self, y: &VectorConfig) -> ApexResult<Errors> {
        self.check_y(y)?;
        self.rc1
            .iter()
            .map(|conditional| y.get(conditional.key()).cloned())
            .collect()
    }

    /// `R1⁻ᵀ A2ᵀ e2` for the entries of `e` after the prefix
    fn transpose_tail(&self, e: &Errors) -> ApexResult<VectorConfig> {
        let mut gx2 = VectorConfig::new();
        self.ab2
            .transpose_multiply_add_entries(1.0, &e.as_slice()[self.rc1.len()..], &mut gx2)?;
        self.rc1.back_substitute_transpose(&gx2)
    }

    /// `y` must hold exactly the frontal keys
    fn check_y(&self, y: &VectorConfig) -> ApexResult<()> {
        for conditional in self.rc1.iter() {
            let y_j = y.get(conditional.key())?;
            self.check_entry(conditional.key(), conditional.dim(), y_j.len())?;
        }
        if y.len() != self.rc1.len() {
            if let Some(extra) = y.keys().find(|key| !self.rc1.contains(*key)) {
                return Err(invalid_input!(
                    "{} is not a variable of the preconditioned space",
                    extra
                ));
            }
        }
        Ok(())
    }

    fn check_len(&self, e: &Errors) -> ApexResult<()> {
        let expected = self.rc1.len() + self.ab2.len();
        if e.len() != expected {
            return Err(ApexError::OrderMismatch {
                expected,
                actual: e.len(),
            });
        }
        Ok(())
    }

    fn check_entry(&self, key: &Symbol, expected: usize, actual: usize) -> ApexResult<()> {
        if expected != actual {
            return Err(ApexError::dimension(format!("entry of {key}"), expected, actual));
        }
        Ok(())
    }
}

impl LeastSquaresOperator for SubgraphPreconditioner {
    fn error(&self, v: &VectorConfig) -> ApexResult<f64> {
        SubgraphPreconditioner::error(self, v)
    }

    fn gradient(&self, v: &VectorConfig) -> ApexResult<VectorConfig> {
        SubgraphPreconditioner::gradient(self, v)
    }

    fn multiply(&self, v: &VectorConfig) -> ApexResult<Errors> {
        SubgraphPreconditioner::multiply(self, v)
    }

    fn multiply_in_place(&self, v: &VectorConfig, e: &mut Errors) -> ApexResult<()> {
        SubgraphPreconditioner::multiply_in_place(self, v, e)
    }

    fn transpose_multiply(&self, e: &Errors) -> ApexResult<VectorConfig> {
        SubgraphPreconditioner::transpose_multiply(self, e)
    }

    fn transpose_multiply_add(
        &self,
        alpha: f64,
        e: &Errors,
        v: &mut VectorConfig,
    ) -> ApexResult<()> {
        SubgraphPreconditioner::transpose_multiply_add(self, alpha, e, v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::small_example::{create_correct_delta, split_small_graph};
    use crate::linear::{GaussianConditional, LinearFactor};
    use nalgebra::{DMatrix, DVector, dvector};

    fn assert_approx_eq(a: f64, b: f64, eps: f64) {
        assert!((a - b).abs() <= eps, "{a} != {b} (eps {eps})");
    }

    fn prior_only() -> SubgraphPreconditioner {
        let mut rc1 = GaussianBayesNet::new();
        rc1.push(
            GaussianConditional::new(
                "x1",
                dvector![0.2, -0.1],
                DMatrix::identity(2, 2),
                vec![],
                dvector![0.1, 0.1],
            )
            .unwrap(),
        )
        .unwrap();
        let mut xbar = VectorConfig::new();
        xbar.insert("x1", dvector![2.0, -1.0]).unwrap();
        SubgraphPreconditioner::new(
            Arc::new(LinearFactorGraph::new()),
            Arc::new(LinearFactorGraph::new()),
            Arc::new(rc1),
            Arc::new(xbar),
        )
        .unwrap()
    }

    /// Canonical spanning tree with a loop closure that disagrees with it
    fn perturbed_split() -> (LinearFactorGraph, LinearFactorGraph, Vec<Symbol>) {
        let (ab1, _, ordering) = split_small_graph();
        let mut ab2 = LinearFactorGraph::new();
        ab2.push(
            LinearFactor::binary(
                "x2",
                -DMatrix::<f64>::identity(2, 2),
                "l1",
                DMatrix::identity(2, 2),
                dvector![-0.1, 0.4],
                0.2,
            )
            .unwrap(),
        );
        (ab1, ab2, ordering)
    }

    fn small_system() -> SubgraphPreconditioner {
        let (ab1, ab2, ordering) = perturbed_split();
        SubgraphPreconditioner::from_subgraph(ab1, ab2, &ordering, &EliminationConfig::default())
            .unwrap()
    }

    fn y_of(p: &SubgraphPreconditioner, values: &[f64]) -> VectorConfig {
        let mut offset = 0;
        p.rc1()
            .iter()
            .map(|c| {
                let v = DVector::from_column_slice(&values[offset..offset + c.dim()]);
                offset += c.dim();
                (c.key().clone(), v)
            })
            .collect()
    }

    #[test]
    fn test_prior_only() {
        let p = prior_only();
        let zero = p.zero_y();
        assert_eq!(p.error(&zero).unwrap(), 0.0);
        assert!(p.gradient(&zero).unwrap().norm() < 1e-15);

        let y = y_of(&p, &[0.4, -0.7]);
        let e = p.multiply(&y).unwrap();
        assert_eq!(e.len(), 1);
        assert_eq!(e.get(0).unwrap(), &dvector![0.4, -0.7]);
        assert!(p.b2bar().is_empty());
    }

    #[test]
    fn test_x_of_zero_is_baseline() {
        let p = small_system();
        let x = p.x(&p.zero_y()).unwrap();
        assert!(x.equals(p.xbar(), 0.0));
        assert_eq!(p.dim(), 6);
    }

    #[test]
    fn test_error_at_origin_is_half_b2bar() {
        let p = small_system();
        assert!(p.b2bar().norm_squared() > 0.1);
        let expected = 0.5 * p.b2bar().norm_squared();
        assert_approx_eq(p.error(&p.zero_y()).unwrap(), expected, 1e-12);
    }

    #[test]
    fn test_consistent_split_has_zero_error() {
        let (ab1, ab2, ordering) = split_small_graph();
        let p = SubgraphPreconditioner::from_subgraph(ab1, ab2, &ordering, &EliminationConfig::default())
            .unwrap();
        assert!(p.xbar().equals(&create_correct_delta(), 1e-9));
        assert!(p.b2bar().norm_squared() < 1e-18);
        assert!(p.error(&p.zero_y()).unwrap() < 1e-18);
    }

    #[test]
    fn test_optimum_maps_to_stationary_point() {
        let p = small_system();
        let (ab1, ab2, ordering) = perturbed_split();
        let full: LinearFactorGraph = ab1.iter().chain(ab2.iter()).cloned().collect();
        let x_star = full.optimize(&ordering).unwrap();

        // y* = R1 (x* − x̄)
        let shift = x_star.sub(p.xbar()).unwrap();
        let y_star = p.rc1().whitened_multiply(&shift).unwrap();
        assert!(p.x(&y_star).unwrap().equals(&x_star, 1e-9));
        assert!(p.gradient(&y_star).unwrap().norm() < 1e-8);
        assert_approx_eq(
            p.error(&y_star).unwrap(),
            full.error(&x_star).unwrap(),
            1e-10,
        );
        assert!(p.error(&y_star).unwrap() < p.error(&p.zero_y()).unwrap());
    }

    #[test]
    fn test_multiply_layout() {
        let p = small_system();
        let e = p.multiply(&y_of(&p, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])).unwrap();
        assert_eq!(e.shape(), vec![2, 2, 2, 2]);
        assert_eq!(e.shape(), p.zero_errors().shape());
        assert_eq!(e.get(0).unwrap(), &dvector![1.0, 2.0]);
    }

    #[test]
    fn test_transpose_multiply_rejects_wrong_length() {
        let p = small_system();
        let e = Errors::zeros([2, 2, 2]);
        assert_eq!(
            p.transpose_multiply(&e).unwrap_err(),
            ApexError::OrderMismatch { expected: 4, actual: 3 }
        );
    }

    #[test]
    fn test_transpose_multiply_add_needs_frontals() {
        let p = small_system();
        let mut y = VectorConfig::new();
        let result = p.transpose_multiply_add(1.0, &p.zero_errors(), &mut y);
        assert!(matches!(result, Err(ApexError::MissingKey(_))));
    }

    #[test]
    fn test_y_with_extra_key_rejected() {
        let p = small_system();
        let mut y = p.zero_y();
        y.insert("z1", dvector![0.0]).unwrap();
        assert!(matches!(p.error(&y), Err(ApexError::InvalidInput(_))));
        assert!(matches!(p.gradient(&y), Err(ApexError::InvalidInput(_))));

        let before = y.clone();
        let result = p.transpose_multiply_add(1.0, &p.zero_errors(), &mut y);
        assert!(matches!(result, Err(ApexError::InvalidInput(_))));
        assert!(y.equals(&before, 0.0));
    }

    #[test]
    fn test_constraint_outside_subgraph_rejected() {
        let (ab1, mut ab2, ordering) = split_small_graph();
        ab2.push(
            LinearFactor::unary("l2", DMatrix::identity(2, 2), dvector![0.0, 0.0], 1.0).unwrap(),
        );
        let result =
            SubgraphPreconditioner::from_subgraph(ab1, ab2, &ordering, &EliminationConfig::default());
        assert_eq!(result.unwrap_err(), ApexError::MissingKey(Symbol::from("l2")));
    }

    #[test]
    fn test_baseline_must_cover_frontals() {
        let (ab1, ab2, ordering) = split_small_graph();
        let rc1 = ab1.eliminate(&ordering).unwrap();
        let mut xbar = VectorConfig::new();
        xbar.insert("x1", dvector![0.0, 0.0]).unwrap();
        let result = SubgraphPreconditioner::new(
            Arc::new(ab1),
            Arc::new(ab2),
            Arc::new(rc1),
            Arc::new(xbar),
        );
        assert!(matches!(result, Err(ApexError::MissingKey(_))));
    }
}
