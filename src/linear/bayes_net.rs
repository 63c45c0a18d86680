use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::DVector;

use super::conditional::GaussianConditional;
use crate::core::{Dimensions, Symbol, VectorConfig};
use crate::error::{ApexError, ApexResult};
use crate::invalid_input;

/// Gaussian conditionals in elimination order.
///
/// Frontal keys are distinct, and every parent of a conditional is either the
/// frontal of a later conditional or an input outside the net. Read together,
/// the conditionals form the whitened upper triangular system `R̃ x = d̃`.
///
/// [`ordering`](Self::ordering) is the order every sequence derived from the
/// net (errors prefixes in particular) follows.
#[derive(Debug, Clone, Default)]
pub struct GaussianBayesNet {
    conditionals: Vec<Arc<GaussianConditional>>,
    index: HashMap<Symbol, usize>,
}

impl GaussianBayesNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a conditional after all current ones.
    pub fn push(&mut self, conditional: GaussianConditional) -> ApexResult<()> {
        self.push_shared(Arc::new(conditional))
    }

    /// Append a shared conditional.
    ///
    /// Fails with `DuplicateKey` if its frontal is already present and with
    /// `InvalidInput` if one of its parents was eliminated earlier.
    pub fn push_shared(&mut self, conditional: Arc<GaussianConditional>) -> ApexResult<()> {
        let key = conditional.key().clone();
        if self.index.contains_key(&key) {
            return Err(ApexError::DuplicateKey(key));
        }
        if let Some(parent) = conditional
            .parent_keys()
            .find(|parent| self.index.contains_key(*parent))
        {
            return Err(invalid_input!(
                "parent {} of {} was eliminated before it",
                parent,
                key
            ));
        }
        self.index.insert(key, self.conditionals.len());
        self.conditionals.push(conditional);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.conditionals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditionals.is_empty()
    }

    /// Conditionals in elimination order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &GaussianConditional> {
        self.conditionals.iter().map(|c| c.as_ref())
    }

    /// Frontal keys in elimination order
    pub fn ordering(&self) -> Vec<Symbol> {
        self.iter().map(|c| c.key().clone()).collect()
    }

    pub fn contains(&self, key: impl AsRef<str>) -> bool {
        self.index.contains_key(key.as_ref())
    }

    /// Conditional whose frontal is `key`
    pub fn get(&self, key: impl AsRef<str>) -> ApexResult<&GaussianConditional> {
        let key = key.as_ref();
        self.index
            .get(key)
            .map(|&i| self.conditionals[i].as_ref())
            .ok_or_else(|| ApexError::MissingKey(Symbol::from(key)))
    }

    /// Frontal dimensions
    pub fn dimensions(&self) -> Dimensions {
        self.iter().map(|c| (c.key().clone(), c.dim())).collect()
    }

    /// Total frontal dimension
    pub fn dim(&self) -> usize {
        self.iter().map(GaussianConditional::dim).sum()
    }

    /// Solve `R̃ x = y` by back-substitution in reverse elimination order.
    ///
    /// `y[j]` replaces the whitened right-hand side of conditional `j`. Parents
    /// that are not frontals of this net are read from `y` as fixed inputs.
    pub fn back_substitute(&self, y: &VectorConfig) -> ApexResult<VectorConfig> {
        let mut x = self.external_parents(y)?;
        for conditional in self.conditionals.iter().rev() {
            let y_j = y.get(conditional.key())?;
            let x_j = conditional.solve_whitened(y_j, &x)?;
            x.insert(conditional.key().clone(), x_j)?;
        }
        Ok(self.frontals_of(x))
    }

    /// Solve `R̃ᵀ y = x` by forward substitution in elimination order.
    ///
    /// Frontals absent from `x` start at zero. Entries of `x` that are not
    /// frontals receive the parent contributions and are returned as well.
    pub fn back_substitute_transpose(&self, x: &VectorConfig) -> ApexResult<VectorConfig> {
        let mut y = x.clone();
        for conditional in &self.conditionals {
            conditional.solve_transpose_in_place(&mut y)?;
        }
        Ok(y)
    }

    /// Solution `R⁻¹ d` using each conditional's own right-hand side
    pub fn optimize(&self) -> ApexResult<VectorConfig> {
        let mut x = VectorConfig::new();
        for conditional in self.conditionals.iter().rev() {
            let x_j = conditional.solve(&x)?;
            x.insert(conditional.key().clone(), x_j)?;
        }
        Ok(x)
    }

    /// `R̃ x`, one entry per frontal
    pub fn whitened_multiply(&self, x: &VectorConfig) -> ApexResult<VectorConfig> {
        let mut y = VectorConfig::new();
        for conditional in &self.conditionals {
            let value = if conditional.dim() == 0 {
                DVector::zeros(0)
            } else {
                conditional.whitened_multiply(x)?
            };
            y.insert(conditional.key().clone(), value)?;
        }
        Ok(y)
    }

    /// `R̃ᵀ u`, accumulated over frontals and parents
    pub fn whitened_transpose_multiply(&self, u: &VectorConfig) -> ApexResult<VectorConfig> {
        let mut x = VectorConfig::new();
        for conditional in &self.conditionals {
            let u_j = u.get(conditional.key())?;
            if u_j.len() != conditional.dim() {
                return Err(ApexError::dimension(
                    format!("whitened entry of {}", conditional.key()),
                    conditional.dim(),
                    u_j.len(),
                ));
            }
            let v = u_j.component_div(conditional.sigmas());
            x.entry_or_zeros(conditional.key(), conditional.dim())?
                .gemv_tr(1.0, conditional.r(), &v, 1.0);
            for (parent, s) in conditional.parents() {
                x.entry_or_zeros(parent, s.ncols())?
                    .gemv_tr(1.0, s, &v, 1.0);
            }
        }
        Ok(x)
    }

    /// Total error `Σ ½‖diag(1/σ)(R x_j + S x_par − d)‖²`
    pub fn error(&self, x: &VectorConfig) -> ApexResult<f64> {
        self.iter().map(|c| c.error(x)).sum()
    }

    pub fn equals(&self, other: &GaussianBayesNet, tol: f64) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .zip(other.iter())
                .all(|(a, b)| a.equals(b, tol))
    }

    /// Values of parents that no conditional in the net eliminates
    fn external_parents(&self, y: &VectorConfig) -> ApexResult<VectorConfig> {
        let mut inputs = VectorConfig::new();
        for conditional in &self.conditionals {
            for parent in conditional.parent_keys() {
                if !self.contains(parent) && !inputs.contains(parent) {
                    inputs.insert(parent.clone(), y.get(parent)?.clone())?;
                }
            }
        }
        Ok(inputs)
    }

    fn frontals_of(&self, x: VectorConfig) -> VectorConfig {
        x.into_iter()
            .filter(|(key, _)| self.contains(key))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, dmatrix, dvector};

    fn assert_approx_eq(a: f64, b: f64, eps: f64) {
        assert!((a - b).abs() <= eps, "{a} != {b} (eps {eps})");
    }

    /// x2 | l1 and the prior on l1, eliminated in that order
    fn two_node_net() -> GaussianBayesNet {
        let mut net = GaussianBayesNet::new();
        net.push(
            GaussianConditional::new(
                "x2",
                dvector![0.2, -0.14],
                dmatrix![1.0, 0.5; 0.0, 1.0],
                vec![(Symbol::from("l1"), dmatrix![-0.2, 0.0; 0.3, -0.8])],
                dvector![0.1, 0.2],
            )
            .unwrap(),
        )
        .unwrap();
        net.push(
            GaussianConditional::new(
                "l1",
                dvector![1.0, 2.0],
                dmatrix![2.0, 1.0; 0.0, 4.0],
                vec![],
                dvector![0.5, 0.25],
            )
            .unwrap(),
        )
        .unwrap();
        net
    }

    fn config(entries: &[(&str, DVector<f64>)]) -> VectorConfig {
        entries
            .iter()
            .map(|(k, v)| (Symbol::from(*k), v.clone()))
            .collect()
    }

    #[test]
    fn test_ordering_and_dimensions() {
        let net = two_node_net();
        assert_eq!(net.ordering(), vec![Symbol::from("x2"), Symbol::from("l1")]);
        assert_eq!(net.len(), 2);
        assert_eq!(net.dim(), 4);
        assert_eq!(net.dimensions().get("l1"), Some(&2));
        assert!(net.contains("x2"));
        assert!(net.get("x1").is_err());
    }

    #[test]
    fn test_duplicate_frontal_rejected() {
        let mut net = two_node_net();
        let again = GaussianConditional::with_unit_sigmas(
            "l1",
            dvector![0.0, 0.0],
            DMatrix::identity(2, 2),
            vec![],
        )
        .unwrap();
        assert_eq!(net.push(again).unwrap_err(), ApexError::DuplicateKey(Symbol::from("l1")));
    }

    #[test]
    fn test_parent_eliminated_earlier_rejected() {
        let mut net = two_node_net();
        let late = GaussianConditional::with_unit_sigmas(
            "x1",
            dvector![0.0],
            DMatrix::identity(1, 1),
            vec![(Symbol::from("x2"), dmatrix![1.0, 0.0])],
        )
        .unwrap();
        assert!(matches!(net.push(late), Err(ApexError::InvalidInput(_))));
    }

    #[test]
    fn test_optimize_uses_stored_rhs() {
        let net = two_node_net();
        let x = net.optimize().unwrap();
        // l1: [[2,1],[0,4]] l1 = [1,2]
        let l1 = x.get("l1").unwrap();
        assert_approx_eq(l1[1], 0.5, 1e-12);
        assert_approx_eq(l1[0], 0.25, 1e-12);
        let expected_x2 = net.get("x2").unwrap().solve(&x).unwrap();
        assert!((x.get("x2").unwrap() - expected_x2).norm() < 1e-12);
        assert_approx_eq(net.error(&x).unwrap(), 0.0, 1e-20);
    }

    #[test]
    fn test_back_substitute_inverts_whitened_multiply() {
        let net = two_node_net();
        let y = config(&[("x2", dvector![0.3, -1.0]), ("l1", dvector![2.0, 0.5])]);
        let x = net.back_substitute(&y).unwrap();
        assert_eq!(x.len(), 2);
        let back = net.whitened_multiply(&x).unwrap();
        assert!(back.equals(&y, 1e-10));
    }

    #[test]
    fn test_back_substitute_transpose_inverts_whitened_transpose() {
        let net = two_node_net();
        let x = config(&[("x2", dvector![-0.4, 1.5]), ("l1", dvector![0.7, 0.1])]);
        let y = net.back_substitute_transpose(&x).unwrap();
        let back = net.whitened_transpose_multiply(&y).unwrap();
        assert!(back.equals(&x, 1e-10));
    }

    #[test]
    fn test_back_substitute_pair_is_adjoint() {
        let net = two_node_net();
        let a = config(&[("x2", dvector![0.3, -1.0]), ("l1", dvector![2.0, 0.5])]);
        let b = config(&[("x2", dvector![1.1, 0.2]), ("l1", dvector![-0.6, 0.9])]);
        let lhs = net.back_substitute(&a).unwrap().dot(&b).unwrap();
        let rhs = a.dot(&net.back_substitute_transpose(&b).unwrap()).unwrap();
        assert_approx_eq(lhs, rhs, 1e-10);
    }

    #[test]
    fn test_back_substitute_transpose_fills_missing_frontals() {
        let net = two_node_net();
        let x = config(&[("x2", dvector![1.0, 0.0])]);
        let y = net.back_substitute_transpose(&x).unwrap();
        assert!(y.contains("l1"));
        assert_eq!(y.len(), 2);
    }

    #[test]
    fn test_back_substitute_missing_key() {
        let net = two_node_net();
        let y = config(&[("x2", dvector![0.3, -1.0])]);
        assert_eq!(
            net.back_substitute(&y).unwrap_err(),
            ApexError::MissingKey(Symbol::from("l1"))
        );
    }

    #[test]
    fn test_external_parent_is_an_input() {
        let mut net = GaussianBayesNet::new();
        net.push(
            GaussianConditional::with_unit_sigmas(
                "x1",
                dvector![1.0],
                dmatrix![1.0],
                vec![(Symbol::from("x0"), dmatrix![-1.0])],
            )
            .unwrap(),
        )
        .unwrap();
        let y = config(&[("x1", dvector![1.0]), ("x0", dvector![2.0])]);
        let x = net.back_substitute(&y).unwrap();
        assert_eq!(x.len(), 1);
        assert_approx_eq(x.get("x1").unwrap()[0], 3.0, 1e-12);
    }
}
