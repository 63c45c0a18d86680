use nalgebra::{DMatrix, DVector};

use crate::core::{Symbol, VectorConfig};
use crate::error::{ApexError, ApexResult};
use crate::invalid_input;

/// One block row of a Gaussian Bayes net:
///
/// ```text
/// R x_j + Σ_k S_k x_k = d      (row i has standard deviation sigmas[i])
/// ```
///
/// `R` is square and upper triangular with a non-zero diagonal. A conditional
/// without parents is a prior on `x_j`; a zero-dimensional one is the trivial
/// prior `P(x_j) = 1` produced by eliminating an empty factor.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianConditional {
    key: Symbol,
    r: DMatrix<f64>,
    parents: Vec<(Symbol, DMatrix<f64>)>,
    d: DVector<f64>,
    sigmas: DVector<f64>,
}

impl GaussianConditional {
    /// Create a conditional `R x_j + Σ_k S_k x_k = d`.
    ///
    /// # Arguments
    /// * `key` - Frontal variable `x_j`
    /// * `d` - Right-hand side, one entry per row
    /// * `r` - Square upper-triangular block on `x_j` with a non-zero diagonal
    /// * `parents` - Blocks `S_k` on the parent variables, each with `d.len()` rows
    /// * `sigmas` - Positive per-row standard deviations
    ///
    /// # Errors
    /// * [`ApexError::InvalidInput`] if `r` is not square or has entries below the diagonal,
    ///   a sigma is not positive, or `key` is among its own parents
    /// * [`ApexError::SingularPivot`] if the diagonal of `r` has a zero
    /// * [`ApexError::DimensionMismatch`] if row counts disagree
    pub fn new(
        key: impl Into<Symbol>,
        d: DVector<f64>,
        r: DMatrix<f64>,
        parents: Vec<(Symbol, DMatrix<f64>)>,
        sigmas: DVector<f64>,
    ) -> ApexResult<Self> {
        let key = key.into();
        let dim = d.len();

        if r.nrows() != r.ncols() {
            return Err(invalid_input!(
                "R of {} must be square, got {}x{}",
                key,
                r.nrows(),
                r.ncols()
            ));
        }
        if r.nrows() != dim {
            return Err(ApexError::dimension(format!("R rows of {key}"), dim, r.nrows()));
        }
        if sigmas.len() != dim {
            return Err(ApexError::dimension(
                format!("sigmas of {key}"),
                dim,
                sigmas.len(),
            ));
        }
        if let Some(sigma) = sigmas.iter().find(|s| !(**s > 0.0 && s.is_finite())) {
            return Err(invalid_input!("sigma {} of {} must be positive", sigma, key));
        }
        if let Some(pivot) = r.diagonal().iter().find(|v| **v == 0.0 || !v.is_finite()) {
            return Err(ApexError::SingularPivot { key, pivot: *pivot });
        }
        if let Some((i, j)) = (0..dim)
            .flat_map(|i| (0..i).map(move |j| (i, j)))
            .find(|&(i, j)| r[(i, j)] != 0.0)
        {
            return Err(invalid_input!(
                "R of {} must be upper triangular, entry ({}, {}) is {}",
                key,
                i,
                j,
                r[(i, j)]
            ));
        }

        for (i, (parent, s)) in parents.iter().enumerate() {
            if *parent == key {
                return Err(invalid_input!("{} cannot be its own parent", key));
            }
            if parents[..i].iter().any(|(other, _)| other == parent) {
                return Err(ApexError::DuplicateKey(parent.clone()));
            }
            if s.nrows() != dim {
                return Err(ApexError::dimension(
                    format!("S rows of {key} on {parent}"),
                    dim,
                    s.nrows(),
                ));
            }
        }

        Ok(Self {
            key,
            r,
            parents,
            d,
            sigmas,
        })
    }

    /// Unit-sigma conditional
    pub fn with_unit_sigmas(
        key: impl Into<Symbol>,
        d: DVector<f64>,
        r: DMatrix<f64>,
        parents: Vec<(Symbol, DMatrix<f64>)>,
    ) -> ApexResult<Self> {
        let sigmas = DVector::from_element(d.len(), 1.0);
        Self::new(key, d, r, parents, sigmas)
    }

    /// Zero-dimensional, parent-less conditional
    pub fn empty(key: impl Into<Symbol>) -> Self {
        Self {
            key: key.into(),
            r: DMatrix::zeros(0, 0),
            parents: Vec::new(),
            d: DVector::zeros(0),
            sigmas: DVector::zeros(0),
        }
    }

    /// Frontal variable
    pub fn key(&self) -> &Symbol {
        &self.key
    }

    pub fn dim(&self) -> usize {
        self.d.len()
    }

    /// Upper-triangular block on the frontal variable (unit diagonal after elimination)
    pub fn r(&self) -> &DMatrix<f64> {
        &self.r
    }

    /// Right-hand side
    pub fn d(&self) -> &DVector<f64> {
        &self.d
    }

    /// Per-row standard deviations
    pub fn sigmas(&self) -> &DVector<f64> {
        &self.sigmas
    }

    /// Parent blocks `(x_k, S_k)` in construction order
    pub fn parents(&self) -> impl Iterator<Item = (&Symbol, &DMatrix<f64>)> {
        self.parents.iter().map(|(k, s)| (k, s))
    }

    pub fn parent_keys(&self) -> impl Iterator<Item = &Symbol> {
        self.parents.iter().map(|(k, _)| k)
    }

    /// Block `S_k` on `parent`, `MissingKey` if it is not a parent
    pub fn get_s(&self, parent: impl AsRef<str>) -> ApexResult<&DMatrix<f64>> {
        let parent = parent.as_ref();
        self.parents
            .iter()
            .find(|(k, _)| k.as_str() == parent)
            .map(|(_, s)| s)
            .ok_or_else(|| ApexError::MissingKey(Symbol::from(parent)))
    }

    /// Solve for `x_j` using the stored right-hand side:
    /// `x_j = R⁻¹ (d − Σ S_k x_k)`.
    pub fn solve(&self, x: &VectorConfig) -> ApexResult<DVector<f64>> {
        let rhs = self.subtract_parents(self.d.clone(), x)?;
        self.back_solve(rhs)
    }

    /// Solve the whitened row `R̃ x_j + Σ S̃_k x_k = y_j` for `x_j`, i.e. the
    /// stored `d` is replaced by the whitened right-hand side `y_j`.
    pub fn solve_whitened(&self, y_j: &DVector<f64>, x: &VectorConfig) -> ApexResult<DVector<f64>> {
        if y_j.len() != self.dim() {
            return Err(ApexError::dimension(
                format!("right-hand side of {}", self.key),
                self.dim(),
                y_j.len(),
            ));
        }
        let rhs = self.subtract_parents(y_j.component_mul(&self.sigmas), x)?;
        self.back_solve(rhs)
    }

    /// One step of transpose back-substitution on the whitened triangle:
    /// solves `R̃ᵀ u_j = y[j]`, stores `u_j` in `y[j]` and subtracts
    /// `S̃_kᵀ u_j` from each parent entry `y[k]`. Absent entries start at zero.
    pub fn solve_transpose_in_place(&self, y: &mut VectorConfig) -> ApexResult<()> {
        let y_j = y.entry_or_zeros(&self.key, self.dim())?;
        // v = R⁻ᵀ y_j, u_j = σ ∘ v, S̃ᵀ u_j = Sᵀ v
        let v = self
            .r
            .tr_solve_upper_triangular(y_j)
            .ok_or_else(|| self.singular())?;
        *y_j = v.component_mul(&self.sigmas);

        for (parent, s) in &self.parents {
            y.entry_or_zeros(parent, s.ncols())?
                .gemv_tr(-1.0, s, &v, 1.0);
        }
        Ok(())
    }

    /// Whitened row value `R̃ x_j + Σ S̃_k x_k`
    pub fn whitened_multiply(&self, x: &VectorConfig) -> ApexResult<DVector<f64>> {
        let mut value = DVector::zeros(self.dim());
        let x_j = x.get(&self.key)?;
        check_block(&self.key, &self.r, x_j)?;
        value.gemv(1.0, &self.r, x_j, 0.0);
        for (parent, s) in &self.parents {
            let x_k = x.get(parent)?;
            check_block(parent, s, x_k)?;
            value.gemv(1.0, s, x_k, 1.0);
        }
        Ok(value.component_div(&self.sigmas))
    }

    /// `½ ‖diag(1/σ)(R x_j + Σ S_k x_k − d)‖²`
    pub fn error(&self, x: &VectorConfig) -> ApexResult<f64> {
        if self.dim() == 0 {
            return Ok(0.0);
        }
        let residual = self.whitened_multiply(x)? - self.d.component_div(&self.sigmas);
        Ok(0.5 * residual.norm_squared())
    }

    pub fn equals(&self, other: &GaussianConditional, tol: f64) -> bool {
        self.key == other.key
            && approx_matrix(&self.r, &other.r, tol)
            && approx_matrix(&self.d, &other.d, tol)
            && approx_matrix(&self.sigmas, &other.sigmas, tol)
            && self.parents.len() == other.parents.len()
            && self.parents.iter().all(|(k, s)| {
                other
                    .parents
                    .iter()
                    .any(|(ok, os)| ok == k && approx_matrix(s, os, tol))
            })
    }

    fn subtract_parents(&self, mut rhs: DVector<f64>, x: &VectorConfig) -> ApexResult<DVector<f64>> {
        for (parent, s) in &self.parents {
            let x_k = x.get(parent)?;
            check_block(parent, s, x_k)?;
            rhs.gemv(-1.0, s, x_k, 1.0);
        }
        Ok(rhs)
    }

    fn back_solve(&self, rhs: DVector<f64>) -> ApexResult<DVector<f64>> {
        self.r
            .solve_upper_triangular(&rhs)
            .ok_or_else(|| self.singular())
    }

    fn singular(&self) -> ApexError {
        let pivot = self
            .r
            .diagonal()
            .iter()
            .fold(f64::INFINITY, |min, v| min.min(v.abs()));
        ApexError::SingularPivot {
            key: self.key.clone(),
            pivot,
        }
    }
}

fn check_block(key: &Symbol, block: &DMatrix<f64>, value: &DVector<f64>) -> ApexResult<()> {
    if block.ncols() != value.len() {
        return Err(ApexError::dimension(
            format!("value of {key}"),
            block.ncols(),
            value.len(),
        ));
    }
    Ok(())
}

pub(crate) fn approx_matrix<R, C, S1, S2>(
    a: &nalgebra::Matrix<f64, R, C, S1>,
    b: &nalgebra::Matrix<f64, R, C, S2>,
    tol: f64,
) -> bool
where
    R: nalgebra::Dim,
    C: nalgebra::Dim,
    S1: nalgebra::RawStorage<f64, R, C>,
    S2: nalgebra::RawStorage<f64, R, C>,
{
    a.shape() == b.shape() && a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= tol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{dmatrix, dvector};

    fn config(entries: &[(&str, DVector<f64>)]) -> VectorConfig {
        let mut c = VectorConfig::new();
        for (key, v) in entries {
            c.insert(*key, v.clone()).unwrap();
        }
        c
    }

    fn x2_given_l1_x1() -> GaussianConditional {
        GaussianConditional::new(
            "x2",
            dvector![0.2, -0.14],
            DMatrix::identity(2, 2),
            vec![
                (Symbol::from("l1"), DMatrix::identity(2, 2) * -0.2),
                (Symbol::from("x1"), DMatrix::identity(2, 2) * -0.8),
            ],
            DVector::from_element(2, 1.0 / 125f64.sqrt()),
        )
        .unwrap()
    }

    #[test]
    fn test_solve_uses_parents() {
        let cg = x2_given_l1_x1();
        let x = config(&[("l1", dvector![1.0, 0.0]), ("x1", dvector![0.0, 1.0])]);
        let x2 = cg.solve(&x).unwrap();
        assert!((x2 - dvector![0.4, 0.66]).norm() < 1e-12);
    }

    #[test]
    fn test_solve_whitened_scales_rhs_by_sigma() {
        let cg = GaussianConditional::new(
            "x1",
            dvector![0.0, 0.0],
            dmatrix![2.0, 1.0; 0.0, 4.0],
            vec![],
            dvector![0.5, 0.25],
        )
        .unwrap();
        // R̃ = [[4, 2], [0, 16]]
        let x = cg.solve_whitened(&dvector![6.0, 16.0], &VectorConfig::new()).unwrap();
        assert!((x - dvector![1.0, 1.0]).norm() < 1e-12);

        let y = config(&[("x1", dvector![1.0, 1.0])]);
        let row = cg.whitened_multiply(&y).unwrap();
        assert!((row - dvector![6.0, 16.0]).norm() < 1e-12);
    }

    #[test]
    fn test_solve_transpose_in_place() {
        let cg = GaussianConditional::new(
            "x1",
            dvector![0.0, 0.0],
            dmatrix![2.0, 1.0; 0.0, 4.0],
            vec![(Symbol::from("x2"), dmatrix![1.0, 0.0; 0.0, 1.0])],
            dvector![0.5, 0.25],
        )
        .unwrap();
        // R̃ᵀ u = [4, 18] with R̃ = [[4, 2], [0, 16]] gives u = [1, 1]
        let mut y = config(&[("x1", dvector![4.0, 18.0])]);
        cg.solve_transpose_in_place(&mut y).unwrap();
        assert!((y.get("x1").unwrap() - dvector![1.0, 1.0]).norm() < 1e-12);
        // S̃ᵀ u = Sᵀ diag(1/σ) u = [2, 4], subtracted from a fresh zero entry
        assert!((y.get("x2").unwrap() - dvector![-2.0, -4.0]).norm() < 1e-12);
    }

    #[test]
    fn test_error_of_solution_is_zero() {
        let cg = x2_given_l1_x1();
        let mut x = config(&[("l1", dvector![0.1, -0.3]), ("x1", dvector![0.5, 0.5])]);
        let x2 = cg.solve(&x).unwrap();
        x.insert("x2", x2).unwrap();
        assert!(cg.error(&x).unwrap() < 1e-20);
    }

    #[test]
    fn test_invalid_construction() {
        let non_square = GaussianConditional::new(
            "x1",
            dvector![0.0, 0.0],
            DMatrix::zeros(2, 3),
            vec![],
            dvector![1.0, 1.0],
        );
        assert!(matches!(non_square, Err(ApexError::InvalidInput(_))));

        let singular = GaussianConditional::new(
            "x1",
            dvector![0.0, 0.0],
            dmatrix![1.0, 0.0; 0.0, 0.0],
            vec![],
            dvector![1.0, 1.0],
        );
        assert!(matches!(singular, Err(ApexError::SingularPivot { .. })));

        let bad_sigma = GaussianConditional::new(
            "x1",
            dvector![0.0],
            dmatrix![1.0],
            vec![],
            dvector![0.0],
        );
        assert!(matches!(bad_sigma, Err(ApexError::InvalidInput(_))));
    }

    #[test]
    fn test_lower_triangle_rejected() {
        // solves only read the upper part, so a lower entry would make R x and R⁻¹ y disagree
        let lower = GaussianConditional::new(
            "x1",
            dvector![1.0, 2.0],
            dmatrix![1.0, 0.0; 1.0, 1.0],
            vec![],
            dvector![1.0, 1.0],
        );
        assert!(matches!(lower, Err(ApexError::InvalidInput(_))));

        let upper = GaussianConditional::new(
            "x1",
            dvector![1.0, 2.0],
            dmatrix![1.0, 1.0; 0.0, 1.0],
            vec![],
            dvector![1.0, 1.0],
        );
        assert!(upper.is_ok());
    }

    #[test]
    fn test_empty_conditional() {
        let cg = GaussianConditional::empty("x2");
        assert_eq!(cg.dim(), 0);
        assert_eq!(cg.parent_keys().count(), 0);
        assert_eq!(cg.solve(&VectorConfig::new()).unwrap().len(), 0);
        assert_eq!(cg.error(&VectorConfig::new()).unwrap(), 0.0);
    }
}
