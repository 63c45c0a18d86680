use nalgebra::{DMatrix, DVector};
use tracing::debug;

use super::EliminationConfig;
use super::conditional::{GaussianConditional, approx_matrix};
use crate::core::{Dimensions, Symbol, VectorConfig};
use crate::error::{ApexError, ApexResult};
use crate::invalid_input;
use crate::linalg::{SparseTriplets, weighted_eliminate};

/// A weighted block row of a linear least-squares problem.
///
/// Represents the whitened residual `diag(1/σ) (Σ_k A_k x_k − b)`. All blocks
/// share the row count of `b` and `sigmas`, and every sigma is positive. The
/// empty factor has no blocks and no rows and contributes nothing anywhere.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LinearFactor {
    blocks: Vec<(Symbol, DMatrix<f64>)>,
    b: DVector<f64>,
    sigmas: DVector<f64>,
}

impl LinearFactor {
    /// Create a factor `diag(1/σ) (Σ_k A_k x_k − b)`.
    ///
    /// # Arguments
    /// * `blocks` - Distinct variables with their Jacobian blocks, all with `b.len()` rows
    /// * `b` - Right-hand side
    /// * `sigmas` - Positive per-row standard deviations
    pub fn new(
        blocks: Vec<(Symbol, DMatrix<f64>)>,
        b: DVector<f64>,
        sigmas: DVector<f64>,
    ) -> ApexResult<Self> {
        let rows = b.len();
        if blocks.is_empty() && rows > 0 {
            return Err(invalid_input!("factor with {} rows has no blocks", rows));
        }
        if sigmas.len() != rows {
            return Err(ApexError::dimension("factor sigmas", rows, sigmas.len()));
        }
        if let Some(sigma) = sigmas.iter().find(|s| !(**s > 0.0 && s.is_finite())) {
            return Err(invalid_input!("sigma {} must be positive", sigma));
        }
        for (i, (key, a)) in blocks.iter().enumerate() {
            if blocks[..i].iter().any(|(other, _)| other == key) {
                return Err(ApexError::DuplicateKey(key.clone()));
            }
            if a.nrows() != rows {
                return Err(ApexError::dimension(
                    format!("block rows of {key}"),
                    rows,
                    a.nrows(),
                ));
            }
        }
        Ok(Self { blocks, b, sigmas })
    }

    /// Assemble a factor from parts already known to be consistent.
    pub(crate) fn from_parts(
        blocks: Vec<(Symbol, DMatrix<f64>)>,
        b: DVector<f64>,
        sigmas: DVector<f64>,
    ) -> Self {
        debug_assert!(blocks.iter().all(|(_, a)| a.nrows() == b.len()));
        Self { blocks, b, sigmas }
    }

    /// Factor with the same sigma on every row
    pub fn with_sigma(
        blocks: Vec<(Symbol, DMatrix<f64>)>,
        b: DVector<f64>,
        sigma: f64,
    ) -> ApexResult<Self> {
        let sigmas = DVector::from_element(b.len(), sigma);
        Self::new(blocks, b, sigmas)
    }

    /// Single-variable factor with an isotropic sigma
    pub fn unary(
        key: impl Into<Symbol>,
        a: DMatrix<f64>,
        b: DVector<f64>,
        sigma: f64,
    ) -> ApexResult<Self> {
        Self::with_sigma(vec![(key.into(), a)], b, sigma)
    }

    /// Two-variable factor with an isotropic sigma
    pub fn binary(
        key1: impl Into<Symbol>,
        a1: DMatrix<f64>,
        key2: impl Into<Symbol>,
        a2: DMatrix<f64>,
        b: DVector<f64>,
        sigma: f64,
    ) -> ApexResult<Self> {
        Self::with_sigma(vec![(key1.into(), a1), (key2.into(), a2)], b, sigma)
    }

    /// Factor with no blocks and no rows; contributes nothing
    pub fn empty() -> Self {
        Self::default()
    }

    /// The conditional `R x_j + Σ S_k x_k = d` viewed as a factor.
    pub fn from_conditional(conditional: &GaussianConditional) -> ApexResult<Self> {
        if conditional.dim() == 0 {
            return Ok(Self::empty());
        }
        let mut blocks = vec![(conditional.key().clone(), conditional.r().clone())];
        blocks.extend(conditional.parents().map(|(k, s)| (k.clone(), s.clone())));
        Self::new(blocks, conditional.d().clone(), conditional.sigmas().clone())
    }

    /// Stack several factors into one.
    ///
    /// Keys keep their order of first appearance; blocks a factor does not
    /// touch are zero. Empty factors are ignored.
    pub fn combine(factors: &[&LinearFactor]) -> ApexResult<Self> {
        let mut dims: Vec<(Symbol, usize)> = Vec::new();
        let mut rows = 0;
        for factor in factors {
            for (key, a) in &factor.blocks {
                match dims.iter().find(|(k, _)| k == key) {
                    Some((_, dim)) if *dim != a.ncols() => {
                        return Err(ApexError::dimension(
                            format!("combined block {key}"),
                            *dim,
                            a.ncols(),
                        ));
                    }
                    Some(_) => {}
                    None => dims.push((key.clone(), a.ncols())),
                }
            }
            rows += factor.rows();
        }

        let mut blocks: Vec<(Symbol, DMatrix<f64>)> = dims
            .into_iter()
            .map(|(key, dim)| (key, DMatrix::zeros(rows, dim)))
            .collect();
        let mut b = DVector::zeros(rows);
        let mut sigmas = DVector::zeros(rows);

        let mut offset = 0;
        for factor in factors {
            let m = factor.rows();
            for (key, a) in &factor.blocks {
                if let Some((_, block)) = blocks.iter_mut().find(|(k, _)| k == key) {
                    block.view_mut((offset, 0), (m, a.ncols())).copy_from(a);
                }
            }
            b.rows_mut(offset, m).copy_from(&factor.b);
            sigmas.rows_mut(offset, m).copy_from(&factor.sigmas);
            offset += m;
        }

        Self::new(blocks, b, sigmas)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of blocks (variables involved)
    pub fn size(&self) -> usize {
        self.blocks.len()
    }

    /// Number of scalar rows
    pub fn rows(&self) -> usize {
        self.b.len()
    }

    /// Variables in block order
    pub fn keys(&self) -> impl Iterator<Item = &Symbol> {
        self.blocks.iter().map(|(k, _)| k)
    }

    /// `(variable, A_k)` pairs in block order
    pub fn blocks(&self) -> impl Iterator<Item = (&Symbol, &DMatrix<f64>)> {
        self.blocks.iter().map(|(k, a)| (k, a))
    }

    pub fn involves(&self, key: impl AsRef<str>) -> bool {
        let key = key.as_ref();
        self.blocks.iter().any(|(k, _)| k.as_str() == key)
    }

    /// Block on `key`, `MissingKey` if the factor does not involve it
    pub fn get_a(&self, key: impl AsRef<str>) -> ApexResult<&DMatrix<f64>> {
        let key = key.as_ref();
        self.blocks
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, a)| a)
            .ok_or_else(|| ApexError::MissingKey(Symbol::from(key)))
    }

    /// Dimension of one variable
    pub fn dim(&self, key: impl AsRef<str>) -> ApexResult<usize> {
        self.get_a(key).map(|a| a.ncols())
    }

    pub fn dimensions(&self) -> Dimensions {
        self.blocks
            .iter()
            .map(|(k, a)| (k.clone(), a.ncols()))
            .collect()
    }

    /// Unwhitened right-hand side
    pub fn b(&self) -> &DVector<f64> {
        &self.b
    }

    /// Per-row standard deviations
    pub fn sigmas(&self) -> &DVector<f64> {
        &self.sigmas
    }

    /// `diag(1/σ) v`
    fn whiten(&self, v: DVector<f64>) -> DVector<f64> {
        v.component_div(&self.sigmas)
    }

    /// Unwhitened `Σ_k A_k x_k`
    fn linear_part(&self, x: &VectorConfig) -> ApexResult<DVector<f64>> {
        let mut ax = DVector::zeros(self.rows());
        for (key, a) in &self.blocks {
            let x_k = x.get(key)?;
            if x_k.len() != a.ncols() {
                return Err(ApexError::dimension(
                    format!("value of {key}"),
                    a.ncols(),
                    x_k.len(),
                ));
            }
            ax.gemv(1.0, a, x_k, 1.0);
        }
        Ok(ax)
    }

    /// Whitened residual `diag(1/σ)(A x − b)`
    pub fn error_vector(&self, x: &VectorConfig) -> ApexResult<DVector<f64>> {
        let ax = self.linear_part(x)?;
        Ok(self.whiten(ax - &self.b))
    }

    /// Whitened residual with the opposite sign, `diag(1/σ)(b − A x)`
    pub fn negated_error_vector(&self, x: &VectorConfig) -> ApexResult<DVector<f64>> {
        let ax = self.linear_part(x)?;
        Ok(self.whiten(&self.b - ax))
    }

    /// `½ ‖diag(1/σ)(A x − b)‖²`
    pub fn error(&self, x: &VectorConfig) -> ApexResult<f64> {
        if self.is_empty() {
            return Ok(0.0);
        }
        Ok(0.5 * self.error_vector(x)?.norm_squared())
    }

    /// Whitened forward product `diag(1/σ) A x`
    pub fn multiply(&self, x: &VectorConfig) -> ApexResult<DVector<f64>> {
        let mut out = DVector::zeros(self.rows());
        self.multiply_into(x, &mut out)?;
        Ok(out)
    }

    /// [`multiply`](Self::multiply) into a buffer of `rows()` entries
    pub fn multiply_into(&self, x: &VectorConfig, out: &mut DVector<f64>) -> ApexResult<()> {
        if out.len() != self.rows() {
            return Err(ApexError::dimension("factor product buffer", self.rows(), out.len()));
        }
        out.fill(0.0);
        for (key, a) in &self.blocks {
            let x_k = x.get(key)?;
            if x_k.len() != a.ncols() {
                return Err(ApexError::dimension(
                    format!("value of {key}"),
                    a.ncols(),
                    x_k.len(),
                ));
            }
            out.gemv(1.0, a, x_k, 1.0);
        }
        out.component_div_assign(&self.sigmas);
        Ok(())
    }

    /// `x[k] += alpha A_kᵀ diag(1/σ) e` for every block, inserting missing keys.
    pub fn transpose_multiply_add(
        &self,
        alpha: f64,
        e: &DVector<f64>,
        x: &mut VectorConfig,
    ) -> ApexResult<()> {
        if e.len() != self.rows() {
            return Err(ApexError::dimension("factor residual", self.rows(), e.len()));
        }
        let whitened = e.component_div(&self.sigmas);
        for (key, a) in &self.blocks {
            x.entry_or_zeros(key, a.ncols())?
                .gemv_tr(alpha, a, &whitened, 1.0);
        }
        Ok(())
    }

    /// `Aᵀ diag(1/σ) e` as a config over this factor's keys
    pub fn transpose_multiply(&self, e: &DVector<f64>) -> ApexResult<VectorConfig> {
        let mut x = VectorConfig::new();
        self.transpose_multiply_add(1.0, e, &mut x)?;
        Ok(x)
    }

    /// Eliminate `key` with the default configuration.
    pub fn eliminate(&self, key: impl AsRef<str>) -> ApexResult<(GaussianConditional, LinearFactor)> {
        self.eliminate_with_config(key, &EliminationConfig::default())
    }

    /// Split the factor into a conditional on `key` and a remainder factor on
    /// the other variables.
    ///
    /// The frontal variable's columns are eliminated first, then the remaining
    /// blocks in factor order. The conditional comes out with a unit upper
    /// triangular `R`; its rows and the remainder rows carry the scale in their
    /// sigmas. A remainder with no rows left is the empty factor.
    pub fn eliminate_with_config(
        &self,
        key: impl AsRef<str>,
        config: &EliminationConfig,
    ) -> ApexResult<(GaussianConditional, LinearFactor)> {
        let key = Symbol::from(key.as_ref());
        if self.is_empty() {
            return Ok((GaussianConditional::empty(key), LinearFactor::empty()));
        }

        let frontal = self.get_a(&key)?;
        let frontal_dim = frontal.ncols();
        let parents: Vec<(&Symbol, &DMatrix<f64>)> = self
            .blocks
            .iter()
            .filter(|(k, _)| *k != key)
            .map(|(k, a)| (k, a))
            .collect();

        let m = self.rows();
        let n = frontal_dim + parents.iter().map(|(_, a)| a.ncols()).sum::<usize>();
        let mut ab = DMatrix::zeros(m, n + 1);
        ab.view_mut((0, 0), (m, frontal_dim)).copy_from(frontal);
        let mut offset = frontal_dim;
        for (_, a) in &parents {
            ab.view_mut((0, offset), (m, a.ncols())).copy_from(*a);
            offset += a.ncols();
        }
        ab.set_column(n, &self.b);

        let precisions = self.sigmas.map(|s| 1.0 / (s * s));
        let elimination = weighted_eliminate(&ab, &precisions, n, config.pivot_tolerance);
        let rows = &elimination.rows;

        for column in 0..frontal_dim {
            if rows.get(column).is_none_or(|row| row.column != column) {
                return Err(ApexError::SingularPivot {
                    key,
                    pivot: elimination.skipped_norm(column),
                });
            }
        }

        // frontal rows -> conditional
        let mut r = DMatrix::zeros(frontal_dim, frontal_dim);
        let mut d = DVector::zeros(frontal_dim);
        let mut sigmas = DVector::zeros(frontal_dim);
        let mut parent_blocks: Vec<(Symbol, DMatrix<f64>)> = parents
            .iter()
            .map(|(k, a)| ((*k).clone(), DMatrix::zeros(frontal_dim, a.ncols())))
            .collect();
        for (i, row) in rows[..frontal_dim].iter().enumerate() {
            r.row_mut(i)
                .copy_from(&row.coefficients.rows(0, frontal_dim).transpose());
            fill_parent_row(&mut parent_blocks, i, &row.coefficients, frontal_dim);
            d[i] = row.rhs();
            sigmas[i] = row.sigma;
        }
        let conditional = GaussianConditional::new(key.clone(), d, r, parent_blocks, sigmas)?;

        // remaining rows -> factor on the parents
        let tail = &rows[frontal_dim..];
        let remainder = if tail.is_empty() || parents.is_empty() {
            LinearFactor::empty()
        } else {
            let mut blocks: Vec<(Symbol, DMatrix<f64>)> = parents
                .iter()
                .map(|(k, a)| ((*k).clone(), DMatrix::zeros(tail.len(), a.ncols())))
                .collect();
            let mut b = DVector::zeros(tail.len());
            let mut tail_sigmas = DVector::zeros(tail.len());
            for (i, row) in tail.iter().enumerate() {
                fill_parent_row(&mut blocks, i, &row.coefficients, frontal_dim);
                b[i] = row.rhs();
                tail_sigmas[i] = row.sigma;
            }
            LinearFactor::new(blocks, b, tail_sigmas)?
        };

        debug!(
            "eliminated {}: {} frontal rows, {} remainder rows on {} parents",
            key,
            frontal_dim,
            remainder.rows(),
            parents.len()
        );
        Ok((conditional, remainder))
    }

    /// Unwhitened `(A, b)` with blocks laid out in `order`.
    ///
    /// Variables in `order` that the factor does not touch become zero blocks
    /// whose width is taken from `dims`.
    pub fn matrix(
        &self,
        order: &[Symbol],
        dims: &Dimensions,
    ) -> ApexResult<(DMatrix<f64>, DVector<f64>)> {
        let a = self.render(order, dims, false)?;
        Ok((a, self.b.clone()))
    }

    /// Unwhitened `[A | b]` with blocks laid out in `order`
    pub fn matrix_augmented(&self, order: &[Symbol], dims: &Dimensions) -> ApexResult<DMatrix<f64>> {
        let a = self.render(order, dims, false)?;
        let n = a.ncols();
        let mut ab = a.insert_column(n, 0.0);
        ab.set_column(n, &self.b);
        Ok(ab)
    }

    /// Whitened `(diag(1/σ) A, diag(1/σ) b)` with blocks laid out in `order`
    pub fn whitened_matrix(
        &self,
        order: &[Symbol],
        dims: &Dimensions,
    ) -> ApexResult<(DMatrix<f64>, DVector<f64>)> {
        let a = self.render(order, dims, true)?;
        Ok((a, self.b.component_div(&self.sigmas)))
    }

    /// Whitened non-zero entries as 1-based `(i, j, s)` triplets.
    ///
    /// Rows are local to this factor; columns follow `order`, each variable
    /// spanning `dims[key]` columns. Blocks are visited in `order`, entries
    /// column by column within a block.
    pub fn sparse(&self, order: &[Symbol], dims: &Dimensions) -> ApexResult<SparseTriplets> {
        self.check_order(order)?;
        let mut triplets = SparseTriplets::new();
        let mut column_offset = 0;
        for key in order {
            let width = dims
                .get(key)
                .copied()
                .ok_or_else(|| ApexError::MissingKey(key.clone()))?;
            if let Ok(a) = self.get_a(key) {
                if a.ncols() != width {
                    return Err(ApexError::dimension(format!("block {key}"), width, a.ncols()));
                }
                for col in 0..a.ncols() {
                    for row in 0..a.nrows() {
                        let value = a[(row, col)] / self.sigmas[row];
                        if value != 0.0 {
                            triplets.push(row + 1, column_offset + col + 1, value);
                        }
                    }
                }
            }
            column_offset += width;
        }
        Ok(triplets)
    }

    pub fn equals(&self, other: &LinearFactor, tol: f64) -> bool {
        self.blocks.len() == other.blocks.len()
            && approx_matrix(&self.b, &other.b, tol)
            && approx_matrix(&self.sigmas, &other.sigmas, tol)
            && self.blocks.iter().all(|(k, a)| {
                other
                    .blocks
                    .iter()
                    .any(|(ok, oa)| ok == k && approx_matrix(a, oa, tol))
            })
    }

    fn check_order(&self, order: &[Symbol]) -> ApexResult<()> {
        match self.keys().find(|k| !order.contains(k)) {
            Some(key) => Err(ApexError::MissingKey(key.clone())),
            None => Ok(()),
        }
    }

    fn render(&self, order: &[Symbol], dims: &Dimensions, whiten: bool) -> ApexResult<DMatrix<f64>> {
        self.check_order(order)?;
        let mut widths = Vec::with_capacity(order.len());
        for key in order {
            let width = match self.get_a(key) {
                Ok(a) => a.ncols(),
                Err(_) => dims
                    .get(key)
                    .copied()
                    .ok_or_else(|| ApexError::MissingKey(key.clone()))?,
            };
            widths.push(width);
        }

        let m = self.rows();
        let mut a = DMatrix::zeros(m, widths.iter().sum());
        let mut offset = 0;
        for (key, width) in order.iter().zip(widths) {
            if let Ok(block) = self.get_a(key) {
                a.view_mut((0, offset), (m, width)).copy_from(block);
            }
            offset += width;
        }
        if whiten {
            for (mut row, sigma) in a.row_iter_mut().zip(self.sigmas.iter()) {
                row /= *sigma;
            }
        }
        Ok(a)
    }
}

/// Copy the parent part of an eliminated row into row `i` of each parent block.
fn fill_parent_row(
    blocks: &mut [(Symbol, DMatrix<f64>)],
    i: usize,
    coefficients: &DVector<f64>,
    frontal_dim: usize,
) {
    let mut offset = frontal_dim;
    for (_, block) in blocks.iter_mut() {
        let width = block.ncols();
        block
            .row_mut(i)
            .copy_from(&coefficients.rows(offset, width).transpose());
        offset += width;
    }
}
