//! Weighted Gram-Schmidt elimination of a stacked, row-weighted system
//!
//! Given an augmented block `[A | b]` with per-row precisions `w = 1/σ²`, the
//! kernel walks the columns of `A` left to right. For a column `a` with
//! precision `p = Σ wᵢ aᵢ²` it emits the unit-pivot row
//!
//! ```text
//! r = (w ∘ a / p)ᵀ [A | b],   σ_r = 1 / sqrt(p)
//! ```
//!
//! and removes the rank-one part `a rᵀ` from the system. Because the removed
//! residual is `w`-orthogonal to what is left, the weighted squared error of
//! the input equals the sum over emitted rows of `(r·x - d)² / σ_r²`, plus a
//! constant when the input has more rows than independent columns.

use nalgebra::{DMatrix, DVector};
use tracing::trace;

/// One emitted row `coefficients[..n] · x = coefficients[n]` with standard deviation `sigma`.
///
/// The coefficient at `column` is exactly one and every coefficient left of it is zero.
#[derive(Debug, Clone)]
pub struct WeightedRow {
    pub column: usize,
    pub coefficients: DVector<f64>,
    pub sigma: f64,
}

impl WeightedRow {
    /// Right-hand side of the row (last augmented entry)
    pub fn rhs(&self) -> f64 {
        self.coefficients[self.coefficients.len() - 1]
    }
}

/// Result of [`weighted_eliminate`]
#[derive(Debug, Clone, Default)]
pub struct WeightedElimination {
    pub rows: Vec<WeightedRow>,
    /// Columns with no remaining weight, with their weighted norm
    pub skipped: Vec<(usize, f64)>,
}

impl WeightedElimination {
    /// Weighted norm recorded for a skipped column, zero when the rows ran out first
    pub fn skipped_norm(&self, column: usize) -> f64 {
        self.skipped
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, norm)| *norm)
            .unwrap_or(0.0)
    }
}

/// Eliminate the first `ncols` columns of the augmented matrix `ab`.
///
/// Columns whose weighted norm falls below `tolerance` are skipped. The
/// kernel stops once it has emitted as many rows as `ab` has.
pub fn weighted_eliminate(
    ab: &DMatrix<f64>,
    precisions: &DVector<f64>,
    ncols: usize,
    tolerance: f64,
) -> WeightedElimination {
    let nrows = ab.nrows();
    let mut work = ab.clone();
    let mut result = WeightedElimination::default();

    for column in 0..ncols.min(work.ncols()) {
        if result.rows.len() >= nrows {
            break;
        }

        let a = work.column(column).clone_owned();
        let precision: f64 = a
            .iter()
            .zip(precisions.iter())
            .map(|(ai, wi)| wi * ai * ai)
            .sum();
        let norm = precision.sqrt();
        if !(norm >= tolerance) {
            trace!("column {} skipped (weighted norm {:e})", column, norm);
            result.skipped.push((column, norm));
            continue;
        }

        // pseudo-inverse of the column under the row weights
        let pseudo = a.component_mul(precisions) / precision;
        let mut coefficients = work.tr_mul(&pseudo);
        for c in 0..column {
            coefficients[c] = 0.0;
        }
        coefficients[column] = 1.0;

        // remove the rank-one part a rᵀ
        work.ger(-1.0, &a, &coefficients, 1.0);
        work.column_mut(column).fill(0.0);

        result.rows.push(WeightedRow {
            column,
            coefficients,
            sigma: 1.0 / norm,
        });
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{dmatrix, dvector};

    const TOLERANCE: f64 = 1e-10;

    fn assert_approx_eq(a: f64, b: f64, eps: f64) {
        assert!((a - b).abs() <= eps, "{a} != {b} (eps {eps})");
    }

    #[test]
    fn test_single_column_weighted_mean() {
        // two measurements of one scalar with different weights
        let ab = dmatrix![1.0, 2.0; 1.0, 4.0];
        let precisions = dvector![1.0, 3.0];
        let result = weighted_eliminate(&ab, &precisions, 1, 1e-9);

        assert_eq!(result.rows.len(), 1);
        let row = &result.rows[0];
        assert_approx_eq(row.coefficients[0], 1.0, TOLERANCE);
        assert_approx_eq(row.rhs(), (2.0 + 3.0 * 4.0) / 4.0, TOLERANCE);
        assert_approx_eq(row.sigma, 0.5, TOLERANCE);
    }

    #[test]
    fn test_weighted_error_is_preserved() {
        // square system: nothing is lost to the constant residual
        let ab = dmatrix![
            2.0, 1.0, 0.0, 1.0;
            0.0, 3.0, 1.0, -2.0;
            1.0, 0.0, 4.0, 0.5
        ];
        let precisions = dvector![4.0, 1.0, 0.25];
        let result = weighted_eliminate(&ab, &precisions, 3, 1e-9);
        assert_eq!(result.rows.len(), 3);

        let x = dvector![0.3, -1.2, 0.7];
        let mut expected = 0.0;
        for i in 0..3 {
            let r = (0..3).map(|c| ab[(i, c)] * x[c]).sum::<f64>() - ab[(i, 3)];
            expected += precisions[i] * r * r;
        }

        let mut actual = 0.0;
        for row in &result.rows {
            let r = row.coefficients.rows(0, 3).dot(&x) - row.rhs();
            actual += r * r / (row.sigma * row.sigma);
        }
        assert_approx_eq(actual, expected, 1e-9);
    }

    #[test]
    fn test_rows_are_unit_upper_triangular() {
        let ab = dmatrix![
            1.0, 2.0, 3.0, 1.0;
            4.0, 5.0, 6.0, 2.0;
            7.0, 8.0, 10.0, 3.0
        ];
        let result = weighted_eliminate(&ab, &dvector![1.0, 1.0, 1.0], 3, 1e-9);
        for (i, row) in result.rows.iter().enumerate() {
            assert_eq!(row.column, i);
            assert_eq!(row.coefficients[i], 1.0);
            for c in 0..i {
                assert_eq!(row.coefficients[c], 0.0);
            }
        }
    }

    #[test]
    fn test_zero_column_is_skipped() {
        let ab = dmatrix![0.0, 1.0, 1.0; 0.0, 2.0, 2.0];
        let result = weighted_eliminate(&ab, &dvector![1.0, 1.0], 2, 1e-9);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].column, 1);
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped_norm(0), 0.0);
    }
}
