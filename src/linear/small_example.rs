//! Small linear problems shared by unit and integration tests.
//!
//! The canonical graph has two poses `x1`, `x2` and one landmark `l1`, all 2-D:
//!
//! ```text
//! f1: x1                 = [-0.1, -0.1]   σ = 0.1
//! f2: x2 - x1            = [ 0.2, -0.1]   σ = 0.1
//! f3: l1 - x1            = [ 0.0,  0.2]   σ = 0.2
//! f4: l1 - x2            = [-0.2,  0.3]   σ = 0.2
//! ```
//!
//! The measurements agree exactly, so [`create_correct_delta`] has zero error.

use nalgebra::{DMatrix, DVector, dvector};

use super::factor::LinearFactor;
use super::factor_graph::LinearFactorGraph;
use crate::core::{Symbol, VectorConfig};

fn identity() -> DMatrix<f64> {
    DMatrix::identity(2, 2)
}

fn minus_identity() -> DMatrix<f64> {
    -DMatrix::<f64>::identity(2, 2)
}

fn unary(key: &str, a: DMatrix<f64>, b: DVector<f64>, sigma: f64) -> LinearFactor {
    let sigmas = DVector::from_element(b.len(), sigma);
    LinearFactor::from_parts(vec![(Symbol::from(key), a)], b, sigmas)
}

fn binary(
    key1: &str,
    a1: DMatrix<f64>,
    key2: &str,
    a2: DMatrix<f64>,
    b: DVector<f64>,
    sigma: f64,
) -> LinearFactor {
    let sigmas = DVector::from_element(b.len(), sigma);
    LinearFactor::from_parts(
        vec![(Symbol::from(key1), a1), (Symbol::from(key2), a2)],
        b,
        sigmas,
    )
}

fn canonical_factors() -> Vec<LinearFactor> {
    vec![
        unary("x1", identity(), dvector![-0.1, -0.1], 0.1),
        binary("x1", minus_identity(), "x2", identity(), dvector![0.2, -0.1], 0.1),
        binary("x1", minus_identity(), "l1", identity(), dvector![0.0, 0.2], 0.2),
        binary("x2", minus_identity(), "l1", identity(), dvector![-0.2, 0.3], 0.2),
    ]
}

/// The four-factor graph on `x1`, `x2`, `l1`
pub fn create_linear_factor_graph() -> LinearFactorGraph {
    canonical_factors().into_iter().collect()
}

fn delta(entries: [(&str, DVector<f64>); 3]) -> VectorConfig {
    entries
        .into_iter()
        .map(|(key, value)| (Symbol::from(key), value))
        .collect()
}

pub fn create_zero_delta() -> VectorConfig {
    delta([
        ("x1", dvector![0.0, 0.0]),
        ("x2", dvector![0.0, 0.0]),
        ("l1", dvector![0.0, 0.0]),
    ])
}

/// Exact solution of the canonical graph
pub fn create_correct_delta() -> VectorConfig {
    delta([
        ("x1", dvector![-0.1, -0.1]),
        ("x2", dvector![0.1, -0.2]),
        ("l1", dvector![-0.1, 0.1]),
    ])
}

/// Canonical graph split into a spanning tree (`f1`, `f2`, `f3`) and the
/// loop-closing `f4`, with an ordering that eliminates the tree leaves first.
pub fn split_small_graph() -> (LinearFactorGraph, LinearFactorGraph, Vec<Symbol>) {
    let mut factors = canonical_factors();
    let constraints: LinearFactorGraph = factors.split_off(3).into_iter().collect();
    let spanning: LinearFactorGraph = factors.into_iter().collect();
    let ordering = ["l1", "x2", "x1"].into_iter().map(Symbol::from).collect();
    (spanning, constraints, ordering)
}

/// Chain `x0 … x{n-1}` with loop closures.
///
/// The spanning graph holds a prior on `x0` and odometry between consecutive
/// poses; the constraint graph links every third pose to the one three steps
/// ahead through a slightly rotated block. The returned ordering walks the
/// chain from `x0`, so each conditional's parent is the next pose.
pub fn create_loop_chain(n: usize) -> (LinearFactorGraph, LinearFactorGraph, Vec<Symbol>) {
    let keys: Vec<String> = (0..n).map(|i| format!("x{i}")).collect();
    let mut spanning = LinearFactorGraph::new();
    let mut constraints = LinearFactorGraph::new();

    let (sin, cos) = 0.1f64.sin_cos();
    let rotation = DMatrix::from_row_slice(2, 2, &[cos, -sin, sin, cos]);

    if let Some(first) = keys.first() {
        spanning.push(unary(first, identity(), dvector![0.5, -0.3], 0.1));
    }
    for (i, pair) in keys.windows(2).enumerate() {
        let step = i as f64;
        spanning.push(binary(
            &pair[0],
            minus_identity(),
            &pair[1],
            identity(),
            dvector![1.0, 0.1 * step],
            0.2,
        ));
    }
    for i in (0..n.saturating_sub(3)).step_by(3) {
        let step = i as f64;
        constraints.push(binary(
            &keys[i],
            minus_identity(),
            &keys[i + 3],
            rotation.clone(),
            dvector![3.0 + 0.05 * step, 0.2 - 0.02 * step],
            0.3,
        ));
    }

    let ordering = keys.into_iter().map(Symbol::from).collect();
    (spanning, constraints, ordering)
}
