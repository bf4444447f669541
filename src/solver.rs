/// Dense solve for the small symmetric positive-definite systems produced
/// by the Gauss-Newton updates (n <= 6).
use nalgebra::{DMatrix, DVector};

/// Solve `A x = b` for symmetric positive-definite `A` via Cholesky.
/// Returns `None` when the factorization fails, which the fitting drivers
/// treat as a per-peak solver error rather than a panic.
pub fn solve_spd(a: DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    a.cholesky().map(|chol| chol.solve(b))
}
