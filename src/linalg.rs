//! Glue between faer and the plain vectors the models carry around.

use faer::prelude::*;
use faer::{Col, Mat, Side};

/// Smallest pivot accepted, relative to the largest.
const PIVOT_EPS: f64 = 1e-12;

pub fn from_rows(rows: &[Vec<f64>]) -> Mat<f64> {
    let ncols = rows.first().map_or(0, Vec::len);
    Mat::from_fn(rows.len(), ncols, |i, j| rows[i][j])
}

pub fn to_rows(a: &Mat<f64>) -> Vec<Vec<f64>> {
    (0..a.nrows())
        .map(|i| (0..a.ncols()).map(|j| a[(i, j)]).collect())
        .collect()
}

pub fn row(a: &Mat<f64>, i: usize) -> Vec<f64> {
    (0..a.ncols()).map(|j| a[(i, j)]).collect()
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn col(x: &[f64]) -> Col<f64> {
    Col::from_fn(x.len(), |i| x[i])
}

fn to_vec(x: &Col<f64>) -> Vec<f64> {
    (0..x.nrows()).map(|i| x[i]).collect()
}

pub fn mat_vec(a: &Mat<f64>, x: &[f64]) -> Vec<f64> {
    to_vec(&(a * col(x)))
}

/// `Xᵀ diag(w) X`, or `XᵀX` when no weights are given.
pub fn weighted_gram(x: &Mat<f64>, weights: Option<&[f64]>) -> Mat<f64> {
    let scaled = Mat::from_fn(x.nrows(), x.ncols(), |r, j| {
        weights.map_or(1.0, |w| w[r]) * x[(r, j)]
    });
    x.transpose() * &scaled
}

/// `xᵀ A x`.
pub fn quad_form(a: &Mat<f64>, x: &[f64]) -> f64 {
    dot(x, &mat_vec(a, x))
}

fn pivots_ok(pivots: impl Iterator<Item = f64>) -> bool {
    let (lo, hi) = pivots.fold((f64::INFINITY, 0.0_f64), |(lo, hi), v| {
        (lo.min(v.abs()), hi.max(v.abs()))
    });
    lo.is_finite() && hi.is_finite() && lo > PIVOT_EPS * hi.max(1.0)
}

/// Solves `A x = b` for symmetric positive definite `A`; `None` when the
/// Cholesky factorisation fails or is numerically singular.
pub fn solve_spd(a: &Mat<f64>, b: &[f64]) -> Option<Vec<f64>> {
    let factor = a.cholesky(Side::Lower).ok()?;
    let l = factor.compute_l();
    if !pivots_ok((0..l.nrows()).map(|i| l[(i, i)] * l[(i, i)])) {
        return None;
    }
    let x = to_vec(&factor.solve(col(b)));
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Inverse through partial-pivot LU; `None` for singular input.
pub fn inverse(a: &Mat<f64>) -> Option<Mat<f64>> {
    if a.nrows() != a.ncols() {
        return None;
    }
    let lu = a.partial_piv_lu();
    let u = lu.compute_u();
    if !pivots_ok((0..u.nrows()).map(|i| u[(i, i)])) {
        return None;
    }
    let inv = lu.inverse();
    let finite = (0..inv.nrows()).all(|i| (0..inv.ncols()).all(|j| inv[(i, j)].is_finite()));
    finite.then_some(inv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-10
    }

    #[test]
    fn spd_solve_matches_known_system() {
        let a = from_rows(&[
            vec![4.0, 12.0, -16.0],
            vec![12.0, 37.0, -43.0],
            vec![-16.0, -43.0, 98.0],
        ]);
        let x = solve_spd(&a, &[1.0, 2.0, 3.0]).unwrap();
        let back = mat_vec(&a, &x);
        for (got, want) in back.iter().zip([1.0, 2.0, 3.0]) {
            assert!(close(*got, want));
        }
    }

    #[test]
    fn inverse_times_matrix_is_identity() {
        let a = from_rows(&[vec![0.0, 2.0, 1.0], vec![1.0, 1.0, 0.0], vec![3.0, 0.0, 1.0]]);
        let inv = inverse(&a).unwrap();
        let product = &a * &inv;
        for i in 0..3 {
            for j in 0..3 {
                assert!(close(product[(i, j)], if i == j { 1.0 } else { 0.0 }));
            }
        }
    }

    #[test]
    fn singular_matrices_are_rejected() {
        let a = from_rows(&[vec![1.0, 2.0], vec![2.0, 4.0]]);
        assert!(inverse(&a).is_none());
        assert!(solve_spd(&a, &[1.0, 1.0]).is_none());
        let indefinite = from_rows(&[vec![1.0, 0.0], vec![0.0, -1.0]]);
        assert!(solve_spd(&indefinite, &[1.0, 1.0]).is_none());
    }

    #[test]
    fn weighted_gram_applies_weights() {
        let x = from_rows(&[vec![1.0, 2.0], vec![1.0, 3.0]]);
        let g = weighted_gram(&x, Some(&[2.0, 1.0]));
        assert!(close(g[(0, 0)], 3.0));
        assert!(close(g[(0, 1)], 7.0));
        assert!(close(g[(1, 0)], 7.0));
        assert!(close(g[(1, 1)], 17.0));
        assert!(close(quad_form(&g, &[1.0, 0.0]), 3.0));
    }
}
