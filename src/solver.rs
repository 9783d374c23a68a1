//! Closed-form ridge regression
//!
//! Solves `(XᵗX + λI) β = Xᵗy` by Gauss-Jordan elimination with partial
//! pivoting. The intercept is not regularized; it is taken as the mean
//! residual `mean(y - Xβ)` after β is known.

use tracing::warn;

use crate::error::{PipelineError, Result};

/// Pivots smaller than this are clamped instead of failing
pub const PIVOT_EPSILON: f64 = 1e-12;

/// Fitted ridge coefficients
#[derive(Debug, Clone, PartialEq)]
pub struct RidgeFit {
    pub beta: Vec<f64>,
    pub intercept: f64,
}

/// Ridge regression solver
pub struct RidgeSolver;

impl RidgeSolver {
    /// Fit `y ≈ Xβ + intercept` with an L2 penalty `lambda` on β.
    ///
    /// `x` is row-major, one row per observation. All rows must have the
    /// same width. Rank-deficient systems do not fail: near-zero pivots are
    /// replaced with [`PIVOT_EPSILON`].
    pub fn fit(x: &[Vec<f64>], y: &[f64], lambda: f64) -> Result<RidgeFit> {
        let n = x.len();
        if n == 0 {
            return Err(PipelineError::EmptyDesignMatrix);
        }
        if y.len() != n {
            return Err(PipelineError::DimensionMismatch {
                expected: n,
                found: y.len(),
            });
        }

        let p = x[0].len();
        if let Some(row) = x.iter().find(|row| row.len() != p) {
            return Err(PipelineError::DimensionMismatch {
                expected: p,
                found: row.len(),
            });
        }

        let (mut a, mut b) = normal_equations(x, y, lambda);
        let beta = gauss_jordan(&mut a, &mut b);

        let intercept = x
            .iter()
            .zip(y)
            .map(|(row, yi)| yi - dot(row, &beta))
            .sum::<f64>()
            / n as f64;

        Ok(RidgeFit { beta, intercept })
    }
}

/// Build `A = XᵗX + λI` and `b = Xᵗy`
fn normal_equations(x: &[Vec<f64>], y: &[f64], lambda: f64) -> (Vec<Vec<f64>>, Vec<f64>) {
    let p = x[0].len();
    let mut a = vec![vec![0.0; p]; p];
    let mut b = vec![0.0; p];

    for (row, yi) in x.iter().zip(y) {
        for i in 0..p {
            b[i] += row[i] * yi;
            for j in i..p {
                a[i][j] += row[i] * row[j];
            }
        }
    }

    for i in 0..p {
        for j in 0..i {
            a[i][j] = a[j][i];
        }
        a[i][i] += lambda;
    }

    (a, b)
}

/// Reduce `[A | b]` to `[I | β]` in place and return β.
fn gauss_jordan(a: &mut [Vec<f64>], b: &mut [f64]) -> Vec<f64> {
    let p = b.len();

    for col in 0..p {
        // Max-abs pivot; strict comparison keeps the earliest row on ties
        let mut pivot_row = col;
        for row in (col + 1)..p {
            if a[row][col].abs() > a[pivot_row][col].abs() {
                pivot_row = row;
            }
        }
        if pivot_row != col {
            a.swap(col, pivot_row);
            b.swap(col, pivot_row);
        }

        let mut pivot = a[col][col];
        if pivot.abs() < PIVOT_EPSILON {
            warn!(column = col, pivot, "near-singular pivot clamped");
            pivot = PIVOT_EPSILON;
            a[col][col] = pivot;
        }

        for j in col..p {
            a[col][j] /= pivot;
        }
        b[col] /= pivot;

        for row in 0..p {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            if factor == 0.0 {
                continue;
            }
            for j in col..p {
                a[row][j] -= factor * a[col][j];
            }
            b[row] -= factor * b[col];
        }
    }

    b.to_vec()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
