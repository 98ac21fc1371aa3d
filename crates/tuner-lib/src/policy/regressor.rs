//! Per-action ridge regression scorer
//!
//! Each action keeps the sufficient statistics of a ridge regression
//! (`A = λI + Σ x xᵀ`, `b = Σ y x`). Prediction solves `A θ = b` on demand,
//! which keeps the persisted state exact and free of learning-rate drift.

use serde::{Deserialize, Serialize};

/// Pivots smaller than this are treated as singular
const PIVOT_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidgeRegressor {
    dim: usize,
    /// Row-major `dim x dim` Gram matrix including the ridge prior
    gram: Vec<f64>,
    moment: Vec<f64>,
    updates: u64,
}

impl RidgeRegressor {
    pub fn new(dim: usize, lambda: f64) -> Self {
        let mut gram = vec![0.0; dim * dim];
        for i in 0..dim {
            gram[i * dim + i] = lambda;
        }
        Self {
            dim,
            gram,
            moment: vec![0.0; dim],
            updates: 0,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Predicted target for feature vector `x`
    pub fn predict(&self, x: &[f64]) -> f64 {
        let theta = self.weights();
        dot(&theta, x)
    }

    /// Current least-squares weights
    pub fn weights(&self) -> Vec<f64> {
        solve(&self.gram, &self.moment, self.dim)
    }

    /// Add one `(x, target)` pair to the sufficient statistics
    pub fn update(&mut self, x: &[f64], target: f64) {
        debug_assert_eq!(x.len(), self.dim);
        for i in 0..self.dim {
            for j in 0..self.dim {
                self.gram[i * self.dim + j] += x[i] * x[j];
            }
            self.moment[i] += target * x[i];
        }
        self.updates += 1;
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Solve `a x = b` by Gaussian elimination with partial pivoting
fn solve(a: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    // augmented n x (n + 1)
    let mut m: Vec<Vec<f64>> = (0..n)
        .map(|i| {
            let mut row = a[i * n..(i + 1) * n].to_vec();
            row.push(b[i]);
            row
        })
        .collect();

    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&r1, &r2| m[r1][col].abs().total_cmp(&m[r2][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot);

        let div = m[col][col];
        if div.abs() < PIVOT_EPSILON {
            continue;
        }
        for c in col..=n {
            m[col][c] /= div;
        }
        for r in 0..n {
            if r == col {
                continue;
            }
            let f = m[r][col];
            if f == 0.0 {
                continue;
            }
            for c in col..=n {
                m[r][c] -= f * m[col][c];
            }
        }
    }

    (0..n)
        .map(|i| if m[i][i].abs() < PIVOT_EPSILON { 0.0 } else { m[i][n] })
        .collect()
}
