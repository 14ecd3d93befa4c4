//! Dense helpers for the optimizer. Weights and gradients stay as slices;
//! factorizations go through `nalgebra`.

use nalgebra::{DMatrix, DVector};

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn mat_vec(mat: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    mat.iter().map(|row| dot(row, v)).collect()
}

pub fn norm_inf(v: &[f64]) -> f64 {
    v.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}

pub fn identity(n: usize) -> Vec<Vec<f64>> {
    (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect()
}

/// Solves the square system `a x = b` by LU with partial pivoting.
///
/// Returns `None` for a singular or non-finite system.
pub fn solve(a: DMatrix<f64>, b: DVector<f64>) -> Option<DVector<f64>> {
    if !a.is_square() || a.nrows() != b.len() {
        return None;
    }
    let x = a.lu().solve(&b)?;
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Orthonormal basis for the row space of `rows` restricted to `columns`.
///
/// Rows are taken in order and a row is kept only when its component
/// outside the span of the rows already kept exceeds `tol` times its own
/// norm (the trailing diagonal of a Householder QR). The first kept row is
/// therefore enforced exactly, and a nearly parallel later row becomes a
/// well-conditioned unit direction instead of a tiny pivot.
///
/// `restricted` holds the basis on `columns`; `full` holds the same
/// combinations of the input rows over every coordinate.
#[derive(Clone, Debug, Default)]
pub struct RowBasis {
    pub restricted: Vec<Vec<f64>>,
    pub full: Vec<Vec<f64>>,
}

impl RowBasis {
    pub fn rank(&self) -> usize {
        self.restricted.len()
    }
}

pub fn row_space_basis(rows: &[&Vec<f64>], columns: &[usize], tol: f64) -> RowBasis {
    let nc = columns.len();
    if rows.is_empty() || nc == 0 {
        return RowBasis::default();
    }
    let on_columns = |row: &Vec<f64>| DVector::from_iterator(nc, columns.iter().map(|&c| row[c]));

    let mut kept: Vec<usize> = Vec::new();
    for (idx, row) in rows.iter().enumerate() {
        let candidate = on_columns(row);
        let norm = candidate.norm();
        if norm == 0.0 || !norm.is_finite() || kept.len() == nc {
            continue;
        }
        let mut stacked: Vec<DVector<f64>> = kept.iter().map(|&k| on_columns(rows[k])).collect();
        stacked.push(candidate);
        let last = stacked.len() - 1;
        let r = DMatrix::from_columns(&stacked).qr().r();
        if r[(last, last)].abs() > tol * norm {
            kept.push(idx);
        }
    }
    if kept.is_empty() {
        return RowBasis::default();
    }

    // A_Kᵀ = Q R on the columns; the basis is Qᵀ = R⁻ᵀ A_K.
    let transposed = DMatrix::from_columns(&kept.iter().map(|&k| on_columns(rows[k])).collect::<Vec<_>>());
    let qr = transposed.qr();
    let q = qr.q();
    let r_t = qr.r().transpose();
    let width = rows[0].len();
    let a_full = DMatrix::from_fn(kept.len(), width, |i, j| rows[kept[i]][j]);
    let Some(full) = r_t.solve_lower_triangular(&a_full) else {
        return RowBasis::default();
    };

    RowBasis {
        restricted: (0..kept.len()).map(|i| q.column(i).iter().copied().collect()).collect(),
        full: (0..kept.len()).map(|i| full.row(i).iter().copied().collect()).collect(),
    }
}

/// Numerical rank of `rows`.
pub fn rank(rows: &[&Vec<f64>], tol: f64) -> usize {
    let width = rows.first().map_or(0, |r| r.len());
    let columns: Vec<usize> = (0..width).collect();
    row_space_basis(rows, &columns, tol).rank()
}
