//! Primal active-set solver for convex quadratic programs
//!
//! ```text
//! minimize    ½ xᵀ H x + cᵀ x
//! subject to  A x = b,   lower ≤ x ≤ upper
//! ```
//!
//! The solver starts from a feasible point and never leaves the feasible
//! set: every step keeps `A p = 0` and is cut short at the first bound it
//! would cross.

use super::linalg::{RowBasis, dot, norm_inf, rank, row_space_basis, solve};
use crate::error::{AnalysisError, AnalysisResult};
use nalgebra::{DMatrix, DVector};

/// Tolerance for treating a coordinate as sitting on its bound.
const BOUND_EPS: f64 = 1e-12;
/// Relative residual below which an equality row counts as dependent.
/// Shared by the working-set rank check and the KKT basis.
const RANK_TOL: f64 = 1e-8;

pub struct QpProblem<'a> {
    pub hessian: &'a [Vec<f64>],
    pub linear: &'a [f64],
    pub eq_matrix: &'a [Vec<f64>],
    pub lower: &'a [f64],
    pub upper: &'a [f64],
}

#[derive(Clone, Debug)]
pub struct QpSolution {
    pub x: Vec<f64>,
    pub iterations: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Bound {
    Free,
    Lower,
    Upper,
}

/// Solves `problem` starting from the feasible point `x0`.
///
/// Equality rows enter only through their row space, so nearly parallel
/// rows (a budget row and near-identical means) stay well conditioned.
pub fn solve_from(
    problem: &QpProblem,
    x0: Vec<f64>,
    max_iterations: usize,
    tolerance: f64,
) -> AnalysisResult<QpSolution> {
    let n = x0.len();
    if problem.hessian.len() != n
        || problem.linear.len() != n
        || problem.lower.len() != n
        || problem.upper.len() != n
        || problem.eq_matrix.iter().any(|row| row.len() != n)
    {
        return Err(AnalysisError::invalid_input("qp", "problem dimensions do not match the start point"));
    }

    let eq_rows: Vec<&Vec<f64>> = problem.eq_matrix.iter().collect();
    let m = rank(&eq_rows, RANK_TOL);

    let max_diag = (0..n).fold(0.0f64, |acc, i| acc.max(problem.hessian[i][i].abs()));
    let reg = 1e-12 * (1.0 + max_diag);

    let mut x = x0;
    let mut state = vec![Bound::Free; n];

    // Seed the working set with bounds active at x0 while the equality rows
    // keep full rank on the free coordinates.
    for i in 0..n {
        let side = if x[i] <= problem.lower[i] + BOUND_EPS {
            Bound::Lower
        } else if x[i] >= problem.upper[i] - BOUND_EPS {
            Bound::Upper
        } else {
            continue;
        };
        state[i] = side;
        if row_space_basis(&eq_rows, &free_indices(&state), RANK_TOL).rank() < m {
            state[i] = Bound::Free;
        } else {
            x[i] = if side == Bound::Lower { problem.lower[i] } else { problem.upper[i] };
        }
    }

    // Once a step stalls on a degenerate vertex, release the lowest-index
    // violated bound (Bland's rule) until a step makes progress again.
    let mut degenerate = false;

    for iteration in 1..=max_iterations {
        let gradient: Vec<f64> = (0..n)
            .map(|i| dot(&problem.hessian[i], &x) + problem.linear[i])
            .collect();

        let free = free_indices(&state);
        let basis = row_space_basis(&eq_rows, &free, RANK_TOL);
        let (step_free, nu) =
            solve_equality_subproblem(problem, &basis, &free, &gradient, reg).ok_or_else(|| {
                AnalysisError::DidNotConverge {
                    context: "singular KKT system in quadratic subproblem".to_string(),
                    iterations: iteration,
                }
            })?;

        let mut step = vec![0.0; n];
        for (k, &i) in free.iter().enumerate() {
            step[i] = step_free[k];
        }

        if norm_inf(&step) <= tolerance * (1.0 + norm_inf(&x)) {
            // Stationary on the working set: check bound multipliers.
            let mut worst: Option<(usize, f64)> = None;
            let mult_tol = tolerance * (1.0 + norm_inf(&gradient));
            for i in 0..n {
                if state[i] == Bound::Free || problem.upper[i] - problem.lower[i] <= BOUND_EPS {
                    continue;
                }
                let residual = gradient[i]
                    + basis.full.iter().zip(nu.iter()).map(|(row, v)| row[i] * v).sum::<f64>();
                let multiplier = if state[i] == Bound::Lower { residual } else { -residual };
                if multiplier >= -mult_tol {
                    continue;
                }
                if degenerate {
                    worst = Some((i, multiplier));
                    break;
                }
                if worst.is_none_or(|(_, w)| multiplier < w) {
                    worst = Some((i, multiplier));
                }
            }
            match worst {
                Some((i, _)) => state[i] = Bound::Free,
                None => return Ok(QpSolution { x, iterations: iteration }),
            }
            continue;
        }

        let mut alpha = 1.0;
        let mut blocking: Option<(usize, Bound)> = None;
        for &i in &free {
            let p = step[i];
            if p < 0.0 {
                let t = (problem.lower[i] - x[i]) / p;
                if t < alpha {
                    alpha = t;
                    blocking = Some((i, Bound::Lower));
                }
            } else if p > 0.0 {
                let t = (problem.upper[i] - x[i]) / p;
                if t < alpha {
                    alpha = t;
                    blocking = Some((i, Bound::Upper));
                }
            }
        }
        let alpha = alpha.max(0.0);
        degenerate = alpha == 0.0;

        for (xi, p) in x.iter_mut().zip(step.iter()) {
            *xi += alpha * p;
        }
        if let Some((i, side)) = blocking {
            state[i] = side;
            x[i] = if side == Bound::Lower { problem.lower[i] } else { problem.upper[i] };
        }
    }

    Err(AnalysisError::DidNotConverge {
        context: "active-set quadratic program".to_string(),
        iterations: max_iterations,
    })
}

fn free_indices(state: &[Bound]) -> Vec<usize> {
    (0..state.len()).filter(|&i| state[i] == Bound::Free).collect()
}

/// Solves the KKT system on the free coordinates, with `Q_F` the orthonormal
/// row-space basis of the equality rows restricted to them:
///
/// ```text
/// [ H_FF + reg·I   Q_Fᵀ ] [ p_F ]   [ -g_F ]
/// [ Q_F            0    ] [ ν   ] = [  0   ]
/// ```
///
/// `ν` pairs with `basis.full`. Returns `None` when the system is singular.
fn solve_equality_subproblem(
    problem: &QpProblem,
    basis: &RowBasis,
    free: &[usize],
    gradient: &[f64],
    reg: f64,
) -> Option<(Vec<f64>, Vec<f64>)> {
    let nf = free.len();
    let k = basis.rank();
    let size = nf + k;

    let mut kkt = DMatrix::<f64>::zeros(size, size);
    let mut rhs = DVector::<f64>::zeros(size);
    for (a, &i) in free.iter().enumerate() {
        for (b, &j) in free.iter().enumerate() {
            kkt[(a, b)] = problem.hessian[i][j];
        }
        kkt[(a, a)] += reg;
        rhs[a] = -gradient[i];
    }
    for (r, row) in basis.restricted.iter().enumerate() {
        for (a, &v) in row.iter().enumerate() {
            kkt[(a, nf + r)] = v;
            kkt[(nf + r, a)] = v;
        }
    }

    let solution = solve(kkt, rhs)?;
    let step = solution.rows(0, nf).iter().copied().collect();
    let nu = solution.rows(nf, k).iter().copied().collect();
    Some((step, nu))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconstrained_interior_minimum() {
        // min (x0 - 0.3)² + (x1 - 0.7)² s.t. x0 + x1 = 1 → (0.3, 0.7)
        let h = vec![vec![2.0, 0.0], vec![0.0, 2.0]];
        let c = vec![-0.6, -1.4];
        let a = vec![vec![1.0, 1.0]];
        let problem = QpProblem {
            hessian: &h,
            linear: &c,
            eq_matrix: &a,
            lower: &[0.0, 0.0],
            upper: &[1.0, 1.0],
        };
        let sol = solve_from(&problem, vec![0.5, 0.5], 50, 1e-12).unwrap();
        assert!((sol.x[0] - 0.3).abs() < 1e-9);
        assert!((sol.x[1] - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_bound_becomes_active() {
        // Unconstrained optimum (-0.2, 1.2) is outside the box; answer is (0, 1).
        let h = vec![vec![2.0, 0.0], vec![0.0, 2.0]];
        let c = vec![0.4, -2.4];
        let a = vec![vec![1.0, 1.0]];
        let problem = QpProblem {
            hessian: &h,
            linear: &c,
            eq_matrix: &a,
            lower: &[0.0, 0.0],
            upper: &[1.0, 1.0],
        };
        let sol = solve_from(&problem, vec![0.5, 0.5], 50, 1e-12).unwrap();
        assert!(sol.x[0].abs() < 1e-12);
        assert!((sol.x[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_bound_released_from_corner_start() {
        // Start at a vertex; the optimum is interior.
        let h = vec![vec![2.0, 0.0, 0.0], vec![0.0, 2.0, 0.0], vec![0.0, 0.0, 2.0]];
        let c = vec![0.0, 0.0, 0.0];
        let a = vec![vec![1.0, 1.0, 1.0]];
        let problem = QpProblem {
            hessian: &h,
            linear: &c,
            eq_matrix: &a,
            lower: &[0.0; 3],
            upper: &[1.0; 3],
        };
        let sol = solve_from(&problem, vec![1.0, 0.0, 0.0], 50, 1e-12).unwrap();
        for xi in &sol.x {
            assert!((xi - 1.0 / 3.0).abs() < 1e-9, "got {:?}", sol.x);
        }
    }

    #[test]
    fn test_nearly_parallel_equality_rows() {
        // Budget row plus means that differ only in the eighth decimal.
        let h = vec![
            vec![0.08, 0.012, 0.008],
            vec![0.012, 0.18, 0.04],
            vec![0.008, 0.04, 0.32],
        ];
        let c = vec![0.0; 3];
        let means = vec![0.1, 0.1 + 1e-8, 0.1 - 1e-8];
        let a = vec![vec![1.0; 3], means.clone()];
        let problem = QpProblem {
            hessian: &h,
            linear: &c,
            eq_matrix: &a,
            lower: &[0.0; 3],
            upper: &[1.0; 3],
        };
        for x0 in [vec![0.5, 0.25, 0.25], vec![0.0, 0.5, 0.5], vec![1.0, 0.0, 0.0]] {
            let target = dot(&means, &x0);
            let sol = solve_from(&problem, x0, 50, 1e-10).unwrap();
            assert!((sol.x.iter().sum::<f64>() - 1.0).abs() < 1e-10, "got {:?}", sol.x);
            assert!(sol.x.iter().all(|&w| (-1e-12..=1.0 + 1e-12).contains(&w)));
            assert!((dot(&means, &sol.x) - target).abs() < 1e-7);
        }
    }

    #[test]
    fn test_iteration_budget_exhausted() {
        let h = vec![vec![2.0, 0.0, 0.0], vec![0.0, 2.0, 0.0], vec![0.0, 0.0, 2.0]];
        let c = vec![0.0; 3];
        let a = vec![vec![1.0, 1.0, 1.0]];
        let problem = QpProblem {
            hessian: &h,
            linear: &c,
            eq_matrix: &a,
            lower: &[0.0; 3],
            upper: &[1.0; 3],
        };
        let result = solve_from(&problem, vec![1.0, 0.0, 0.0], 1, 1e-12);
        assert!(matches!(result, Err(AnalysisError::DidNotConverge { .. })));
    }
}
