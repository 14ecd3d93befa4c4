//! Sequential quadratic programming for smooth objectives under linear
//! equality and box constraints.
//!
//! Each iteration solves a quadratic model of the objective with the
//! active-set solver, then backtracks along the resulting direction. The
//! model Hessian is a Powell-damped BFGS approximation, so it stays positive
//! definite even where the objective is not convex.

use super::linalg::{dot, identity, mat_vec, norm_inf};
use super::qp::{QpProblem, solve_from};
use crate::config::SolverSettings;
use crate::error::{AnalysisError, AnalysisResult};
use tracing::trace;

const ARMIJO_C1: f64 = 1e-4;
const MIN_STEP: f64 = 1e-12;

/// A smooth function of the weights. Errors from evaluation propagate.
pub trait Objective: Sync {
    fn value(&self, x: &[f64]) -> AnalysisResult<f64>;
    fn gradient(&self, x: &[f64]) -> AnalysisResult<Vec<f64>>;
}

/// `A x = b` plus per-coordinate bounds.
#[derive(Clone, Debug)]
pub struct LinearConstraints {
    pub eq_matrix: Vec<Vec<f64>>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

#[derive(Clone, Debug)]
pub struct SqpOutcome {
    pub x: Vec<f64>,
    pub value: f64,
    pub iterations: usize,
}

/// Iteration budget for one quadratic subproblem.
fn subproblem_budget(settings: &SolverSettings, n: usize) -> usize {
    settings.max_iterations.max(4 * n + 10)
}

/// Minimizes `objective` from the feasible start `x0`.
///
/// Fails with `DidNotConverge` when the iteration budget runs out or the line
/// search cannot make progress along a descent direction.
pub fn minimize<O: Objective>(
    objective: &O,
    constraints: &LinearConstraints,
    x0: Vec<f64>,
    settings: &SolverSettings,
) -> AnalysisResult<SqpOutcome> {
    let n = x0.len();
    let tol = settings.tolerance;
    let qp_budget = subproblem_budget(settings, n);

    let mut x = x0;
    let mut f = objective.value(&x)?;
    let mut g = objective.gradient(&x)?;
    let mut hessian = identity(n);

    for iteration in 1..=settings.max_iterations {
        let lower_d: Vec<f64> = x.iter().zip(&constraints.lower).map(|(xi, l)| (l - xi).min(0.0)).collect();
        let upper_d: Vec<f64> = x.iter().zip(&constraints.upper).map(|(xi, u)| (u - xi).max(0.0)).collect();

        let subproblem = QpProblem {
            hessian: &hessian,
            linear: &g,
            eq_matrix: &constraints.eq_matrix,
            lower: &lower_d,
            upper: &upper_d,
        };
        let direction = solve_from(&subproblem, vec![0.0; n], qp_budget, tol)?.x;

        if norm_inf(&direction) <= tol * (1.0 + norm_inf(&x)) {
            return Ok(SqpOutcome { x, value: f, iterations: iteration });
        }
        let slope = dot(&g, &direction);
        if slope >= 0.0 {
            // Model and gradient disagree only at a stationary point.
            return Ok(SqpOutcome { x, value: f, iterations: iteration });
        }

        let mut alpha = 1.0;
        let accepted = loop {
            let candidate = step(&x, &direction, alpha, constraints);
            // A failed evaluation (e.g. zero volatility) counts as no decrease.
            if let Ok(value) = objective.value(&candidate) {
                if value <= f + ARMIJO_C1 * alpha * slope {
                    break Some((candidate, value));
                }
            }
            alpha *= 0.5;
            if alpha < MIN_STEP {
                break None;
            }
        };

        let Some((x_new, f_new)) = accepted else {
            if slope.abs() <= tol.sqrt() * (1.0 + f.abs()) {
                return Ok(SqpOutcome { x, value: f, iterations: iteration });
            }
            return Err(AnalysisError::DidNotConverge {
                context: "line search found no decrease".to_string(),
                iterations: iteration,
            });
        };

        let g_new = objective.gradient(&x_new)?;
        let s: Vec<f64> = x_new.iter().zip(&x).map(|(a, b)| a - b).collect();
        let y: Vec<f64> = g_new.iter().zip(&g).map(|(a, b)| a - b).collect();
        damped_bfgs_update(&mut hessian, &s, &y);

        let improvement = f - f_new;
        trace!(iteration, f = f_new, alpha, "sqp step");
        x = x_new;
        f = f_new;
        g = g_new;

        if improvement.abs() <= tol * (1.0 + f.abs()) {
            return Ok(SqpOutcome { x, value: f, iterations: iteration });
        }
    }

    Err(AnalysisError::DidNotConverge {
        context: "sequential quadratic programming".to_string(),
        iterations: settings.max_iterations,
    })
}

fn step(x: &[f64], direction: &[f64], alpha: f64, constraints: &LinearConstraints) -> Vec<f64> {
    x.iter()
        .zip(direction)
        .enumerate()
        .map(|(i, (xi, di))| (xi + alpha * di).clamp(constraints.lower[i], constraints.upper[i]))
        .collect()
}

/// BFGS with Powell damping: `y` is blended toward `B s` whenever the
/// curvature `sᵀy` is too small, keeping `B` positive definite.
fn damped_bfgs_update(hessian: &mut [Vec<f64>], s: &[f64], y: &[f64]) {
    let bs = mat_vec(hessian, s);
    let sbs = dot(s, &bs);
    if sbs <= f64::EPSILON * dot(s, s) {
        return;
    }
    let sy = dot(s, y);
    let theta = if sy >= 0.2 * sbs { 1.0 } else { 0.8 * sbs / (sbs - sy) };
    let r: Vec<f64> = y.iter().zip(&bs).map(|(yi, bi)| theta * yi + (1.0 - theta) * bi).collect();
    let sr = dot(s, &r);
    if sr <= 0.0 {
        return;
    }
    for i in 0..s.len() {
        for j in 0..s.len() {
            hessian[i][j] += r[i] * r[j] / sr - bs[i] * bs[j] / sbs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rosenbrock-like valley restricted to the simplex.
    struct Quartic;

    impl Objective for Quartic {
        fn value(&self, x: &[f64]) -> AnalysisResult<f64> {
            Ok((x[0] - 0.6).powi(4) + (x[1] - 0.4).powi(2) + 0.1 * x[2] * x[2])
        }
        fn gradient(&self, x: &[f64]) -> AnalysisResult<Vec<f64>> {
            Ok(vec![4.0 * (x[0] - 0.6).powi(3), 2.0 * (x[1] - 0.4), 0.2 * x[2]])
        }
    }

    fn simplex(n: usize) -> LinearConstraints {
        LinearConstraints {
            eq_matrix: vec![vec![1.0; n]],
            lower: vec![0.0; n],
            upper: vec![1.0; n],
        }
    }

    #[test]
    fn test_minimize_nonquadratic_on_simplex() {
        let settings = SolverSettings::default();
        let out = minimize(&Quartic, &simplex(3), vec![1.0 / 3.0; 3], &settings).unwrap();
        let sum: f64 = out.x.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(out.x.iter().all(|&v| (0.0..=1.0).contains(&v)));
        // The unconstrained minimizer (0.6, 0.4, 0) already lies on the simplex.
        assert!(out.value < 1e-6, "value {} at {:?}", out.value, out.x);
        assert!((out.x[1] - 0.4).abs() < 1e-2);
    }

    struct Linear(Vec<f64>);

    impl Objective for Linear {
        fn value(&self, x: &[f64]) -> AnalysisResult<f64> {
            Ok(dot(&self.0, x))
        }
        fn gradient(&self, _x: &[f64]) -> AnalysisResult<Vec<f64>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_linear_objective_reaches_vertex() {
        let settings = SolverSettings::default();
        let out = minimize(&Linear(vec![0.3, -0.2, 0.1]), &simplex(3), vec![1.0 / 3.0; 3], &settings).unwrap();
        assert!((out.x[1] - 1.0).abs() < 1e-9, "got {:?}", out.x);
    }

    #[test]
    fn test_damped_update_keeps_positive_definite() {
        let mut b = identity(2);
        // Negative curvature pair.
        damped_bfgs_update(&mut b, &[1.0, 0.0], &[-1.0, 0.0]);
        let det = b[0][0] * b[1][1] - b[0][1] * b[1][0];
        assert!(b[0][0] > 0.0 && det > 0.0);
    }
}
