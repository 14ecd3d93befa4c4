//! Constrained mean-variance optimization.
//!
//! The max-Sharpe allocation is found with SQP from several starts; each
//! frontier point and the global minimum-variance portfolio are exact convex
//! QPs solved by the active-set method.

mod linalg;
mod qp;
mod sqp;

use crate::config::{SolverSettings, WeightBounds, WeightPolicy};
use crate::error::{AnalysisError, AnalysisResult};
use crate::metrics::{ZERO_VOLATILITY, covariance_times, metrics, portfolio_return, portfolio_volatility};
use crate::returns::ReturnStatistics;
use crate::sampler::generate_random_weights;
use qp::{QpProblem, solve_from};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::Serialize;
use sqp::{LinearConstraints, Objective, minimize};
use tracing::{debug, info, warn};

/// Candidates whose Sharpe ratios differ by less than this are tied.
const SHARPE_TIE_TOLERANCE: f64 = 1e-9;

/// Mixes the run seed into the restart stream so it differs from the sampler's.
const RESTART_SEED_SALT: u64 = 0x5DEE_CE66_D1CE_4E5B;

/// The maximum-Sharpe allocation.
#[derive(Clone, Debug, Serialize)]
pub struct OptimalPortfolio {
    pub weights: Vec<f64>,
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    /// SQP iterations used by the winning start.
    pub iterations: usize,
    pub starts_converged: usize,
    pub starts_attempted: usize,
}

/// The global minimum-variance allocation.
#[derive(Clone, Debug, Serialize)]
pub struct MinVariancePortfolio {
    pub weights: Vec<f64>,
    pub expected_return: f64,
    pub volatility: f64,
    /// `None` when the portfolio has zero volatility.
    pub sharpe_ratio: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct FrontierPoint {
    pub target_return: f64,
    /// Realized `w·μ`; equals the target up to solver tolerance.
    pub expected_return: f64,
    pub volatility: f64,
    pub weights: Vec<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SkippedTarget {
    pub target_return: f64,
    pub reason: String,
}

/// Frontier points ordered by target return, plus the targets that were skipped.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EfficientFrontier {
    pub points: Vec<FrontierPoint>,
    pub skipped: Vec<SkippedTarget>,
}

impl EfficientFrontier {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// `-(w·μ - rf) / σ(w)`.
struct NegativeSharpe<'a> {
    means: &'a [f64],
    covariance: &'a [Vec<f64>],
    risk_free_rate: f64,
}

impl Objective for NegativeSharpe<'_> {
    fn value(&self, x: &[f64]) -> AnalysisResult<f64> {
        Ok(-metrics(x, self.means, self.covariance, self.risk_free_rate)?.sharpe_ratio)
    }

    fn gradient(&self, x: &[f64]) -> AnalysisResult<Vec<f64>> {
        let vol = portfolio_volatility(x, self.covariance)?;
        if vol <= ZERO_VOLATILITY {
            return Err(AnalysisError::DivisionByZero {
                context: "Sharpe gradient at a zero-volatility allocation".to_string(),
            });
        }
        let excess = portfolio_return(x, self.means) - self.risk_free_rate;
        let sigma_w = covariance_times(x, self.covariance);
        let vol3 = vol * vol * vol;
        Ok(self
            .means
            .iter()
            .zip(sigma_w.iter())
            .map(|(mu, sw)| -(mu / vol - excess * sw / vol3))
            .collect())
    }
}

pub struct FrontierOptimizer<'a> {
    stats: &'a ReturnStatistics,
    risk_free_rate: f64,
    bounds: WeightBounds,
    settings: SolverSettings,
    seed: u64,
}

impl<'a> FrontierOptimizer<'a> {
    pub fn new(
        stats: &'a ReturnStatistics,
        risk_free_rate: f64,
        bounds: WeightBounds,
        settings: SolverSettings,
        seed: u64,
    ) -> Self {
        Self {
            stats,
            risk_free_rate,
            bounds,
            settings,
            seed,
        }
    }

    fn n(&self) -> usize {
        self.stats.num_assets()
    }

    fn equal_weights(&self) -> Vec<f64> {
        let n = self.n();
        vec![1.0 / n as f64; n]
    }

    fn check_ready(&self) -> AnalysisResult<()> {
        if self.n() == 0 {
            return Err(AnalysisError::InsufficientData("no assets to optimize".to_string()));
        }
        self.bounds.validate_for_assets(self.n())
    }

    /// Fully-invested portfolio with the lowest (or highest) return inside
    /// the bounds: start every asset at the lower bound, then fill the
    /// remaining budget in order of mean return.
    fn extreme_portfolio(&self, highest: bool) -> Vec<f64> {
        let n = self.n();
        let means = &self.stats.mean_returns;
        let mut order: Vec<usize> = (0..n).collect();
        if highest {
            order.sort_by(|&a, &b| means[b].total_cmp(&means[a]));
        } else {
            order.sort_by(|&a, &b| means[a].total_cmp(&means[b]));
        }

        let mut weights = self.bounds.lower_vec(n);
        let mut remaining = 1.0 - weights.iter().sum::<f64>();
        let room = self.bounds.upper - self.bounds.lower;
        for i in order {
            if remaining <= 0.0 {
                break;
            }
            let add = room.min(remaining);
            weights[i] += add;
            remaining -= add;
        }
        weights
    }

    /// Lowest and highest portfolio return attainable within the bounds.
    pub fn return_range(&self) -> (f64, f64) {
        let means = &self.stats.mean_returns;
        (
            portfolio_return(&self.extreme_portfolio(false), means),
            portfolio_return(&self.extreme_portfolio(true), means),
        )
    }

    /// `points` targets evenly spaced from the lowest to the highest asset mean.
    pub fn target_returns(&self, points: usize) -> Vec<f64> {
        let means = &self.stats.mean_returns;
        if points == 0 || means.is_empty() {
            return Vec::new();
        }
        let lo = means.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = means.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if points == 1 {
            return vec![lo];
        }
        let step = (hi - lo) / (points - 1) as f64;
        (0..points)
            .map(|k| if k == points - 1 { hi } else { lo + step * k as f64 })
            .collect()
    }

    fn variance_hessian(&self) -> Vec<Vec<f64>> {
        self.stats
            .covariance
            .iter()
            .map(|row| row.iter().map(|c| 2.0 * c).collect())
            .collect()
    }

    /// Clamps solver round-off back into the box.
    fn clean_weights(&self, weights: Vec<f64>) -> Vec<f64> {
        weights
            .into_iter()
            .map(|w| w.clamp(self.bounds.lower, self.bounds.upper))
            .collect()
    }

    /// Minimum-volatility portfolio with `w·μ = target`.
    pub fn min_volatility_for_return(&self, target: f64) -> AnalysisResult<FrontierPoint> {
        self.check_ready()?;
        let n = self.n();
        let means = &self.stats.mean_returns;

        let (min_ret, max_ret) = self.return_range();
        let slack = 1e-9 * (1.0 + min_ret.abs().max(max_ret.abs()));
        if !target.is_finite() || target < min_ret - slack || target > max_ret + slack {
            return Err(AnalysisError::Infeasible {
                target,
                min: min_ret,
                max: max_ret,
            });
        }

        // A feasible start on the segment between the two extreme portfolios.
        let low = self.extreme_portfolio(false);
        let high = self.extreme_portfolio(true);
        let t = if max_ret - min_ret > f64::EPSILON {
            ((target - min_ret) / (max_ret - min_ret)).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let x0: Vec<f64> = low.iter().zip(&high).map(|(a, b)| (1.0 - t) * a + t * b).collect();

        let hessian = self.variance_hessian();
        let linear = vec![0.0; n];
        let eq_matrix = vec![vec![1.0; n], means.clone()];
        let lower = self.bounds.lower_vec(n);
        let upper = self.bounds.upper_vec(n);
        let problem = QpProblem {
            hessian: &hessian,
            linear: &linear,
            eq_matrix: &eq_matrix,
            lower: &lower,
            upper: &upper,
        };

        let solution = solve_from(&problem, x0, self.settings.max_iterations, self.settings.tolerance)?;
        debug!("Frontier target {:.6} solved in {} iterations", target, solution.iterations);
        let weights = self.clean_weights(solution.x);
        let volatility = portfolio_volatility(&weights, &self.stats.covariance)?;

        Ok(FrontierPoint {
            target_return: target,
            expected_return: portfolio_return(&weights, means),
            volatility,
            weights,
        })
    }

    /// Global minimum-variance portfolio within the bounds.
    pub fn min_variance(&self) -> AnalysisResult<MinVariancePortfolio> {
        self.check_ready()?;
        let n = self.n();
        let hessian = self.variance_hessian();
        let linear = vec![0.0; n];
        let eq_matrix = vec![vec![1.0; n]];
        let lower = self.bounds.lower_vec(n);
        let upper = self.bounds.upper_vec(n);
        let problem = QpProblem {
            hessian: &hessian,
            linear: &linear,
            eq_matrix: &eq_matrix,
            lower: &lower,
            upper: &upper,
        };

        let solution = solve_from(
            &problem,
            self.equal_weights(),
            self.settings.max_iterations,
            self.settings.tolerance,
        )?;
        debug!("Minimum-variance QP solved in {} iterations", solution.iterations);
        let weights = self.clean_weights(solution.x);
        let volatility = portfolio_volatility(&weights, &self.stats.covariance)?;
        let expected_return = portfolio_return(&weights, &self.stats.mean_returns);
        let sharpe_ratio = (volatility > ZERO_VOLATILITY)
            .then(|| (expected_return - self.risk_free_rate) / volatility);

        info!(
            "Minimum-variance portfolio: E[r]={:.4}, σ={:.4}",
            expected_return, volatility
        );
        Ok(MinVariancePortfolio {
            weights,
            expected_return,
            volatility,
            sharpe_ratio,
        })
    }

    /// Equal weights, then `restarts` seeded random points pulled toward
    /// equal weights just far enough to sit inside the bounds.
    fn starting_points(&self) -> Vec<Vec<f64>> {
        let n = self.n();
        let center = self.equal_weights();
        let mut starts = vec![center.clone()];
        if n == 1 {
            return starts;
        }

        let mut rng = StdRng::seed_from_u64(self.seed ^ RESTART_SEED_SALT);
        for _ in 0..self.settings.restarts {
            let raw = generate_random_weights(n, WeightPolicy::FlatDirichlet, &mut rng);
            let mut lambda: f64 = 1.0;
            for (r, c) in raw.iter().zip(&center) {
                let d = r - c;
                if d > 0.0 {
                    lambda = lambda.min((self.bounds.upper - c) / d);
                } else if d < 0.0 {
                    lambda = lambda.min((self.bounds.lower - c) / d);
                }
            }
            let lambda = lambda.max(0.0);
            starts.push(center.iter().zip(&raw).map(|(c, r)| c + lambda * (r - c)).collect());
        }
        starts
    }

    /// Maximum-Sharpe portfolio within the bounds.
    ///
    /// Fails only when every start fails; the first start's error is returned.
    pub fn max_sharpe(&self) -> AnalysisResult<OptimalPortfolio> {
        self.check_ready()?;
        let n = self.n();
        let means = &self.stats.mean_returns;
        let cov = &self.stats.covariance;

        info!("Optimizing portfolio with {} assets...", n);

        if n == 1 {
            let m = metrics(&[1.0], means, cov, self.risk_free_rate)?;
            return Ok(OptimalPortfolio {
                weights: vec![1.0],
                expected_return: m.expected_return,
                volatility: m.volatility,
                sharpe_ratio: m.sharpe_ratio,
                iterations: 0,
                starts_converged: 1,
                starts_attempted: 1,
            });
        }

        let objective = NegativeSharpe {
            means,
            covariance: cov,
            risk_free_rate: self.risk_free_rate,
        };
        let constraints = LinearConstraints {
            eq_matrix: vec![vec![1.0; n]],
            lower: self.bounds.lower_vec(n),
            upper: self.bounds.upper_vec(n),
        };

        let starts = self.starting_points();
        let attempted = starts.len();
        let outcomes: Vec<AnalysisResult<(Vec<f64>, usize)>> = starts
            .into_par_iter()
            .map(|x0| {
                let outcome = minimize(&objective, &constraints, x0, &self.settings)?;
                Ok((self.clean_weights(outcome.x), outcome.iterations))
            })
            .collect();

        let mut best: Option<OptimalPortfolio> = None;
        let mut first_error: Option<AnalysisError> = None;
        let mut converged = 0;
        for (index, outcome) in outcomes.into_iter().enumerate() {
            let candidate = outcome.and_then(|(weights, iterations)| {
                let m = metrics(&weights, means, cov, self.risk_free_rate)?;
                Ok(OptimalPortfolio {
                    weights,
                    expected_return: m.expected_return,
                    volatility: m.volatility,
                    sharpe_ratio: m.sharpe_ratio,
                    iterations,
                    starts_converged: 0,
                    starts_attempted: attempted,
                })
            });
            match candidate {
                Ok(candidate) => {
                    converged += 1;
                    debug!(
                        "Start {} converged: Sharpe={:.6}, σ={:.6} after {} iterations",
                        index, candidate.sharpe_ratio, candidate.volatility, candidate.iterations
                    );
                    if best.as_ref().is_none_or(|b| beats(&candidate, b)) {
                        best = Some(candidate);
                    }
                }
                Err(e @ AnalysisError::Numerical(_)) => return Err(e),
                Err(e) => {
                    warn!("Max-Sharpe start {} failed: {}", index, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match best {
            Some(mut optimal) => {
                optimal.starts_converged = converged;
                info!(
                    "Optimal portfolio: Sharpe={:.3}, E[r]={:.4}, σ={:.4} ({}/{} starts converged)",
                    optimal.sharpe_ratio, optimal.expected_return, optimal.volatility, converged, attempted
                );
                Ok(optimal)
            }
            None => Err(first_error.unwrap_or(AnalysisError::DidNotConverge {
                context: "max-Sharpe optimization".to_string(),
                iterations: self.settings.max_iterations,
            })),
        }
    }

    /// Minimum-volatility portfolios for `points` evenly spaced target returns.
    ///
    /// Unreachable or non-converging targets are skipped with a warning;
    /// a numerical failure aborts the sweep.
    pub fn efficient_frontier(&self, points: usize) -> AnalysisResult<EfficientFrontier> {
        let targets = self.target_returns(points);
        info!("Sweeping efficient frontier over {} target returns...", targets.len());

        let solved: Vec<(f64, AnalysisResult<FrontierPoint>)> = targets
            .par_iter()
            .map(|&target| (target, self.min_volatility_for_return(target)))
            .collect();

        let mut frontier = EfficientFrontier::default();
        for (target, result) in solved {
            match result {
                Ok(point) => frontier.points.push(point),
                Err(e) if e.is_recoverable_for_frontier() => {
                    warn!("Skipping frontier target {:.6}: {}", target, e);
                    frontier.skipped.push(SkippedTarget {
                        target_return: target,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Efficient frontier: {} points, {} skipped",
            frontier.points.len(),
            frontier.skipped.len()
        );
        Ok(frontier)
    }
}

/// Higher Sharpe wins; near-ties go to the lower volatility, then the earlier start.
fn beats(candidate: &OptimalPortfolio, incumbent: &OptimalPortfolio) -> bool {
    let diff = candidate.sharpe_ratio - incumbent.sharpe_ratio;
    if diff.abs() <= SHARPE_TIE_TOLERANCE {
        candidate.volatility < incumbent.volatility
    } else {
        diff > 0.0
    }
}
