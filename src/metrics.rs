use crate::error::{AnalysisError, AnalysisResult};
use serde::Serialize;

/// Portfolio variance below `-NEGATIVE_VARIANCE_TOLERANCE` means the covariance is not PSD.
pub const NEGATIVE_VARIANCE_TOLERANCE: f64 = 1e-10;

/// Volatility at or below this is treated as zero.
pub const ZERO_VOLATILITY: f64 = 1e-10;

/// Annualized performance of one weight vector.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PortfolioMetrics {
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
}

pub fn portfolio_return(weights: &[f64], means: &[f64]) -> f64 {
    weights.iter().zip(means.iter()).map(|(w, r)| w * r).sum()
}

pub fn portfolio_variance(weights: &[f64], cov: &[Vec<f64>]) -> f64 {
    let n = weights.len();
    let mut var = 0.0;
    for i in 0..n {
        for j in 0..n {
            var += weights[i] * weights[j] * cov[i][j];
        }
    }
    var
}

/// `sqrt(wᵀ Σ w)`, clamping round-off negatives to zero.
pub fn portfolio_volatility(weights: &[f64], cov: &[Vec<f64>]) -> AnalysisResult<f64> {
    let variance = portfolio_variance(weights, cov);
    if variance.is_nan() || variance < -NEGATIVE_VARIANCE_TOLERANCE {
        return Err(AnalysisError::Numerical(format!(
            "portfolio variance {:e} is negative; covariance matrix is not positive semi-definite",
            variance
        )));
    }
    Ok(variance.max(0.0).sqrt())
}

/// Expected return, volatility and Sharpe ratio of `weights`.
///
/// Pure: the same inputs always give bit-identical outputs.
pub fn metrics(
    weights: &[f64],
    means: &[f64],
    cov: &[Vec<f64>],
    risk_free_rate: f64,
) -> AnalysisResult<PortfolioMetrics> {
    let n = weights.len();
    if means.len() != n || cov.len() != n || cov.iter().any(|row| row.len() != n) {
        return Err(AnalysisError::invalid_input(
            "weights",
            format!(
                "{} weights do not match {} means and a {}x{} covariance matrix",
                n,
                means.len(),
                cov.len(),
                cov.first().map(|r| r.len()).unwrap_or(0)
            ),
        ));
    }

    let expected_return = portfolio_return(weights, means);
    let volatility = portfolio_volatility(weights, cov)?;
    if volatility <= ZERO_VOLATILITY {
        return Err(AnalysisError::DivisionByZero {
            context: "Sharpe ratio of a zero-volatility allocation".to_string(),
        });
    }

    Ok(PortfolioMetrics {
        expected_return,
        volatility,
        sharpe_ratio: (expected_return - risk_free_rate) / volatility,
    })
}

/// `Σ w`, the gradient of the variance up to a factor of two.
pub fn covariance_times(weights: &[f64], cov: &[Vec<f64>]) -> Vec<f64> {
    cov.iter()
        .map(|row| row.iter().zip(weights.iter()).map(|(c, w)| c * w).sum())
        .collect()
}
