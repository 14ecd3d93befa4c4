use crate::data::PriceSeries;
use crate::error::{AnalysisError, AnalysisResult};
use serde::Serialize;

/// Annualized return statistics derived from a price table.
#[derive(Clone, Debug)]
pub struct ReturnStatistics {
    pub symbols: Vec<String>,
    /// `log_returns[t][i] = ln(p[t+1][i] / p[t][i])`, one row fewer than the prices.
    pub log_returns: Vec<Vec<f64>>,
    /// Annualized arithmetic mean of the log returns, per asset.
    pub mean_returns: Vec<f64>,
    /// Annualized sample covariance of the log returns.
    pub covariance: Vec<Vec<f64>>,
    pub annualization_factor: f64,
}

impl ReturnStatistics {
    pub fn num_assets(&self) -> usize {
        self.mean_returns.len()
    }

    pub fn num_periods(&self) -> usize {
        self.log_returns.len()
    }

    pub fn volatilities(&self) -> Vec<f64> {
        (0..self.num_assets())
            .map(|i| self.covariance[i][i].max(0.0).sqrt())
            .collect()
    }
}

/// Stand-alone risk/return figures for one asset.
#[derive(Clone, Debug, Serialize)]
pub struct AssetSummary {
    pub symbol: String,
    pub annual_return: f64,
    pub annual_volatility: f64,
    /// `None` when the asset has zero variance.
    pub sharpe_ratio: Option<f64>,
}

/// Validates the price table and converts it to per-period log returns.
pub fn log_returns(prices: &PriceSeries) -> AnalysisResult<Vec<Vec<f64>>> {
    if prices.num_assets() == 0 {
        return Err(AnalysisError::InsufficientData("price table has no assets".to_string()));
    }
    if prices.len() < 2 {
        return Err(AnalysisError::InsufficientData(format!(
            "need at least 2 prices per asset, got {}",
            prices.len()
        )));
    }

    for (row, values) in prices.rows().iter().enumerate() {
        for (asset, &price) in values.iter().enumerate() {
            if !(price.is_finite() && price > 0.0) {
                return Err(AnalysisError::InvalidPrice {
                    symbol: prices.symbols()[asset].clone(),
                    row,
                    price,
                });
            }
        }
    }

    Ok(prices
        .rows()
        .windows(2)
        .map(|w| w[1].iter().zip(w[0].iter()).map(|(p1, p0)| (p1 / p0).ln()).collect())
        .collect())
}

/// Sample covariance of the columns of `returns`.
///
/// Uses the `m - 1` denominator; a single observation falls back to `1`.
pub fn sample_covariance(returns: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let m = returns.len();
    let n = returns.first().map(|r| r.len()).unwrap_or(0);
    if m == 0 {
        return vec![vec![0.0; n]; n];
    }
    let means = column_means(returns);
    let denom = (m.saturating_sub(1)).max(1) as f64;

    let mut cov = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let sum: f64 = returns
                .iter()
                .map(|row| (row[i] - means[i]) * (row[j] - means[j]))
                .sum();
            let covariance = sum / denom;
            cov[i][j] = covariance;
            cov[j][i] = covariance;
        }
    }
    cov
}

fn column_means(rows: &[Vec<f64>]) -> Vec<f64> {
    let m = rows.len();
    let n = rows.first().map(|r| r.len()).unwrap_or(0);
    if m == 0 {
        return vec![0.0; n];
    }
    let mut sums = vec![0.0; n];
    for row in rows {
        for (s, v) in sums.iter_mut().zip(row.iter()) {
            *s += v;
        }
    }
    sums.iter().map(|s| s / m as f64).collect()
}

/// Computes annualized mean returns and covariance from a validated price table.
pub fn compute_return_statistics(
    prices: &PriceSeries,
    annualization_factor: f64,
) -> AnalysisResult<ReturnStatistics> {
    if !(annualization_factor.is_finite() && annualization_factor > 0.0) {
        return Err(AnalysisError::invalid_input(
            "annualization_factor",
            "must be a positive number",
        ));
    }

    let log_returns = log_returns(prices)?;

    let mean_returns: Vec<f64> = column_means(&log_returns)
        .into_iter()
        .map(|m| m * annualization_factor)
        .collect();

    let covariance: Vec<Vec<f64>> = sample_covariance(&log_returns)
        .into_iter()
        .map(|row| row.into_iter().map(|c| c * annualization_factor).collect())
        .collect();

    if let Some(i) = (0..covariance.len()).find(|&i| covariance[i][i].is_nan() || covariance[i][i] < 0.0) {
        return Err(AnalysisError::Numerical(format!(
            "negative or undefined variance {} for {}",
            covariance[i][i],
            prices.symbols()[i]
        )));
    }

    Ok(ReturnStatistics {
        symbols: prices.symbols().to_vec(),
        log_returns,
        mean_returns,
        covariance,
        annualization_factor,
    })
}

/// Pearson correlation from a covariance matrix. Zero-variance assets get 0
/// off the diagonal and 1 on it.
pub fn correlation_matrix(covariance: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = covariance.len();
    let std: Vec<f64> = (0..n).map(|i| covariance[i][i].max(0.0).sqrt()).collect();
    (0..n)
        .map(|i| {
            (0..n)
                .map(|j| {
                    if i == j {
                        1.0
                    } else if std[i] > 0.0 && std[j] > 0.0 {
                        (covariance[i][j] / (std[i] * std[j])).clamp(-1.0, 1.0)
                    } else {
                        0.0
                    }
                })
                .collect()
        })
        .collect()
}

pub fn asset_summaries(stats: &ReturnStatistics, risk_free_rate: f64) -> Vec<AssetSummary> {
    stats
        .symbols
        .iter()
        .zip(stats.mean_returns.iter())
        .zip(stats.volatilities())
        .map(|((symbol, &annual_return), annual_volatility)| AssetSummary {
            symbol: symbol.clone(),
            annual_return,
            annual_volatility,
            sharpe_ratio: (annual_volatility > 0.0)
                .then(|| (annual_return - risk_free_rate) / annual_volatility),
        })
        .collect()
}

/// Growth of one unit invested at the first date, compounding simple returns.
///
/// Returns one series per asset plus, when `weights` is given, the
/// buy-and-hold portfolio holding those initial weights. Every series starts
/// at 1.0 on the first date.
pub fn cumulative_growth(prices: &PriceSeries, weights: Option<&[f64]>) -> (Vec<Vec<f64>>, Option<Vec<f64>>) {
    let n = prices.num_assets();
    let mut per_asset: Vec<Vec<f64>> = (0..n).map(|_| Vec::with_capacity(prices.len())).collect();
    let mut portfolio: Option<Vec<f64>> = weights.map(|_| Vec::with_capacity(prices.len()));

    let mut level = vec![1.0; n];
    for (t, row) in prices.rows().iter().enumerate() {
        if t > 0 {
            let prev = &prices.rows()[t - 1];
            for ((l, p1), p0) in level.iter_mut().zip(row.iter()).zip(prev.iter()) {
                *l *= 1.0 + (p1 / p0 - 1.0);
            }
        }
        for (series, l) in per_asset.iter_mut().zip(level.iter()) {
            series.push(*l);
        }
        if let (Some(series), Some(w)) = (portfolio.as_mut(), weights) {
            series.push(w.iter().zip(level.iter()).map(|(w, l)| w * l).sum());
        }
    }

    (per_asset, portfolio)
}
