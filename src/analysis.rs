use crate::config::AnalysisConfig;
use crate::data::PriceSeries;
use crate::error::{AnalysisError, AnalysisResult};
use crate::optimizer::FrontierOptimizer;
use crate::report::{AnalysisReport, AssetAnalytics, CumulativeGrowth, assemble};
use crate::returns::{asset_summaries, compute_return_statistics, correlation_matrix, cumulative_growth};
use crate::sampler::MonteCarloSampler;
use rand::Rng;
use std::time::Instant;
use tracing::{info, warn};

/// Runs the full pipeline on an aligned price table:
/// returns → sample cloud → max-Sharpe → min-variance → frontier → report.
///
/// Input problems are reported before any sampling or optimization starts.
pub fn run_analysis(config: &AnalysisConfig, prices: &PriceSeries) -> AnalysisResult<AnalysisReport> {
    let started = Instant::now();
    config.validate_for_assets(prices.num_assets())?;

    info!(
        "=== Mean-Variance Analysis ===\n  Assets: {:?}\n  Prices: {}\n  Samples: {}\n  Bounds: [{}, {}]",
        prices.symbols(),
        prices.len(),
        config.num_portfolios,
        config.bounds.lower,
        config.bounds.upper
    );

    if config.bounds.allows_short() {
        info!("Short positions enabled down to {:.0}% per asset", config.bounds.lower * 100.0);
    }

    let stats = compute_return_statistics(prices, config.annualization_factor)?;
    info!(
        "Return statistics from {} periods (annualized ×{})",
        stats.num_periods(),
        stats.annualization_factor
    );

    let seed = config.seed.unwrap_or_else(|| rand::thread_rng().r#gen());
    info!("Using seed {} (pass --seed {} to reproduce)", seed, seed);

    let samples = MonteCarloSampler::new(
        &stats,
        config.risk_free_rate,
        config.weight_policy,
        config.bounds,
        Some(seed),
    )
    .sample(config.num_portfolios)?;

    let optimizer = FrontierOptimizer::new(
        &stats,
        config.risk_free_rate,
        config.bounds,
        config.solver,
        seed,
    );
    let optimal = optimizer.max_sharpe()?;

    let min_variance = match optimizer.min_variance() {
        Ok(mv) => Some(mv),
        Err(e @ AnalysisError::Numerical(_)) => return Err(e),
        Err(e) => {
            warn!("Minimum-variance portfolio unavailable: {}", e);
            None
        }
    };

    let frontier = optimizer.efficient_frontier(config.frontier_points)?;

    let (assets, optimal_growth) = cumulative_growth(prices, Some(&optimal.weights));
    let analytics = AssetAnalytics {
        summaries: asset_summaries(&stats, config.risk_free_rate),
        correlation: correlation_matrix(&stats.covariance),
        cumulative: CumulativeGrowth {
            dates: prices.dates().to_vec(),
            assets,
            optimal: optimal_growth,
        },
    };

    info!("Analysis finished in {:.2?}", started.elapsed());

    Ok(assemble(
        config,
        stats.symbols.clone(),
        prices.len(),
        optimal,
        min_variance,
        frontier,
        samples,
        analytics,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SolverSettings, WEIGHT_SUM_TOLERANCE, WeightBounds};
    use chrono::NaiveDate;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn symbols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn small_config() -> AnalysisConfig {
        AnalysisConfig {
            num_portfolios: 2_000,
            frontier_points: 12,
            seed: Some(17),
            ..AnalysisConfig::default()
        }
    }

    #[test]
    fn test_zero_price_rejected_before_sampling() {
        let start = NaiveDate::from_ymd_opt(2022, 1, 3).unwrap();
        let dates = (0..3).map(|i| start + chrono::Duration::days(i)).collect();
        let prices = PriceSeries::new(
            symbols(&["AAA", "BBB"]),
            dates,
            vec![vec![10.0, 20.0], vec![0.0, 21.0], vec![11.0, 22.0]],
        )
        .unwrap();

        let result = run_analysis(&small_config(), &prices);
        match result {
            Err(AnalysisError::InvalidPrice { symbol, row, .. }) => {
                assert_eq!(symbol, "AAA");
                assert_eq!(row, 1);
            }
            other => panic!("expected InvalidPrice, got {:?}", other.map(|r| r.optimal.weights)),
        }
    }

    #[test]
    fn test_single_price_row_is_insufficient() {
        let prices = PriceSeries::new(
            symbols(&["AAA"]),
            vec![NaiveDate::from_ymd_opt(2022, 1, 3).unwrap()],
            vec![vec![10.0]],
        )
        .unwrap();
        assert!(matches!(
            run_analysis(&small_config(), &prices),
            Err(AnalysisError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_unreachable_bounds_rejected() {
        let prices = PriceSeries::synthetic(&symbols(&["A", "B", "C"]), 60, 1).unwrap();
        let config = AnalysisConfig {
            bounds: WeightBounds::new(0.0, 0.2).unwrap(),
            ..small_config()
        };
        assert!(matches!(
            run_analysis(&config, &prices),
            Err(AnalysisError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_end_to_end_on_synthetic_prices() {
        let prices = PriceSeries::synthetic(&symbols(&["AAA", "BBB", "CCC", "DDD"]), 500, 11).unwrap();
        let report = run_analysis(&small_config(), &prices).unwrap();

        let sum: f64 = report.optimal.weights.iter().sum();
        assert!((sum - 1.0).abs() < WEIGHT_SUM_TOLERANCE);
        assert!(WeightBounds::default().admits(&report.optimal.weights));

        let best = report.best_sample.as_ref().unwrap();
        assert!(report.optimal.sharpe_ratio >= best.sharpe_ratio - 1e-9);

        assert!(report.samples.len() <= 2_000 && !report.samples.is_empty());
        assert_eq!(report.frontier.len() + report.frontier.skipped.len(), 12);
        assert!(report.min_variance.is_some());

        assert_eq!(report.analytics.summaries.len(), 4);
        assert_eq!(report.analytics.correlation.len(), 4);
        assert_eq!(report.analytics.cumulative.dates.len(), 500);
        assert_eq!(report.analytics.cumulative.optimal.as_ref().map(|s| s.len()), Some(500));
        assert_eq!(report.observations, 500);
    }

    #[test]
    fn test_seed_reproduces_report() {
        let prices = PriceSeries::synthetic(&symbols(&["AAA", "BBB", "CCC"]), 300, 5).unwrap();
        let a = run_analysis(&small_config(), &prices).unwrap();
        let b = run_analysis(&small_config(), &prices).unwrap();
        assert_eq!(a.optimal.weights, b.optimal.weights);
        assert_eq!(a.samples.len(), b.samples.len());
        assert_eq!(
            a.best_sample.map(|s| s.weights),
            b.best_sample.map(|s| s.weights)
        );
    }

    #[test]
    fn test_solver_failure_propagates() {
        let prices = PriceSeries::synthetic(&symbols(&["AAA", "BBB", "CCC"]), 300, 5).unwrap();
        let config = AnalysisConfig {
            solver: SolverSettings {
                max_iterations: 1,
                ..SolverSettings::default()
            },
            ..small_config()
        };
        assert!(matches!(
            run_analysis(&config, &prices),
            Err(AnalysisError::DidNotConverge { .. })
        ));
    }

    #[test]
    fn test_nearly_identical_drifts_still_optimize() {
        // Demeaned noise plus a shared drift: daily means differ by ~1e-11.
        let mut rng = StdRng::seed_from_u64(8);
        let days = 300;
        let noise: Vec<Vec<f64>> = (0..3)
            .map(|_| {
                let raw: Vec<f64> = (0..days - 1).map(|_| rng.gen_range(-0.02..0.02)).collect();
                let mean = raw.iter().sum::<f64>() / raw.len() as f64;
                raw.into_iter().map(|r| r - mean).collect()
            })
            .collect();

        let start = NaiveDate::from_ymd_opt(2022, 1, 3).unwrap();
        let dates = (0..days as i64).map(|i| start + chrono::Duration::days(i)).collect();
        let mut closes = vec![vec![100.0; 3]];
        for t in 0..days - 1 {
            let prev = &closes[t];
            let row = (0..3)
                .map(|i| prev[i] * (0.0008 + 1e-11 * i as f64 + noise[i][t]).exp())
                .collect();
            closes.push(row);
        }
        let prices = PriceSeries::new(symbols(&["AAA", "BBB", "CCC"]), dates, closes).unwrap();

        let report = run_analysis(&small_config(), &prices).unwrap();
        let sum: f64 = report.optimal.weights.iter().sum();
        assert!((sum - 1.0).abs() < WEIGHT_SUM_TOLERANCE);
        assert!(WeightBounds::default().admits(&report.optimal.weights));
        assert_eq!(report.frontier.len() + report.frontier.skipped.len(), 12);
        assert!(!report.frontier.is_empty());
    }
}
