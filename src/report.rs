use crate::config::AnalysisConfig;
use crate::optimizer::{EfficientFrontier, MinVariancePortfolio, OptimalPortfolio};
use crate::returns::AssetSummary;
use crate::sampler::{PortfolioSample, SampleCloud};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Buy-and-hold growth of one unit from the first date.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CumulativeGrowth {
    pub dates: Vec<NaiveDate>,
    /// One series per asset, indexed like `AnalysisReport::symbols`.
    pub assets: Vec<Vec<f64>>,
    /// The optimal portfolio held from the first date.
    pub optimal: Option<Vec<f64>>,
}

/// Per-asset analytics that accompany the optimizer output.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AssetAnalytics {
    pub summaries: Vec<AssetSummary>,
    pub correlation: Vec<Vec<f64>>,
    pub cumulative: CumulativeGrowth,
}

/// Everything one run produced, read-only.
#[derive(Clone, Debug, Serialize)]
pub struct AnalysisReport {
    pub symbols: Vec<String>,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub observations: usize,
    pub annualization_factor: f64,
    pub risk_free_rate: f64,
    pub optimal: OptimalPortfolio,
    pub min_variance: Option<MinVariancePortfolio>,
    pub frontier: EfficientFrontier,
    pub samples: SampleCloud,
    /// Highest-Sharpe sample. Approximate; `optimal` is the reported optimum.
    pub best_sample: Option<PortfolioSample>,
    pub analytics: AssetAnalytics,
}

/// Packages one run's outputs. Only aggregates; nothing is recomputed.
#[allow(clippy::too_many_arguments)]
pub fn assemble(
    config: &AnalysisConfig,
    symbols: Vec<String>,
    observations: usize,
    optimal: OptimalPortfolio,
    min_variance: Option<MinVariancePortfolio>,
    frontier: EfficientFrontier,
    samples: SampleCloud,
    analytics: AssetAnalytics,
) -> AnalysisReport {
    let best_sample = samples.best_by_sharpe().cloned();
    AnalysisReport {
        symbols,
        first_date: analytics.cumulative.dates.first().copied(),
        last_date: analytics.cumulative.dates.last().copied(),
        observations,
        annualization_factor: config.annualization_factor,
        risk_free_rate: config.risk_free_rate,
        optimal,
        min_variance,
        frontier,
        samples,
        best_sample,
        analytics,
    }
}

pub fn percent(fraction: f64) -> f64 {
    fraction * 100.0
}

impl AnalysisReport {
    /// Optimal weights in percent, largest first.
    pub fn optimal_allocation_percent(&self) -> Vec<(String, f64)> {
        let mut sorted: Vec<(String, f64)> = self
            .symbols
            .iter()
            .cloned()
            .zip(self.optimal.weights.iter().map(|w| percent(*w)))
            .collect();
        sorted.sort_by(|a, b| b.1.total_cmp(&a.1));
        sorted
    }
}

/// Pretty-prints the report to stdout.
pub fn print_report(report: &AnalysisReport) {
    let opt = &report.optimal;
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║           Mean-Variance Portfolio Analysis                 ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    if let (Some(first), Some(last)) = (report.first_date, report.last_date) {
        println!(
            "║  Window : {} → {}  ({:>5} prices)               ║",
            first, last, report.observations
        );
    }
    println!(
        "║  Expected Annual Return : {:>+7.2}%                          ║",
        percent(opt.expected_return)
    );
    println!(
        "║  Expected Annual Vol    : {:>7.2}%                          ║",
        percent(opt.volatility)
    );
    println!(
        "║  Sharpe Ratio           : {:>7.3}                           ║",
        opt.sharpe_ratio
    );
    println!(
        "║  Risk-free Rate         : {:>7.2}%                          ║",
        percent(report.risk_free_rate)
    );
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Symbol   Weight    E[Ann.Ret]  Ann.Vol   Sharpe           ║");
    println!("╠════════════════════════════════════════════════════════════╣");

    for (symbol, weight) in report.optimal_allocation_percent() {
        if let Some(a) = report.analytics.summaries.iter().find(|a| a.symbol == symbol) {
            let sharpe = a
                .sharpe_ratio
                .map(|s| format!("{:>6.2}", s))
                .unwrap_or_else(|| "   n/a".to_string());
            println!(
                "║  {:<6} {:>7.2}%   {:>+7.2}%   {:>6.2}%   {}           ║",
                symbol,
                weight,
                percent(a.annual_return),
                percent(a.annual_volatility),
                sharpe
            );
        }
    }

    println!("╠════════════════════════════════════════════════════════════╣");
    if let Some(mv) = &report.min_variance {
        println!(
            "║  Min-Variance : E[r] {:>+7.2}%   σ {:>6.2}%                   ║",
            percent(mv.expected_return),
            percent(mv.volatility)
        );
    }
    if let Some(best) = &report.best_sample {
        println!(
            "║  Best Sample  : E[r] {:>+7.2}%   σ {:>6.2}%   Sharpe {:>5.2}   ║",
            percent(best.expected_return),
            percent(best.volatility),
            best.sharpe_ratio
        );
    }
    println!(
        "║  Samples: {:>6}  (discarded {:>5})                         ║",
        report.samples.len(),
        report.samples.discarded
    );
    println!(
        "║  Frontier: {:>3} points  ({:>3} skipped)                       ║",
        report.frontier.len(),
        report.frontier.skipped.len()
    );
    println!(
        "║  Optimizer: {}/{} starts converged                           ║",
        opt.starts_converged, opt.starts_attempted
    );
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("⚠  Educational use only. Not financial advice.");
}

pub fn write_json(report: &AnalysisReport, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), report)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;
    info!("Wrote JSON report to {}", path.display());
    Ok(())
}

/// Writes the sample cloud as CSV: one weight column per symbol, then
/// `return,volatility,sharpe`.
pub fn write_samples<W: Write>(writer: W, symbols: &[String], cloud: &SampleCloud) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    let mut header: Vec<&str> = symbols.iter().map(String::as_str).collect();
    header.extend(["return", "volatility", "sharpe"]);
    wtr.write_record(&header)?;

    for sample in &cloud.samples {
        let record: Vec<String> = sample
            .weights
            .iter()
            .chain([sample.expected_return, sample.volatility, sample.sharpe_ratio].iter())
            .map(|v| v.to_string())
            .collect();
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_samples_csv(report: &AnalysisReport, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    write_samples(file, &report.symbols, &report.samples)
        .with_context(|| format!("Failed to write samples to {}", path.display()))?;
    info!("Wrote {} samples to {}", report.samples.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> AnalysisReport {
        let optimal = OptimalPortfolio {
            weights: vec![0.25, 0.75],
            expected_return: 0.1,
            volatility: 0.2,
            sharpe_ratio: 0.5,
            iterations: 4,
            starts_converged: 5,
            starts_attempted: 5,
        };
        let samples = SampleCloud {
            samples: vec![
                PortfolioSample {
                    weights: vec![0.5, 0.5],
                    expected_return: 0.08,
                    volatility: 0.2,
                    sharpe_ratio: 0.4,
                },
                PortfolioSample {
                    weights: vec![0.3, 0.7],
                    expected_return: 0.09,
                    volatility: 0.2,
                    sharpe_ratio: 0.45,
                },
            ],
            discarded: 1,
        };
        let analytics = AssetAnalytics {
            cumulative: CumulativeGrowth {
                dates: vec![
                    NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                    NaiveDate::from_ymd_opt(2020, 1, 2).unwrap(),
                ],
                assets: vec![vec![1.0, 1.1], vec![1.0, 0.9]],
                optimal: Some(vec![1.0, 0.95]),
            },
            ..AssetAnalytics::default()
        };
        assemble(
            &AnalysisConfig::default(),
            vec!["AAA".to_string(), "BBB".to_string()],
            2,
            optimal,
            None,
            EfficientFrontier::default(),
            samples,
            analytics,
        )
    }

    #[test]
    fn test_assemble_aggregates_without_changing_values() {
        let report = sample_report();
        assert_eq!(report.optimal.weights, vec![0.25, 0.75]);
        assert_eq!(report.best_sample.as_ref().unwrap().sharpe_ratio, 0.45);
        assert_eq!(report.samples.discarded, 1);
        assert_eq!(report.first_date, NaiveDate::from_ymd_opt(2020, 1, 1));
        assert_eq!(report.annualization_factor, 252.0);
    }

    #[test]
    fn test_allocation_percent_sorted() {
        let report = sample_report();
        let alloc = report.optimal_allocation_percent();
        assert_eq!(alloc[0].0, "BBB");
        assert!((alloc[0].1 - 75.0).abs() < 1e-12);
        assert!((alloc[1].1 - 25.0).abs() < 1e-12);
    }

    #[test]
    fn test_samples_csv_layout() {
        let report = sample_report();
        let mut buf = Vec::new();
        write_samples(&mut buf, &report.symbols, &report.samples).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("AAA,BBB,return,volatility,sharpe"));
        assert_eq!(lines.next(), Some("0.5,0.5,0.08,0.2,0.4"));
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_report_serializes_to_json() {
        let report = sample_report();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["symbols"][1], "BBB");
        assert_eq!(json["optimal"]["sharpe_ratio"], 0.5);
        assert!(json["min_variance"].is_null());
        assert_eq!(json["analytics"]["cumulative"]["dates"][0], "2020-01-01");
    }
}
