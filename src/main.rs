mod analysis;
mod app;
mod config;
mod data;
mod error;
mod metrics;
mod optimizer;
mod report;
mod returns;
mod sampler;
mod tui;
mod ui;

use anyhow::Result;
use app::App;
use clap::Parser;
use config::{AlignPolicy, AnalysisConfig, SolverSettings, WeightBounds, WeightPolicy};
use data::PriceSeries;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Frontier-TUI: Mean-variance portfolio analysis and efficient frontier optimization",
    after_help = "EXAMPLES:
    # Analyze the default basket over 2010-2017
    cargo run --release

    # Custom symbols and window, exporting the full report
    cargo run --release -- --symbols NVDA,MSFT,AAPL,QQQ --start 2018-01-01 --end 2024-01-01 --json report.json

    # Offline run on synthetic prices with the interactive dashboard
    cargo run --release -- --mock --seed 7 --tui

    # Allow short positions down to -20% per asset
    cargo run --release -- --min-weight -0.2 --max-weight 1.2"
)]
struct Args {
    /// Comma-separated ticker symbols [default: AAPL,WMT,TSLA,GE,AMZN,DB]
    #[arg(long)]
    symbols: Option<String>,

    /// First date of the price window, YYYY-MM-DD [default: 2010-01-01]
    #[arg(long)]
    start: Option<String>,

    /// End of the price window, exclusive, YYYY-MM-DD [default: 2017-01-01]
    #[arg(long)]
    end: Option<String>,

    /// Read prices from a CSV file (header: date,SYM1,SYM2,...) instead of Yahoo Finance.
    /// Only the columns and dates named by --symbols/--start/--end are kept.
    #[arg(long, conflicts_with = "mock")]
    prices_csv: Option<PathBuf>,

    /// Use seeded synthetic prices instead of Yahoo Finance
    #[arg(long)]
    mock: bool,

    /// Number of synthetic trading days for --mock
    #[arg(long, default_value_t = 1000)]
    mock_days: usize,

    /// Number of random portfolios in the sample cloud
    #[arg(long, default_value_t = config::DEFAULT_NUM_PORTFOLIOS)]
    samples: usize,

    /// Annual risk-free rate as a fraction (0.02 = 2%)
    #[arg(long, default_value_t = config::DEFAULT_RISK_FREE_RATE, allow_hyphen_values = true)]
    risk_free_rate: f64,

    /// Periods per year used to annualize returns
    #[arg(long, default_value_t = config::TRADING_DAYS)]
    trading_days: f64,

    /// Number of target returns swept along the efficient frontier
    #[arg(long, default_value_t = config::DEFAULT_FRONTIER_POINTS)]
    frontier_points: usize,

    /// Lower weight bound per asset (negative allows shorting)
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    min_weight: f64,

    /// Upper weight bound per asset (above 1.0 allows leverage)
    #[arg(long, default_value_t = 1.0)]
    max_weight: f64,

    /// RNG seed for the sample cloud and optimizer restarts
    #[arg(long)]
    seed: Option<u64>,

    /// Extra max-Sharpe starts beyond equal weights
    #[arg(long, default_value_t = config::DEFAULT_RESTARTS)]
    restarts: usize,

    /// Iteration budget per solver call
    #[arg(long, default_value_t = config::DEFAULT_MAX_ITERATIONS)]
    max_iterations: usize,

    /// Solver convergence tolerance
    #[arg(long, default_value_t = config::DEFAULT_TOLERANCE)]
    tolerance: f64,

    /// How random weights are drawn for the sample cloud
    #[arg(long, value_enum, default_value_t = WeightPolicy::UniformNormalized)]
    weight_policy: WeightPolicy,

    /// How dates missing for some symbols are handled
    #[arg(long, value_enum, default_value_t = AlignPolicy::DropMissing)]
    align: AlignPolicy,

    /// Write the full report as JSON
    #[arg(long)]
    json: Option<PathBuf>,

    /// Write the sample cloud as CSV
    #[arg(long)]
    samples_csv: Option<PathBuf>,

    /// Open the interactive terminal dashboard after the analysis
    #[arg(long)]
    tui: bool,
}

impl Args {
    fn to_config(&self) -> Result<AnalysisConfig> {
        let symbols = self.symbols.as_deref().map(config::parse_symbols);
        let start = self.start.as_deref().unwrap_or(config::DEFAULT_START_DATE);
        let end = self.end.as_deref().unwrap_or(config::DEFAULT_END_DATE);
        let config = AnalysisConfig {
            symbols: symbols.unwrap_or_else(|| config::DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect()),
            start_date: config::parse_date(start)?,
            end_date: config::parse_date(end)?,
            annualization_factor: self.trading_days,
            risk_free_rate: self.risk_free_rate,
            num_portfolios: self.samples,
            weight_policy: self.weight_policy,
            bounds: WeightBounds::new(self.min_weight, self.max_weight)?,
            frontier_points: self.frontier_points,
            align_policy: self.align,
            seed: self.seed,
            solver: SolverSettings {
                max_iterations: self.max_iterations,
                tolerance: self.tolerance,
                restarts: self.restarts,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

async fn load_prices(args: &Args, config: &AnalysisConfig) -> Result<PriceSeries> {
    if let Some(path) = &args.prices_csv {
        info!("Loading prices from {}", path.display());
        let table = PriceSeries::from_csv_path(path)?;
        let symbols = args.symbols.is_some().then_some(config.symbols.as_slice());
        let start = args.start.is_some().then_some(config.start_date);
        let end = args.end.is_some().then_some(config.end_date);
        let selected = table.select(symbols, start, end)?;
        info!(
            "Using {} of {} columns and {} of {} rows from {}",
            selected.num_assets(),
            table.num_assets(),
            selected.len(),
            table.len(),
            path.display()
        );
        return Ok(selected);
    }
    if args.mock {
        let seed = config.seed.unwrap_or(42);
        info!(
            "Generating {} days of synthetic prices for {:?} (seed {})",
            args.mock_days, config.symbols, seed
        );
        return Ok(PriceSeries::synthetic(&config.symbols, args.mock_days, seed)?);
    }

    info!(
        "Fetching {:?} from {} to {}...",
        config.symbols, config.start_date, config.end_date
    );
    let histories = data::fetch_universe(&config.symbols, config.start_date, config.end_date).await?;
    Ok(PriceSeries::align(&histories, config.align_policy)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("frontier_tui=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    config::init_cpu_parallelism();

    let args = Args::parse();
    let config = args.to_config()?;
    let prices = load_prices(&args, &config).await?;

    let report = tokio::task::spawn_blocking(move || analysis::run_analysis(&config, &prices)).await??;

    if let Some(path) = &args.json {
        report::write_json(&report, path)?;
    }
    if let Some(path) = &args.samples_csv {
        report::write_samples_csv(&report, path)?;
    }

    if !args.tui {
        report::print_report(&report);
        return Ok(());
    }

    let mut terminal = tui::init()?;
    let mut app = App::new(report);
    let res = app.run(&mut terminal);

    tui::restore()?;

    if let Err(e) = res {
        error!("Error: {:?}", e);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args_build_default_config() {
        let args = Args::parse_from(["frontier-tui"]);
        let cfg = args.to_config().unwrap();
        let default = AnalysisConfig::default();
        assert_eq!(cfg.symbols, default.symbols);
        assert_eq!(cfg.start_date, default.start_date);
        assert_eq!(cfg.num_portfolios, default.num_portfolios);
        assert_eq!(cfg.bounds, default.bounds);
        assert_eq!(cfg.solver, default.solver);
    }

    #[test]
    fn test_short_bounds_from_cli() {
        let args = Args::parse_from(["frontier-tui", "--min-weight", "-0.2", "--max-weight", "1.2", "--seed", "3"]);
        let cfg = args.to_config().unwrap();
        assert!(cfg.bounds.allows_short());
        assert_eq!(cfg.seed, Some(3));
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let args = Args::parse_from(["frontier-tui", "--min-weight", "0.5", "--max-weight", "0.1"]);
        assert!(args.to_config().is_err());
    }

    #[tokio::test]
    async fn test_prices_csv_honors_symbols_and_window() {
        let path = std::env::temp_dir().join(format!("frontier-tui-prices-{}.csv", std::process::id()));
        std::fs::write(
            &path,
            "date,AAA,BBB,CCC\n2021-03-01,10,20,30\n2021-03-02,11,21,31\n2021-03-03,12,22,32\n2021-03-04,13,23,33\n",
        )
        .unwrap();
        let path_arg = path.to_string_lossy().to_string();

        let args = Args::parse_from([
            "frontier-tui",
            "--prices-csv",
            path_arg.as_str(),
            "--symbols",
            "bbb,aaa",
            "--start",
            "2021-03-02",
            "--end",
            "2021-03-04",
        ]);
        let cfg = args.to_config().unwrap();
        let prices = load_prices(&args, &cfg).await.unwrap();
        assert_eq!(prices.symbols(), ["BBB".to_string(), "AAA".to_string()]);
        assert_eq!(prices.len(), 2);
        assert_eq!(prices.rows()[0], vec![21.0, 11.0]);

        let args = Args::parse_from(["frontier-tui", "--prices-csv", path_arg.as_str()]);
        let cfg = args.to_config().unwrap();
        let prices = load_prices(&args, &cfg).await.unwrap();
        assert_eq!(prices.num_assets(), 3);
        assert_eq!(prices.len(), 4);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_mock_prices_loaded() {
        let args = Args::parse_from(["frontier-tui", "--mock", "--mock-days", "50", "--symbols", "AAA,BBB"]);
        let cfg = args.to_config().unwrap();
        let prices = load_prices(&args, &cfg).await.unwrap();
        assert_eq!(prices.len(), 50);
        assert_eq!(prices.symbols(), ["AAA".to_string(), "BBB".to_string()]);
    }
}
