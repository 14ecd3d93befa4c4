use crate::error::{AnalysisError, AnalysisResult};
use chrono::NaiveDate;
use rayon::ThreadPoolBuilder;
use serde::Serialize;
use std::sync::OnceLock;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = num_cpus::get().max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!(
                "Initialized Rayon thread pool with {} threads (all logical CPU cores)",
                num_threads
            ),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}

// ──────────────────────────────────────────────────────────────────────────────
// Defaults
// ──────────────────────────────────────────────────────────────────────────────

/// Trading periods per year for daily data.
pub const TRADING_DAYS: f64 = 252.0;

/// Number of random portfolios drawn for the exploratory cloud.
pub const DEFAULT_NUM_PORTFOLIOS: usize = 10_000;

/// Number of target-return levels swept along the frontier.
pub const DEFAULT_FRONTIER_POINTS: usize = 50;

pub const DEFAULT_RISK_FREE_RATE: f64 = 0.0;

pub const DEFAULT_SYMBOLS: &[&str] = &["AAPL", "WMT", "TSLA", "GE", "AMZN", "DB"];

pub const DEFAULT_START_DATE: &str = "2010-01-01";
pub const DEFAULT_END_DATE: &str = "2017-01-01";

/// SQP iteration budget per start.
pub const DEFAULT_MAX_ITERATIONS: usize = 200;
pub const DEFAULT_TOLERANCE: f64 = 1e-10;
/// Extra max-Sharpe starts beyond the equal-weight guess.
pub const DEFAULT_RESTARTS: usize = 4;

/// Weights must sum to one within this tolerance.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

// ──────────────────────────────────────────────────────────────────────────────
// Configuration types
// ──────────────────────────────────────────────────────────────────────────────

/// Per-asset box bounds, applied identically to every asset.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct WeightBounds {
    pub lower: f64,
    pub upper: f64,
}

impl Default for WeightBounds {
    fn default() -> Self {
        Self { lower: 0.0, upper: 1.0 }
    }
}

impl WeightBounds {
    pub fn new(lower: f64, upper: f64) -> AnalysisResult<Self> {
        let bounds = Self { lower, upper };
        bounds.validate()?;
        Ok(bounds)
    }

    pub fn allows_short(&self) -> bool {
        self.lower < 0.0
    }

    pub fn contains(&self, weight: f64) -> bool {
        weight >= self.lower - WEIGHT_SUM_TOLERANCE && weight <= self.upper + WEIGHT_SUM_TOLERANCE
    }

    pub fn admits(&self, weights: &[f64]) -> bool {
        weights.iter().all(|&w| self.contains(w))
    }

    pub fn lower_vec(&self, n: usize) -> Vec<f64> {
        vec![self.lower; n]
    }

    pub fn upper_vec(&self, n: usize) -> Vec<f64> {
        vec![self.upper; n]
    }

    fn validate(&self) -> AnalysisResult<()> {
        if !self.lower.is_finite() || !self.upper.is_finite() {
            return Err(AnalysisError::invalid_input("bounds", "bounds must be finite"));
        }
        if self.lower > self.upper {
            return Err(AnalysisError::invalid_input(
                "bounds",
                format!("lower bound {} exceeds upper bound {}", self.lower, self.upper),
            ));
        }
        Ok(())
    }

    /// A fully-invested portfolio exists iff `n * lower <= 1 <= n * upper`.
    pub fn validate_for_assets(&self, n: usize) -> AnalysisResult<()> {
        self.validate()?;
        let n = n as f64;
        if n * self.lower > 1.0 + WEIGHT_SUM_TOLERANCE || n * self.upper < 1.0 - WEIGHT_SUM_TOLERANCE {
            return Err(AnalysisError::invalid_input(
                "bounds",
                format!(
                    "no weight vector in [{}, {}] per asset can sum to 1 across {} assets",
                    self.lower, self.upper, n
                ),
            ));
        }
        Ok(())
    }
}

/// How random weight vectors are drawn for the sample cloud.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
pub enum WeightPolicy {
    /// Uniform(0,1) draws divided by their sum. Biased toward balanced
    /// allocations; the historical behaviour.
    #[default]
    UniformNormalized,
    /// Exponential draws divided by their sum: uniform over the simplex.
    FlatDirichlet,
}

/// How per-symbol histories with differing dates are reconciled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
pub enum AlignPolicy {
    /// Keep only dates present for every symbol.
    #[default]
    DropMissing,
    /// Keep every date from the first one all symbols share, carrying the
    /// last known close forward.
    ForwardFill,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SolverSettings {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub restarts: usize,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
            restarts: DEFAULT_RESTARTS,
        }
    }
}

/// Immutable run configuration threaded through every component.
#[derive(Clone, Debug, Serialize)]
pub struct AnalysisConfig {
    pub symbols: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub annualization_factor: f64,
    pub risk_free_rate: f64,
    pub num_portfolios: usize,
    pub weight_policy: WeightPolicy,
    pub bounds: WeightBounds,
    pub frontier_points: usize,
    pub align_policy: AlignPolicy,
    pub seed: Option<u64>,
    pub solver: SolverSettings,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            symbols: DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
            start_date: parse_date(DEFAULT_START_DATE).unwrap_or_default(),
            end_date: parse_date(DEFAULT_END_DATE).unwrap_or_default(),
            annualization_factor: TRADING_DAYS,
            risk_free_rate: DEFAULT_RISK_FREE_RATE,
            num_portfolios: DEFAULT_NUM_PORTFOLIOS,
            weight_policy: WeightPolicy::default(),
            bounds: WeightBounds::default(),
            frontier_points: DEFAULT_FRONTIER_POINTS,
            align_policy: AlignPolicy::default(),
            seed: None,
            solver: SolverSettings::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> AnalysisResult<()> {
        if self.symbols.is_empty() {
            return Err(AnalysisError::invalid_input("symbols", "at least one symbol is required"));
        }
        if self.start_date >= self.end_date {
            return Err(AnalysisError::invalid_input(
                "date_range",
                format!("start {} must precede end {}", self.start_date, self.end_date),
            ));
        }
        if !(self.annualization_factor.is_finite() && self.annualization_factor > 0.0) {
            return Err(AnalysisError::invalid_input(
                "annualization_factor",
                "must be a positive number",
            ));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(AnalysisError::invalid_input("risk_free_rate", "must be finite"));
        }
        if self.solver.max_iterations == 0 {
            return Err(AnalysisError::invalid_input("max_iterations", "must be at least 1"));
        }
        if !(self.solver.tolerance.is_finite() && self.solver.tolerance > 0.0) {
            return Err(AnalysisError::invalid_input("tolerance", "must be a positive number"));
        }
        self.bounds.validate()
    }

    pub fn validate_for_assets(&self, n: usize) -> AnalysisResult<()> {
        self.validate()?;
        self.bounds.validate_for_assets(n)
    }
}

pub fn parse_date(input: &str) -> AnalysisResult<NaiveDate> {
    let trimmed = input.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").map_err(|_| {
        AnalysisError::invalid_input("date", format!("invalid date '{}', use YYYY-MM-DD", trimmed))
    })
}

pub fn parse_symbols(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}
