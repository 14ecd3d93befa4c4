use crate::config::{WeightBounds, WeightPolicy};
use crate::error::{AnalysisError, AnalysisResult};
use crate::metrics::{PortfolioMetrics, metrics};
use crate::returns::ReturnStatistics;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

/// Draws per rayon task. Fixed so a seed reproduces the same cloud on any pool size.
const SAMPLES_PER_CHUNK: usize = 1024;

/// One randomly-weighted portfolio and its metrics.
#[derive(Clone, Debug, Serialize)]
pub struct PortfolioSample {
    pub weights: Vec<f64>,
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
}

impl PortfolioSample {
    fn new(weights: Vec<f64>, m: PortfolioMetrics) -> Self {
        Self {
            weights,
            expected_return: m.expected_return,
            volatility: m.volatility,
            sharpe_ratio: m.sharpe_ratio,
        }
    }
}

/// The exploratory cloud, in generation order.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SampleCloud {
    pub samples: Vec<PortfolioSample>,
    /// Draws dropped for zero volatility or out-of-bounds weights.
    pub discarded: usize,
}

impl SampleCloud {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Highest-Sharpe draw. Approximate only; the optimizer reports the optimum.
    pub fn best_by_sharpe(&self) -> Option<&PortfolioSample> {
        self.samples
            .iter()
            .max_by(|a, b| a.sharpe_ratio.total_cmp(&b.sharpe_ratio))
    }
}

/// Draws a weight vector that sums to 1.0 under `policy`.
///
/// `UniformNormalized` divides uniform(0,1) draws by their sum, which favours
/// balanced allocations over corners of the simplex.
pub fn generate_random_weights(n: usize, policy: WeightPolicy, rng: &mut impl Rng) -> Vec<f64> {
    let raw: Vec<f64> = match policy {
        WeightPolicy::UniformNormalized => (0..n).map(|_| rng.gen_range(0.0..1.0)).collect(),
        WeightPolicy::FlatDirichlet => {
            use rand_distr::{Distribution, Exp1};
            (0..n).map(|_| Exp1.sample(rng)).collect()
        }
    };
    let sum: f64 = raw.iter().sum();
    if sum <= f64::MIN_POSITIVE {
        return vec![1.0 / n as f64; n];
    }
    raw.iter().map(|v| v / sum).collect()
}

/// Monte Carlo sampler over a fixed set of return statistics.
pub struct MonteCarloSampler<'a> {
    stats: &'a ReturnStatistics,
    risk_free_rate: f64,
    policy: WeightPolicy,
    bounds: WeightBounds,
    seed: u64,
}

impl<'a> MonteCarloSampler<'a> {
    pub fn new(
        stats: &'a ReturnStatistics,
        risk_free_rate: f64,
        policy: WeightPolicy,
        bounds: WeightBounds,
        seed: Option<u64>,
    ) -> Self {
        Self {
            stats,
            risk_free_rate,
            policy,
            bounds,
            seed: seed.unwrap_or_else(|| rand::thread_rng().r#gen()),
        }
    }

    /// Draws up to `count` portfolios.
    ///
    /// Zero-volatility and out-of-bounds draws are dropped, so the cloud may be
    /// shorter than `count`. A non-PSD covariance aborts the whole run.
    pub fn sample(&self, count: usize) -> AnalysisResult<SampleCloud> {
        let n = self.stats.num_assets();
        if count == 0 {
            return Ok(SampleCloud::default());
        }
        if n == 0 {
            return Err(AnalysisError::InsufficientData("no assets to sample".to_string()));
        }

        info!(
            "Sampling {} random portfolios over {} assets ({:?})...",
            count, n, self.policy
        );

        let num_chunks = count.div_ceil(SAMPLES_PER_CHUNK);
        let chunks: Vec<AnalysisResult<(Vec<PortfolioSample>, usize)>> = (0..num_chunks)
            .into_par_iter()
            .map(|chunk| {
                let start = chunk * SAMPLES_PER_CHUNK;
                let len = SAMPLES_PER_CHUNK.min(count - start);
                self.sample_chunk(chunk as u64, len)
            })
            .collect();

        let mut cloud = SampleCloud {
            samples: Vec::with_capacity(count),
            discarded: 0,
        };
        for chunk in chunks {
            let (samples, discarded) = chunk?;
            cloud.samples.extend(samples);
            cloud.discarded += discarded;
        }

        if cloud.discarded > 0 {
            debug!("Discarded {} degenerate or out-of-bounds draws", cloud.discarded);
        }
        if let Some(best) = cloud.best_by_sharpe() {
            info!(
                "Sample cloud: {} portfolios, best sampled Sharpe={:.3} (E[r]={:.4}, σ={:.4})",
                cloud.len(),
                best.sharpe_ratio,
                best.expected_return,
                best.volatility
            );
        }
        Ok(cloud)
    }

    fn sample_chunk(&self, chunk: u64, len: usize) -> AnalysisResult<(Vec<PortfolioSample>, usize)> {
        // Distinct, well-mixed stream per chunk.
        let mut rng = StdRng::seed_from_u64(self.seed ^ chunk.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let n = self.stats.num_assets();

        let mut samples = Vec::with_capacity(len);
        let mut discarded = 0;
        for _ in 0..len {
            let weights = generate_random_weights(n, self.policy, &mut rng);
            if !self.bounds.admits(&weights) {
                discarded += 1;
                continue;
            }
            match metrics(
                &weights,
                &self.stats.mean_returns,
                &self.stats.covariance,
                self.risk_free_rate,
            ) {
                Ok(m) => samples.push(PortfolioSample::new(weights, m)),
                Err(AnalysisError::DivisionByZero { .. }) => discarded += 1,
                Err(e) => return Err(e),
            }
        }
        Ok((samples, discarded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WEIGHT_SUM_TOLERANCE;

    fn stats(means: Vec<f64>, covariance: Vec<Vec<f64>>) -> ReturnStatistics {
        ReturnStatistics {
            symbols: (0..means.len()).map(|i| format!("S{}", i)).collect(),
            log_returns: vec![],
            mean_returns: means,
            covariance,
            annualization_factor: 252.0,
        }
    }

    fn three_assets() -> ReturnStatistics {
        stats(
            vec![0.08, 0.12, 0.15],
            vec![
                vec![0.04, 0.006, 0.004],
                vec![0.006, 0.09, 0.02],
                vec![0.004, 0.02, 0.16],
            ],
        )
    }

    #[test]
    fn test_weights_sum_to_one() {
        let mut rng = StdRng::seed_from_u64(3);
        for policy in [WeightPolicy::UniformNormalized, WeightPolicy::FlatDirichlet] {
            for _ in 0..100 {
                let w = generate_random_weights(5, policy, &mut rng);
                let sum: f64 = w.iter().sum();
                assert!((sum - 1.0).abs() < 1e-10, "Weights should sum to 1.0, got {}", sum);
                assert!(w.iter().all(|&v| v >= 0.0), "Weights should be non-negative");
            }
        }
    }

    #[test]
    fn test_zero_samples_is_empty() {
        let s = three_assets();
        let sampler = MonteCarloSampler::new(&s, 0.0, WeightPolicy::default(), WeightBounds::default(), Some(1));
        let cloud = sampler.sample(0).unwrap();
        assert!(cloud.is_empty());
        assert_eq!(cloud.discarded, 0);
        assert!(cloud.best_by_sharpe().is_none());
    }

    #[test]
    fn test_ten_thousand_samples_within_bounds() {
        let s = three_assets();
        let sampler = MonteCarloSampler::new(&s, 0.0, WeightPolicy::default(), WeightBounds::default(), Some(42));
        let cloud = sampler.sample(10_000).unwrap();
        assert!(!cloud.is_empty());
        assert!(cloud.len() <= 10_000);
        assert_eq!(cloud.len() + cloud.discarded, 10_000);
        for sample in &cloud.samples {
            let sum: f64 = sample.weights.iter().sum();
            assert!((sum - 1.0).abs() < WEIGHT_SUM_TOLERANCE);
            assert!(sample.weights.iter().all(|&w| (0.0..=1.0).contains(&w)));
            assert!(sample.volatility > 0.0);
        }
    }

    #[test]
    fn test_seed_reproduces_cloud() {
        let s = three_assets();
        let a = MonteCarloSampler::new(&s, 0.01, WeightPolicy::default(), WeightBounds::default(), Some(9))
            .sample(3000)
            .unwrap();
        let b = MonteCarloSampler::new(&s, 0.01, WeightPolicy::default(), WeightBounds::default(), Some(9))
            .sample(3000)
            .unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.samples.iter().zip(b.samples.iter()) {
            assert_eq!(x.weights, y.weights);
            assert_eq!(x.sharpe_ratio.to_bits(), y.sharpe_ratio.to_bits());
        }
    }

    #[test]
    fn test_tight_bounds_discard_draws() {
        let s = three_assets();
        let bounds = WeightBounds::new(0.0, 0.4).unwrap();
        let cloud = MonteCarloSampler::new(&s, 0.0, WeightPolicy::default(), bounds, Some(5))
            .sample(2000)
            .unwrap();
        assert!(cloud.discarded > 0);
        assert!(cloud.samples.iter().all(|p| bounds.admits(&p.weights)));
    }

    #[test]
    fn test_zero_variance_universe_discards_everything() {
        let s = stats(vec![0.05, 0.05], vec![vec![0.0, 0.0], vec![0.0, 0.0]]);
        let cloud = MonteCarloSampler::new(&s, 0.0, WeightPolicy::default(), WeightBounds::default(), Some(2))
            .sample(100)
            .unwrap();
        assert!(cloud.is_empty());
        assert_eq!(cloud.discarded, 100);
    }

    #[test]
    fn test_non_psd_covariance_aborts() {
        let s = stats(vec![0.05, 0.05], vec![vec![0.04, -0.08], vec![-0.08, 0.04]]);
        let result = MonteCarloSampler::new(&s, 0.0, WeightPolicy::default(), WeightBounds::default(), Some(2))
            .sample(100);
        assert!(matches!(result, Err(AnalysisError::Numerical(_))));
    }

    #[test]
    fn test_best_sample_is_max_sharpe() {
        let s = three_assets();
        let cloud = MonteCarloSampler::new(&s, 0.0, WeightPolicy::FlatDirichlet, WeightBounds::default(), Some(8))
            .sample(500)
            .unwrap();
        let best = cloud.best_by_sharpe().unwrap();
        assert!(cloud.samples.iter().all(|p| p.sharpe_ratio <= best.sharpe_ratio));
    }
}
