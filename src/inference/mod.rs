//! Inference engine: prior predictive, mean-field ADVI and multi-chain NUTS.
//!
//! Every sampler works against [`LogDensity`], so the choice model and the
//! small Gaussian targets used in tests go through the same code.

pub mod advi;
pub mod diagnostics;
pub mod nuts;
pub mod prior;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, PipelineError};

pub use advi::{fit_advi, AdviFit};
pub use diagnostics::{summarize, ConvergenceReport, VariableSummary};
pub use nuts::{run_chain, ChainDraws, SampleStats};
pub use prior::{sample_prior_predictive, PriorPredictive};

/// Differentiable unnormalized log density over a flat parameter vector.
pub trait LogDensity: Sync {
    fn dim(&self) -> usize;

    /// Log density at `position`, with its gradient written into `grad`.
    fn log_density_and_gradient(&self, position: &[f64], grad: &mut [f64]) -> f64;
}

// ---------------------------------------------------------------------
//  Config
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub prior_samples: usize,
    pub advi_iterations: usize,
    pub advi_draws: usize,
    /// Base learning rate of the windowed adagrad optimizer.
    pub advi_learning_rate: f64,
    pub chains: usize,
    /// Upper bound on worker threads; the pool never exceeds `chains`.
    pub cores: usize,
    pub tune: usize,
    pub draws: usize,
    pub target_accept: f64,
    pub max_tree_depth: usize,
    /// Half-width of the uniform jitter applied to each chain's start point.
    pub init_jitter: f64,
    pub seed: u64,
    /// Keep per-task utilities and probabilities in the archive.
    pub store_deterministics: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            prior_samples: 1000,
            advi_iterations: 10_000,
            advi_draws: 1000,
            advi_learning_rate: 1e-3,
            chains: 4,
            cores: 6,
            tune: 500,
            draws: 1000,
            target_accept: 0.9,
            max_tree_depth: 10,
            init_jitter: 1.0,
            seed: 42,
            store_deterministics: true,
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| {
            Err(ConfigError::InvalidSetting {
                field,
                reason: reason.to_string(),
            })
        };
        if self.chains == 0 {
            return invalid("chains", "must be >= 1");
        }
        if self.cores == 0 {
            return invalid("cores", "must be >= 1");
        }
        if self.draws == 0 {
            return invalid("draws", "must be >= 1");
        }
        if self.prior_samples == 0 {
            return invalid("prior_samples", "must be >= 1");
        }
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return invalid("target_accept", "must lie strictly between 0 and 1");
        }
        if self.max_tree_depth == 0 || self.max_tree_depth > 15 {
            return invalid("max_tree_depth", "must be between 1 and 15");
        }
        if !(self.advi_learning_rate > 0.0 && self.advi_learning_rate.is_finite()) {
            return invalid("advi_learning_rate", "must be positive");
        }
        if !(self.init_jitter >= 0.0 && self.init_jitter.is_finite()) {
            return invalid("init_jitter", "must be non-negative");
        }
        Ok(())
    }

    pub fn worker_threads(&self) -> usize {
        self.cores.min(self.chains).max(1)
    }
}

/// Per-chain seed: the first 8 bytes of `blake3(seed_le || chain_le)`.
///
/// Stable across platforms and toolchains.
pub fn chain_seed(seed: u64, chain: usize) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed.to_le_bytes());
    hasher.update(&(chain as u64).to_le_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
    u64::from_le_bytes(out)
}

/// Run `config.chains` independent NUTS chains on a bounded thread pool.
///
/// Chains come back in chain order regardless of completion order.
pub fn sample_chains<M: LogDensity>(
    model: &M,
    config: &InferenceConfig,
) -> Result<Vec<ChainDraws>, PipelineError> {
    config.validate()?;
    let threads = config.worker_threads();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("nuts-{i}"))
        .build()?;

    tracing::info!(
        chains = config.chains,
        threads,
        tune = config.tune,
        draws = config.draws,
        "sampling"
    );
    let chains: Vec<ChainDraws> = pool.install(|| {
        (0..config.chains)
            .into_par_iter()
            .map(|chain| run_chain(model, config, chain))
            .collect()
    });

    for c in &chains {
        tracing::info!(
            chain = c.chain,
            step_size = c.step_size,
            divergences = c.divergences(),
            mean_accept = c.mean_accept_stat(),
            "chain finished"
        );
    }
    Ok(chains)
}

#[cfg(test)]
pub(crate) mod test_targets {
    use super::LogDensity;

    /// Independent Gaussians with the given means and scales.
    pub struct Gaussian {
        pub mean: Vec<f64>,
        pub sd: Vec<f64>,
    }

    impl LogDensity for Gaussian {
        fn dim(&self) -> usize {
            self.mean.len()
        }

        fn log_density_and_gradient(&self, position: &[f64], grad: &mut [f64]) -> f64 {
            let mut logp = 0.0;
            for i in 0..position.len() {
                let z = (position[i] - self.mean[i]) / self.sd[i];
                logp -= 0.5 * z * z;
                grad[i] = -z / self.sd[i];
            }
            logp
        }
    }
}
