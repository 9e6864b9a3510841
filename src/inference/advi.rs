//! Mean-field automatic differentiation variational inference.
//!
//! The approximation is a diagonal Gaussian `q(x) = N(mu, softplus(rho)^2)`.
//! Each iteration draws one reparameterized sample, forms the ELBO gradient
//! and takes a windowed-adagrad step: the step for every coordinate is scaled
//! by the root of its summed squared gradients over the last few iterations.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use super::{InferenceConfig, LogDensity};
use crate::model::softplus;

const ADAGRAD_WINDOW: usize = 10;
const ADAGRAD_EPSILON: f64 = 0.1;

/// Fitted approximation plus draws from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdviFit {
    pub mean: Vec<f64>,
    pub sd: Vec<f64>,
    /// Single-sample ELBO estimate per iteration.
    pub elbo: Vec<f64>,
    pub skipped_iterations: usize,
    #[serde(skip)]
    pub draws: Vec<Vec<f64>>,
}

impl AdviFit {
    /// Mean ELBO over the final tenth of the iterations.
    pub fn final_elbo(&self) -> f64 {
        let tail = (self.elbo.len() / 10).max(1).min(self.elbo.len());
        if tail == 0 {
            return f64::NAN;
        }
        self.elbo[self.elbo.len() - tail..].iter().sum::<f64>() / tail as f64
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

struct WindowedAdagrad {
    learning_rate: f64,
    history: VecDeque<Vec<f64>>,
    accu: Vec<f64>,
}

impl WindowedAdagrad {
    fn new(dim: usize, learning_rate: f64) -> Self {
        Self {
            learning_rate,
            history: VecDeque::with_capacity(ADAGRAD_WINDOW + 1),
            accu: vec![0.0; dim],
        }
    }

    /// Ascend `params` along `grad`.
    fn step(&mut self, params: &mut [f64], grad: &[f64]) {
        let squared: Vec<f64> = grad.iter().map(|g| g * g).collect();
        for (a, s) in self.accu.iter_mut().zip(&squared) {
            *a += s;
        }
        self.history.push_back(squared);
        if self.history.len() > ADAGRAD_WINDOW {
            if let Some(old) = self.history.pop_front() {
                for (a, s) in self.accu.iter_mut().zip(old) {
                    *a = (*a - s).max(0.0);
                }
            }
        }
        for ((x, g), a) in params.iter_mut().zip(grad).zip(&self.accu) {
            *x += self.learning_rate * g / (a + ADAGRAD_EPSILON).sqrt();
        }
    }
}

/// Fit the approximation for `config.advi_iterations` steps starting at zero.
pub fn fit_advi<M: LogDensity>(model: &M, config: &InferenceConfig) -> AdviFit {
    let dim = model.dim();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut mu = vec![0.0; dim];
    let mut rho = vec![0.0; dim];
    let mut mu_opt = WindowedAdagrad::new(dim, config.advi_learning_rate);
    let mut rho_opt = WindowedAdagrad::new(dim, config.advi_learning_rate);

    let mut eps = vec![0.0; dim];
    let mut x = vec![0.0; dim];
    let mut grad = vec![0.0; dim];
    let mut grad_mu = vec![0.0; dim];
    let mut grad_rho = vec![0.0; dim];
    let mut elbo = Vec::with_capacity(config.advi_iterations);
    let mut skipped = 0usize;

    for it in 0..config.advi_iterations {
        for i in 0..dim {
            eps[i] = rng.sample(StandardNormal);
            x[i] = mu[i] + softplus(rho[i]) * eps[i];
        }
        let logp = model.log_density_and_gradient(&x, &mut grad);
        if !logp.is_finite() || grad.iter().any(|g| !g.is_finite()) {
            skipped += 1;
            continue;
        }

        let mut entropy = 0.0;
        for i in 0..dim {
            let sd = softplus(rho[i]);
            entropy += sd.ln();
            grad_mu[i] = grad[i];
            grad_rho[i] = (grad[i] * eps[i] + 1.0 / sd) * sigmoid(rho[i]);
        }
        elbo.push(logp + entropy);
        mu_opt.step(&mut mu, &grad_mu);
        rho_opt.step(&mut rho, &grad_rho);

        if (it + 1) % 1000 == 0 {
            tracing::debug!(iteration = it + 1, elbo = logp + entropy, "advi progress");
        }
    }
    if skipped > 0 {
        tracing::warn!(skipped, "advi iterations skipped on non-finite gradient");
    }

    let sd: Vec<f64> = rho.iter().map(|r| softplus(*r)).collect();
    let draws = (0..config.advi_draws)
        .map(|_| {
            mu.iter()
                .zip(&sd)
                .map(|(m, s)| {
                    let z: f64 = rng.sample(StandardNormal);
                    m + s * z
                })
                .collect()
        })
        .collect();

    let fit = AdviFit {
        mean: mu,
        sd,
        elbo,
        skipped_iterations: skipped,
        draws,
    };
    tracing::info!(
        iterations = config.advi_iterations,
        final_elbo = fit.final_elbo(),
        "advi finished"
    );
    fit
}
