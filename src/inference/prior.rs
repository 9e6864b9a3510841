//! Prior predictive simulation.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::diagnostics::{summarize, VariableSummary};
use super::InferenceConfig;
use crate::archive::{model_coords, DrawSet, VariableDraws};
use crate::model::ChoiceModel;

pub const CHOICE_VARIABLE: &str = "choice_distribution";

/// Draws of every parameter block, the deterministics and simulated choices.
#[derive(Debug, Clone)]
pub struct PriorPredictive {
    pub samples: DrawSet,
    pub coords: BTreeMap<String, Vec<String>>,
}

impl PriorPredictive {
    /// Marginal summaries of the named variables.
    pub fn summary(&self, variables: &[&str]) -> Vec<VariableSummary> {
        summarize(&self.samples, variables, &self.coords)
    }

    /// Share of simulated tasks in which the left package was chosen.
    pub fn left_choice_rate(&self) -> Option<f64> {
        let v = self.samples.get(CHOICE_VARIABLE)?;
        if v.values.is_empty() {
            return None;
        }
        Some(v.values.iter().sum::<f64>() / v.values.len() as f64)
    }
}

/// `config.prior_samples` joint prior draws, seeded with `config.seed`.
pub fn sample_prior_predictive(model: &ChoiceModel, config: &InferenceConfig) -> PriorPredictive {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let positions: Vec<Vec<f64>> = (0..config.prior_samples)
        .map(|_| model.sample_prior(&mut rng))
        .collect();
    let mut samples = DrawSet::from_positions(model, &[positions.as_slice()], true);

    let n_tasks = model.n_tasks();
    let mut choices = Vec::with_capacity(config.prior_samples * n_tasks);
    for d in 0..config.prior_samples {
        if let Some(p) = samples.draw("probability_choice_left", 0, d) {
            let simulated = ChoiceModel::simulate_choices(p, &mut rng);
            choices.extend(simulated.into_iter().map(f64::from));
        }
    }
    samples.variables.insert(
        CHOICE_VARIABLE.to_string(),
        VariableDraws {
            dims: vec!["task".to_string()],
            shape: vec![n_tasks],
            values: choices,
        },
    );

    tracing::info!(
        draws = config.prior_samples,
        variables = samples.variables.len(),
        "prior predictive sampled"
    );
    PriorPredictive {
        samples,
        coords: model_coords(model),
    }
}
