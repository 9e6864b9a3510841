//! Latent-trait measurement model for the hybrid choice model.
//!
//! Each individual carries one unobserved value per trait with a
//! `Normal(0, latent_sigma)` prior. Every observed item score is a noisy
//! reading of that value: `item ~ Normal(latent, measurement_sigma)`. A
//! missing item simply contributes no observation, so an individual with
//! partial answers stays in the model.

use serde::{Deserialize, Serialize};

use crate::design::DesignMatrix;
use crate::table::AnalysisTable;

/// One latent trait: its name, the moderation coefficient it drives, and its items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitSpec {
    /// Latent variable name; also the pre-aggregated index column.
    pub name: String,
    /// Name of the per-level moderation coefficient vector.
    pub moderation: String,
    pub items: Vec<String>,
}

impl TraitSpec {
    pub fn new(name: &str, moderation: &str, items: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            moderation: moderation.to_string(),
            items: items.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Economic left-right, social-cultural and socio-ecological traits.
pub fn default_traits() -> Vec<TraitSpec> {
    vec![
        TraitSpec::new("lreco", "theta_lreco", &["lreco_1", "lreco_2", "lreco_3"]),
        TraitSpec::new("galtan", "theta_galtan", &["galtan_1", "galtan_2", "galtan_3"]),
        TraitSpec::new(
            "socio_ecol",
            "theta_ecol",
            &["socio_ecological_1", "socio_ecological_2", "socio_ecological_3"],
        ),
    ]
}

/// Sum of item scores, missing if any item is missing.
pub fn aggregate_index(items: &[Option<f64>]) -> Option<f64> {
    items.iter().copied().sum()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ItemObservation {
    pub individual: usize,
    pub item: usize,
    pub value: f64,
}

/// Observed items and aggregates of one trait, indexed by individual.
#[derive(Debug, Clone)]
pub struct TraitMeasurements {
    pub spec: TraitSpec,
    pub observations: Vec<ItemObservation>,
    /// Table aggregate if present, otherwise [`aggregate_index`] of the items.
    pub aggregates: Vec<Option<f64>>,
}

impl TraitMeasurements {
    pub fn missing_items(&self, n_individuals: usize) -> usize {
        (n_individuals * self.spec.items.len()).saturating_sub(self.observations.len())
    }
}

#[derive(Debug, Clone)]
pub struct MeasurementData {
    n_individuals: usize,
    traits: Vec<TraitMeasurements>,
}

impl MeasurementData {
    /// Collect item scores per individual. The first row seen for an
    /// individual supplies its answers; later rows repeat them.
    pub fn from_table(table: &AnalysisTable, design: &DesignMatrix) -> Self {
        let n = design.individuals().len();
        let specs = &table.schema().traits;
        let mut seen = vec![false; n];
        let mut traits: Vec<TraitMeasurements> = specs
            .iter()
            .map(|spec| TraitMeasurements {
                spec: spec.clone(),
                observations: Vec::new(),
                aggregates: vec![None; n],
            })
            .collect();

        for row in table.rows() {
            let Some(individual) = design.individuals().get(&row.id) else {
                continue;
            };
            if seen[individual] {
                continue;
            }
            seen[individual] = true;
            for (k, measurements) in traits.iter_mut().enumerate() {
                let items = row.items.get(k).map(Vec::as_slice).unwrap_or(&[]);
                for (item, value) in items.iter().enumerate() {
                    if let Some(value) = value {
                        measurements.observations.push(ItemObservation {
                            individual,
                            item,
                            value: *value,
                        });
                    }
                }
                measurements.aggregates[individual] = row
                    .aggregates
                    .get(k)
                    .copied()
                    .flatten()
                    .or_else(|| aggregate_index(items));
            }
        }

        for t in &traits {
            tracing::debug!(
                trait_name = %t.spec.name,
                observations = t.observations.len(),
                missing = t.missing_items(n),
                "collected trait items"
            );
        }
        Self {
            n_individuals: n,
            traits,
        }
    }

    pub fn n_individuals(&self) -> usize {
        self.n_individuals
    }

    pub fn traits(&self) -> &[TraitMeasurements] {
        &self.traits
    }

    pub fn n_traits(&self) -> usize {
        self.traits.len()
    }
}

/// Measurement log density of one trait, adding `d/d latent` into `grad`.
///
/// `latent` and `grad` are the per-individual slices of this trait.
pub fn measurement_log_density(
    latent: &[f64],
    observations: &[ItemObservation],
    noise_sigma: f64,
    mut grad: Option<&mut [f64]>,
) -> f64 {
    let inv_var = 1.0 / (noise_sigma * noise_sigma);
    let mut logp = 0.0;
    for obs in observations {
        let resid = obs.value - latent[obs.individual];
        logp -= 0.5 * resid * resid * inv_var;
        if let Some(g) = grad.as_deref_mut() {
            g[obs.individual] += resid * inv_var;
        }
    }
    logp
}
