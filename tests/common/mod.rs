#![allow(dead_code)]

use std::fmt::Write as _;

use ccs_conjoint::inference::InferenceConfig;
use ccs_conjoint::{AttributeSpec, ModelSpec, ModelVariant, RunConfig, TraitSpec};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const COSTS: [&str; 3] = ["taxpayer", "polluter", "consumer"];
pub const VICINITY: [&str; 2] = ["abroad", "domestic"];
pub const COUNTRIES: [&str; 2] = ["CH", "DE"];

pub fn model_spec(variant: ModelVariant) -> ModelSpec {
    ModelSpec {
        attributes: vec![
            AttributeSpec::new("attr_costs", "taxpayer"),
            AttributeSpec::new("attr_vicinity", "abroad"),
        ],
        traits: vec![TraitSpec::new("lreco", "theta_lreco", &["lreco_1", "lreco_2", "lreco_3"])],
        variant,
        expected_levels: None,
    }
}

/// Small, fast settings for sampling tests.
pub fn quick_config(variant: ModelVariant) -> RunConfig {
    RunConfig {
        model: model_spec(variant),
        inference: InferenceConfig {
            prior_samples: 50,
            advi_iterations: 300,
            advi_draws: 20,
            chains: 2,
            cores: 2,
            tune: 120,
            draws: 60,
            ..InferenceConfig::default()
        },
        ..RunConfig::default()
    }
}

/// Synthetic long-format survey: two rows per task, first individual
/// answers with baseline levels on the left so baselines always occur.
///
/// The first individual leaves `lreco_2` blank.
pub fn survey_csv(individuals: usize, tasks: u32, seed: u64) -> String {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = String::from(
        "id,task,package,chosen,framing,country,attr_costs,attr_vicinity,lreco_1,lreco_2,lreco_3,lreco\n",
    );
    for i in 0..individuals {
        let id = format!("r{i}");
        let framing = if i % 2 == 0 { "source" } else { "purpose" };
        let country = COUNTRIES[i % COUNTRIES.len()];
        let items: Vec<f64> = (0..3).map(|_| (rng.gen::<f64>() * 10.0).round() / 10.0).collect();
        let item_cells: Vec<String> = items
            .iter()
            .enumerate()
            .map(|(k, v)| if i == 0 && k == 1 { String::new() } else { format!("{v}") })
            .collect();
        let aggregate = if i == 0 {
            String::new()
        } else {
            format!("{}", items.iter().sum::<f64>())
        };

        for task in 1..=tasks {
            let pick = |rng: &mut StdRng, force_baseline: bool| {
                if force_baseline {
                    (COSTS[0], VICINITY[0])
                } else {
                    (COSTS[rng.gen_range(0..3)], VICINITY[rng.gen_range(0..2)])
                }
            };
            let left = pick(&mut rng, i == 0 && task == 1);
            let right = pick(&mut rng, false);
            let utility = |(costs, vicinity): (&str, &str)| {
                let mut u = 0.0_f64;
                if costs == "polluter" {
                    u += 1.0;
                }
                if vicinity == "domestic" {
                    u -= 0.5;
                }
                u
            };
            let p_left = 1.0 / (1.0 + (utility(right) - utility(left)).exp());
            let chose_left = rng.gen::<f64>() < p_left;

            for (package, (costs, vicinity), chosen) in [("1", left, chose_left), ("2", right, !chose_left)] {
                let _ = writeln!(
                    out,
                    "{id},{task},{package},{},{framing},{country},{costs},{vicinity},{},{},{},{aggregate}",
                    u8::from(chosen),
                    item_cells[0],
                    item_cells[1],
                    item_cells[2],
                );
            }
        }
    }
    out
}
