mod common;

use ccs_conjoint::inference::prior::CHOICE_VARIABLE;
use ccs_conjoint::inference::{run_chain, sample_prior_predictive};
use ccs_conjoint::pipeline;
use ccs_conjoint::{AnalysisTable, ChoiceModel, DrawSet, LogDensity, ModelVariant, RunConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn model(variant: ModelVariant, individuals: usize, tasks: u32) -> (ChoiceModel, RunConfig) {
    let config = common::quick_config(variant);
    let csv = common::survey_csv(individuals, tasks, 7);
    let table = AnalysisTable::from_reader(csv.as_bytes(), config.model.schema()).unwrap();
    (pipeline::build_model(&table, &config).unwrap(), config)
}

fn assert_blocks_match_layout(model: &ChoiceModel, samples: &DrawSet, draws: usize) {
    for block in model.layout().blocks() {
        let var = samples
            .get(&block.name)
            .unwrap_or_else(|| panic!("block {} missing from prior draws", block.name));
        assert_eq!(var.shape, block.shape, "shape of {}", block.name);
        assert_eq!(var.values.len(), draws * block.size(), "values of {}", block.name);
    }
}

#[test]
fn hybrid_gradient_matches_finite_differences() {
    let (model, _) = model(ModelVariant::Hybrid, 5, 3);
    let mut rng = StdRng::seed_from_u64(3);
    let x = model.sample_prior(&mut rng);

    let mut grad = vec![0.0; model.dim()];
    let lp = model.log_density_and_gradient(&x, &mut grad);
    assert!((lp - model.log_density(&x)).abs() < 1e-9);

    let h = 1e-6;
    for i in 0..model.dim() {
        let mut up = x.clone();
        let mut down = x.clone();
        up[i] += h;
        down[i] -= h;
        let numeric = (model.log_density(&up) - model.log_density(&down)) / (2.0 * h);
        let scale = 1.0_f64.max(numeric.abs());
        assert!(
            (numeric - grad[i]).abs() / scale < 1e-4,
            "parameter {i}: analytic {} numeric {numeric}",
            grad[i]
        );
    }
}

#[test]
fn aggregate_variant_uses_fixed_indices() {
    let (model, _) = model(ModelVariant::HybridAggregate, 5, 3);
    assert!(model.layout().block("lreco").is_none());
    assert_eq!(model.n_tasks(), 12);
    assert!(!model.design().task_keys().iter().any(|k| k.id == "r0"));

    // theta enters the utility through the individual's index
    let mut coefs = model.zero_coefficients();
    coefs.theta[0][1] = 1.0;
    let det = model.utilities(&coefs).unwrap();
    assert!(det.utility_left.iter().chain(&det.utility_right).any(|u| *u != 0.0));
}

#[test]
fn latent_values_are_pulled_toward_item_scores() {
    let (model, _) = model(ModelVariant::Hybrid, 4, 2);
    let block = model.layout().block("lreco").unwrap().clone();
    let mut x = vec![0.0; model.dim()];
    let at_zero = model.log_density(&x);
    for v in &mut x[block.range()] {
        *v = 0.5;
    }
    // items are drawn from [0, 1]
    assert!(model.log_density(&x) > at_zero);
}

#[test]
fn prior_predictive_has_one_chain_of_prior_samples() {
    let (model, config) = model(ModelVariant::Basic, 6, 2);
    let prior = sample_prior_predictive(&model, &config.inference);

    assert_eq!(prior.samples.chains, 1);
    assert_eq!(prior.samples.draws, config.inference.prior_samples);
    let choices = prior.samples.get(CHOICE_VARIABLE).unwrap();
    assert_eq!(choices.shape, vec![model.n_tasks()]);
    assert_eq!(choices.values.len(), config.inference.prior_samples * model.n_tasks());
    assert!(choices.values.iter().all(|v| *v == 0.0 || *v == 1.0));

    let gamma = prior.samples.get("gamma").unwrap();
    assert_eq!(gamma.shape, vec![2, model.design().n_levels()]);
    assert_blocks_match_layout(&model, &prior.samples, config.inference.prior_samples);

    let rate = prior.left_choice_rate().unwrap();
    assert!((0.2..0.8).contains(&rate), "left rate {rate}");
    let summary = prior.summary(&["beta"]);
    assert_eq!(summary.len(), model.design().n_levels());
    assert!(summary.iter().all(|s| s.sd > 1.0 && s.hdi_low < s.hdi_high));
}

#[test]
fn hybrid_prior_predictive_holds_every_block() {
    let (model, config) = model(ModelVariant::Hybrid, 5, 2);
    let prior = sample_prior_predictive(&model, &config.inference);

    assert_eq!(prior.samples.get("theta_lreco").unwrap().shape, vec![model.design().n_levels()]);
    assert_eq!(prior.samples.get("lreco").unwrap().shape, vec![5]);
    assert_blocks_match_layout(&model, &prior.samples, config.inference.prior_samples);
}

#[test]
fn single_chain_on_hybrid_model_stays_finite() {
    let (model, mut config) = model(ModelVariant::Hybrid, 4, 3);
    config.inference.tune = 100;
    config.inference.draws = 30;
    let chain = run_chain(&model, &config.inference, 0);
    assert_eq!(chain.draws.len(), 30);
    assert_eq!(chain.stats.len(), 30);
    assert!(chain.draws.iter().flatten().all(|v| v.is_finite()));
    assert!(chain.step_size > 0.0);
    assert_eq!(chain.inverse_metric.len(), model.dim());
}
