//! Load → encode → assemble → prior check → ADVI → NUTS → archive.
//!
//! Each stage consumes the immutable output of the previous one:
//! `AnalysisTable` → `EncodedTable` → `DesignMatrix` → `ChoiceModel` →
//! `PosteriorArchive`. Configuration and shape problems surface before any
//! sampling starts.
//!
//! Usage:
//! ```bash
//! conjoint fit --input choices.csv --out inference_basic_choice.json
//! ```

use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::archive::PosteriorArchive;
use crate::config::RunConfig;
use crate::design::DesignMatrix;
use crate::encoding::{CategoricalEncoder, LevelCoordinate};
use crate::error::PipelineError;
use crate::inference::{
    fit_advi, sample_chains, sample_prior_predictive, AdviFit, PriorPredictive, VariableSummary,
};
use crate::latent::MeasurementData;
use crate::model::ChoiceModel;
use crate::table::AnalysisTable;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Skip the variational smoke check before sampling.
    pub skip_advi: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: String,
    pub millis: u128,
}

/// Everything a full run produced besides the archive file itself.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub archive: PosteriorArchive,
    pub prior_summary: Vec<VariableSummary>,
    pub prior_left_rate: Option<f64>,
    pub timings: Vec<StageTiming>,
}

/// The coefficient blocks summarized after the prior check and the fit.
pub const SUMMARY_VARIABLES: [&str; 3] = ["beta", "delta", "gamma"];

struct Stopwatch {
    timings: Vec<StageTiming>,
    started: Instant,
}

impl Stopwatch {
    fn new() -> Self {
        Self {
            timings: Vec::new(),
            started: Instant::now(),
        }
    }

    fn lap(&mut self, stage: &str) {
        let millis = self.started.elapsed().as_millis();
        tracing::info!(stage, millis, "stage finished");
        self.timings.push(StageTiming {
            stage: stage.to_string(),
            millis,
        });
        self.started = Instant::now();
    }
}

// =============================================================================
// Stages
// =============================================================================

pub fn load_table(path: impl AsRef<Path>, config: &RunConfig) -> Result<AnalysisTable, PipelineError> {
    let path = path.as_ref();
    let table = AnalysisTable::from_csv_path(path, config.model.schema())?;
    tracing::info!(path = %path.display(), rows = table.len(), "loaded table");
    Ok(table)
}

/// Derive the level coordinate only.
pub fn level_coordinate(table: &AnalysisTable, config: &RunConfig) -> Result<LevelCoordinate, PipelineError> {
    let encoder = CategoricalEncoder::new(config.model.attributes.clone())?;
    let coordinate = encoder.coordinate_for(table)?;
    config.model.check_levels(&coordinate)?;
    Ok(coordinate)
}

/// Encode, assemble and build the configured model variant.
pub fn build_model(table: &AnalysisTable, config: &RunConfig) -> Result<ChoiceModel, PipelineError> {
    config.validate()?;
    let encoder = CategoricalEncoder::new(config.model.attributes.clone())?;
    let encoded = encoder.encode(table)?;
    config.model.check_levels(encoded.coordinate())?;

    let design = DesignMatrix::assemble(table, &encoded)?;
    let measurement = config
        .model
        .variant
        .uses_traits()
        .then(|| MeasurementData::from_table(table, &design));
    let model = ChoiceModel::build(config.model.variant, design, config.priors, measurement)?;
    model.expect_coordinate(encoded.coordinate())?;
    Ok(model)
}

pub fn prior_check(model: &ChoiceModel, config: &RunConfig) -> PriorPredictive {
    let prior = sample_prior_predictive(model, &config.inference);
    if let Some(rate) = prior.left_choice_rate() {
        tracing::info!(left_choice_rate = rate, "prior predictive choices");
    }
    prior
}

/// Variational fit; draws that are not all finite are reported, not fatal.
pub fn advi_check(model: &ChoiceModel, config: &RunConfig) -> AdviFit {
    let fit = fit_advi(model, &config.inference);
    let non_finite = fit
        .draws
        .iter()
        .filter(|d| d.iter().any(|v| !v.is_finite()))
        .count();
    if non_finite > 0 {
        tracing::warn!(non_finite, "advi produced non-finite draws");
    }
    fit
}

// =============================================================================
// Full run
// =============================================================================

pub fn run(table: &AnalysisTable, config: &RunConfig, options: &RunOptions) -> Result<RunOutcome, PipelineError> {
    let mut clock = Stopwatch::new();
    let model = build_model(table, config)?;
    clock.lap("build_model");

    let prior = prior_check(&model, config);
    let prior_summary = prior.summary(&SUMMARY_VARIABLES);
    let prior_left_rate = prior.left_choice_rate();
    drop(prior);
    clock.lap("prior_predictive");

    let advi = if options.skip_advi {
        None
    } else {
        let fit = advi_check(&model, config);
        clock.lap("advi");
        Some(fit)
    };

    let chains = sample_chains(&model, &config.inference)?;
    clock.lap("nuts");

    let archive = PosteriorArchive::from_chains(&model, &config.inference, &chains, advi);
    clock.lap("diagnostics");
    if archive.convergence.flagged {
        tracing::warn!(
            caveats = archive.convergence.caveats.len(),
            "posterior flagged; see archive convergence caveats"
        );
    }

    Ok(RunOutcome {
        archive,
        prior_summary,
        prior_left_rate,
        timings: clock.timings,
    })
}

/// Load `input`, run every stage and publish the archive at `out`.
pub fn run_to_path(
    input: impl AsRef<Path>,
    out: impl AsRef<Path>,
    config: &RunConfig,
    options: &RunOptions,
) -> Result<RunOutcome, PipelineError> {
    let table = load_table(input, config)?;
    let outcome = run(&table, config, options)?;
    outcome.archive.write_atomic(out)?;
    Ok(outcome)
}
