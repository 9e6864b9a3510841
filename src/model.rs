//! Utility and choice-likelihood model.
//!
//! For task `t` answered by individual `i`:
//!
//! ```text
//! b[t]      = beta + delta * framing[t] + gamma[country[t]] + Σ_k theta_k * trait_k[i]
//! u_left    = x_left[t]  · b[t]
//! u_right   = x_right[t] · b[t]
//! chosen[t] ~ Bernoulli(exp(u_left) / (exp(u_left) + exp(u_right)))
//! ```
//!
//! All coefficient vectors have independent zero-mean Gaussian priors; `beta`
//! is wider (σ = 2) than the shift and moderation terms (σ = 1). Every block
//! lives in one flat parameter vector described by a [`ParameterLayout`].

use std::ops::Range;

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::design::DesignMatrix;
use crate::encoding::LevelCoordinate;
use crate::error::{ConfigError, PipelineError, ShapeError};
use crate::inference::LogDensity;
use crate::latent::{measurement_log_density, MeasurementData, TraitSpec};

// ---------------------------------------------------------------------
//  Configuration
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    /// Attribute levels, framing shift and country effects.
    Basic,
    /// Basic plus per-individual latent traits with a measurement model.
    Hybrid,
    /// Basic plus moderation by fixed, pre-aggregated trait indices.
    HybridAggregate,
}

impl ModelVariant {
    pub fn uses_traits(self) -> bool {
        !matches!(self, Self::Basic)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Hybrid => "hybrid",
            Self::HybridAggregate => "hybrid_aggregate",
        }
    }
}

/// Prior and measurement scales.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Priors {
    pub beta_sigma: f64,
    pub delta_sigma: f64,
    pub gamma_sigma: f64,
    pub theta_sigma: f64,
    pub latent_sigma: f64,
    /// Fixed noise of each observed trait item around its latent value.
    pub measurement_sigma: f64,
}

impl Default for Priors {
    fn default() -> Self {
        Self {
            beta_sigma: 2.0,
            delta_sigma: 1.0,
            gamma_sigma: 1.0,
            theta_sigma: 1.0,
            latent_sigma: 1.0,
            measurement_sigma: 0.1,
        }
    }
}

// ---------------------------------------------------------------------
//  Parameter layout
// ---------------------------------------------------------------------

/// One named block of the flat parameter vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterBlock {
    pub name: String,
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub offset: usize,
    pub prior_sigma: f64,
}

impl ParameterBlock {
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.size()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterLayout {
    blocks: Vec<ParameterBlock>,
    dim: usize,
}

impl ParameterLayout {
    fn push(&mut self, name: &str, dims: &[&str], shape: Vec<usize>, prior_sigma: f64) -> Range<usize> {
        let block = ParameterBlock {
            name: name.to_string(),
            dims: dims.iter().map(|d| d.to_string()).collect(),
            shape,
            offset: self.dim,
            prior_sigma,
        };
        let range = block.range();
        self.dim = range.end;
        self.blocks.push(block);
        range
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn blocks(&self) -> &[ParameterBlock] {
        &self.blocks
    }

    pub fn block(&self, name: &str) -> Option<&ParameterBlock> {
        self.blocks.iter().find(|b| b.name == name)
    }

    pub fn slice<'a>(&self, position: &'a [f64], name: &str) -> Option<&'a [f64]> {
        self.block(name).map(|b| &position[b.range()])
    }
}

// ---------------------------------------------------------------------
//  Numerics
// ---------------------------------------------------------------------

/// Probability that the left package is chosen.
///
/// Evaluated as a max-shifted softmax over the two utilities so neither
/// exponential can overflow. The result is kept strictly inside (0, 1).
pub fn choice_probability_left(utility_left: f64, utility_right: f64) -> f64 {
    let m = utility_left.max(utility_right);
    let el = (utility_left - m).exp();
    let er = (utility_right - m).exp();
    (el / (el + er)).clamp(f64::MIN_POSITIVE, 1.0 - f64::EPSILON / 2.0)
}

/// `ln(1 + e^x)` without overflow.
pub fn softplus(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

// ---------------------------------------------------------------------
//  Coefficients and deterministics
// ---------------------------------------------------------------------

/// Structured view of one parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Coefficients {
    pub beta: Vec<f64>,
    pub delta: Vec<f64>,
    /// Countries × levels.
    pub gamma: DMatrix<f64>,
    /// One moderation vector per trait.
    pub theta: Vec<Vec<f64>>,
    /// Latent value per trait per individual (hybrid variant only).
    pub latent: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDeterministics {
    pub utility_left: Vec<f64>,
    pub utility_right: Vec<f64>,
    pub probability_choice_left: Vec<f64>,
}

// ---------------------------------------------------------------------
//  Model
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ChoiceModel {
    variant: ModelVariant,
    priors: Priors,
    design: DesignMatrix,
    /// Left minus right indicators, tasks × levels.
    diff: DMatrix<f64>,
    layout: ParameterLayout,
    traits: Vec<TraitSpec>,
    measurement: Option<MeasurementData>,
    /// Individuals × traits, for the aggregate variant.
    fixed_traits: Option<DMatrix<f64>>,
    beta: Range<usize>,
    delta: Range<usize>,
    gamma: Range<usize>,
    theta: Vec<Range<usize>>,
    latent: Vec<Range<usize>>,
}

impl ChoiceModel {
    /// Build the model for `variant`.
    ///
    /// Hybrid variants need `measurement`. The aggregate variant drops tasks
    /// of individuals with any missing trait index.
    pub fn build(
        variant: ModelVariant,
        design: DesignMatrix,
        priors: Priors,
        measurement: Option<MeasurementData>,
    ) -> Result<Self, PipelineError> {
        let measurement = if variant.uses_traits() {
            match measurement {
                Some(m) if m.n_traits() > 0 => Some(m),
                _ => {
                    return Err(ConfigError::InvalidSetting {
                        field: "variant",
                        reason: format!("{} needs latent-trait columns", variant.as_str()),
                    }
                    .into())
                }
            }
        } else {
            None
        };

        let n_individuals = design.individuals().len();
        if let Some(m) = &measurement {
            if m.n_individuals() != n_individuals {
                return Err(ShapeError::MissingIndividual {
                    task: 0,
                    index: n_individuals,
                    available: m.n_individuals(),
                }
                .into());
            }
        }
        for (task, &index) in design.task_individual().iter().enumerate() {
            if index >= n_individuals {
                return Err(ShapeError::MissingIndividual {
                    task,
                    index,
                    available: n_individuals,
                }
                .into());
            }
        }

        let (design, fixed_traits) = match (&measurement, variant) {
            (Some(m), ModelVariant::HybridAggregate) => {
                let (design, fixed) = aggregate_covariates(design, m)?;
                (design, Some(fixed))
            }
            _ => (design, None),
        };

        let traits: Vec<TraitSpec> = measurement
            .as_ref()
            .map(|m| m.traits().iter().map(|t| t.spec.clone()).collect())
            .unwrap_or_default();

        let n_levels = design.n_levels();
        let n_countries = design.country().n_categories();
        let mut layout = ParameterLayout::default();
        let beta = layout.push("beta", &["level"], vec![n_levels], priors.beta_sigma);
        let delta = layout.push("delta", &["level"], vec![n_levels], priors.delta_sigma);
        let gamma = layout.push(
            "gamma",
            &["country", "level"],
            vec![n_countries, n_levels],
            priors.gamma_sigma,
        );
        let theta = traits
            .iter()
            .map(|t| layout.push(&t.moderation, &["level"], vec![n_levels], priors.theta_sigma))
            .collect();
        let latent = if variant == ModelVariant::Hybrid {
            traits
                .iter()
                .map(|t| layout.push(&t.name, &["individual"], vec![n_individuals], priors.latent_sigma))
                .collect()
        } else {
            Vec::new()
        };

        let diff = design.left() - design.right();
        tracing::info!(
            variant = variant.as_str(),
            parameters = layout.dim(),
            tasks = design.n_tasks(),
            "built choice model"
        );

        Ok(Self {
            variant,
            priors,
            design,
            diff,
            layout,
            traits,
            measurement,
            fixed_traits,
            beta,
            delta,
            gamma,
            theta,
            latent,
        })
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    pub fn priors(&self) -> &Priors {
        &self.priors
    }

    pub fn design(&self) -> &DesignMatrix {
        &self.design
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    pub fn traits(&self) -> &[TraitSpec] {
        &self.traits
    }

    pub fn n_tasks(&self) -> usize {
        self.design.n_tasks()
    }

    /// Fail unless the design was encoded with exactly `expected` levels.
    pub fn expect_coordinate(&self, expected: &LevelCoordinate) -> Result<(), ShapeError> {
        let found = self.design.coordinate();
        if found != expected {
            return Err(ShapeError::CoordinateMismatch {
                expected: format!("{} levels ({})", expected.len(), expected.fingerprint()),
                found: format!("{} levels ({})", found.len(), found.fingerprint()),
            });
        }
        Ok(())
    }

    fn trait_value(&self, position: &[f64], k: usize, individual: usize) -> f64 {
        match (&self.fixed_traits, self.latent.get(k)) {
            (Some(fixed), _) => fixed[(individual, k)],
            (None, Some(range)) => position[range.start + individual],
            (None, None) => 0.0,
        }
    }

    /// Effective coefficient vector of task `t` written into `out`.
    fn effective_coefficients(&self, position: &[f64], t: usize, out: &mut [f64]) {
        let n_levels = self.design.n_levels();
        let f = self.design.framing_code(t);
        let c = self.design.country().codes()[t];
        let i = self.design.task_individual()[t];
        let beta = &position[self.beta.clone()];
        let delta = &position[self.delta.clone()];
        let gamma_row = &position[self.gamma.start + c * n_levels..self.gamma.start + (c + 1) * n_levels];
        for l in 0..n_levels {
            out[l] = beta[l] + delta[l] * f + gamma_row[l];
        }
        for (k, range) in self.theta.iter().enumerate() {
            let z = self.trait_value(position, k, i);
            if z == 0.0 {
                continue;
            }
            for (o, th) in out.iter_mut().zip(&position[range.clone()]) {
                *o += th * z;
            }
        }
    }

    /// Per-task utilities and choice probabilities at `position`.
    pub fn deterministics(&self, position: &[f64]) -> TaskDeterministics {
        let n_tasks = self.design.n_tasks();
        let mut b = vec![0.0; self.design.n_levels()];
        let mut out = TaskDeterministics {
            utility_left: Vec::with_capacity(n_tasks),
            utility_right: Vec::with_capacity(n_tasks),
            probability_choice_left: Vec::with_capacity(n_tasks),
        };
        for t in 0..n_tasks {
            self.effective_coefficients(position, t, &mut b);
            let b = DVector::from_column_slice(&b);
            let ul = (self.design.left().row(t) * &b)[0];
            let ur = (self.design.right().row(t) * &b)[0];
            out.utility_left.push(ul);
            out.utility_right.push(ur);
            out.probability_choice_left.push(choice_probability_left(ul, ur));
        }
        out
    }

    /// Split a flat parameter vector into named coefficient blocks.
    pub fn unpack(&self, position: &[f64]) -> Coefficients {
        let n_levels = self.design.n_levels();
        let n_countries = self.design.country().n_categories();
        Coefficients {
            beta: position[self.beta.clone()].to_vec(),
            delta: position[self.delta.clone()].to_vec(),
            gamma: DMatrix::from_row_slice(n_countries, n_levels, &position[self.gamma.clone()]),
            theta: self.theta.iter().map(|r| position[r.clone()].to_vec()).collect(),
            latent: self.latent.iter().map(|r| position[r.clone()].to_vec()).collect(),
        }
    }

    /// Flatten coefficients, checking every block against the layout.
    pub fn pack(&self, coefficients: &Coefficients) -> Result<Vec<f64>, ShapeError> {
        let n_levels = self.design.n_levels();
        let n_countries = self.design.country().n_categories();
        let check = |name: &str, expected: usize, got: usize| -> Result<(), ShapeError> {
            if expected != got {
                return Err(ShapeError::CoefficientLength {
                    name: name.to_string(),
                    expected,
                    got,
                });
            }
            Ok(())
        };

        check("beta", n_levels, coefficients.beta.len())?;
        check("delta", n_levels, coefficients.delta.len())?;
        check("gamma", n_countries, coefficients.gamma.nrows())?;
        check("gamma", n_levels, coefficients.gamma.ncols())?;
        check("theta", self.theta.len(), coefficients.theta.len())?;
        check("latent", self.latent.len(), coefficients.latent.len())?;

        let mut position = vec![0.0; self.layout.dim()];
        position[self.beta.clone()].copy_from_slice(&coefficients.beta);
        position[self.delta.clone()].copy_from_slice(&coefficients.delta);
        for c in 0..n_countries {
            for l in 0..n_levels {
                position[self.gamma.start + c * n_levels + l] = coefficients.gamma[(c, l)];
            }
        }
        for (k, range) in self.theta.iter().enumerate() {
            check(&self.traits[k].moderation, range.len(), coefficients.theta[k].len())?;
            position[range.clone()].copy_from_slice(&coefficients.theta[k]);
        }
        for (k, range) in self.latent.iter().enumerate() {
            check(&self.traits[k].name, range.len(), coefficients.latent[k].len())?;
            position[range.clone()].copy_from_slice(&coefficients.latent[k]);
        }
        Ok(position)
    }

    /// All-zero coefficients with the right shapes.
    pub fn zero_coefficients(&self) -> Coefficients {
        self.unpack(&vec![0.0; self.layout.dim()])
    }

    /// Deterministics for structured coefficients.
    pub fn utilities(&self, coefficients: &Coefficients) -> Result<TaskDeterministics, ShapeError> {
        let position = self.pack(coefficients)?;
        Ok(self.deterministics(&position))
    }

    /// One joint draw from the priors.
    pub fn sample_prior<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let mut position = vec![0.0; self.layout.dim()];
        for block in self.layout.blocks() {
            for v in &mut position[block.range()] {
                let z: f64 = rng.sample(StandardNormal);
                *v = z * block.prior_sigma;
            }
        }
        position
    }

    /// Unnormalized log posterior, adding its gradient into `grad` when given.
    fn evaluate(&self, position: &[f64], mut grad: Option<&mut [f64]>) -> f64 {
        if let Some(g) = grad.as_deref_mut() {
            g.fill(0.0);
        }

        let mut logp = 0.0;
        for block in self.layout.blocks() {
            let inv_var = 1.0 / (block.prior_sigma * block.prior_sigma);
            for idx in block.range() {
                let x = position[idx];
                logp -= 0.5 * x * x * inv_var;
                if let Some(g) = grad.as_deref_mut() {
                    g[idx] -= x * inv_var;
                }
            }
        }

        let n_levels = self.design.n_levels();
        let mut b = vec![0.0; n_levels];
        let mut trait_values = vec![0.0; self.theta.len()];
        for t in 0..self.design.n_tasks() {
            self.effective_coefficients(position, t, &mut b);
            let row = self.diff.row(t);
            let mut d = 0.0;
            for l in 0..n_levels {
                d += row[l] * b[l];
            }
            let chosen = self.design.chosen()[t] == 1;
            logp -= if chosen { softplus(-d) } else { softplus(d) };

            let Some(g) = grad.as_deref_mut() else {
                continue;
            };
            let y = if chosen { 1.0 } else { 0.0 };
            let r = y - sigmoid(d);
            if r == 0.0 {
                continue;
            }
            let f = self.design.framing_code(t);
            let c = self.design.country().codes()[t];
            let i = self.design.task_individual()[t];
            for (k, z) in trait_values.iter_mut().enumerate() {
                *z = self.trait_value(position, k, i);
            }
            for l in 0..n_levels {
                let x = row[l];
                if x == 0.0 {
                    continue;
                }
                let rx = r * x;
                g[self.beta.start + l] += rx;
                g[self.delta.start + l] += rx * f;
                g[self.gamma.start + c * n_levels + l] += rx;
                for (k, range) in self.theta.iter().enumerate() {
                    g[range.start + l] += rx * trait_values[k];
                    if let Some(latent) = self.latent.get(k) {
                        g[latent.start + i] += rx * position[range.start + l];
                    }
                }
            }
        }

        if let Some(m) = &self.measurement {
            for (k, range) in self.latent.iter().enumerate() {
                let obs = &m.traits()[k].observations;
                let latent = &position[range.clone()];
                let g = grad.as_deref_mut().map(|g| &mut g[range.clone()]);
                logp += measurement_log_density(latent, obs, self.priors.measurement_sigma, g);
            }
        }
        logp
    }

    pub fn log_density(&self, position: &[f64]) -> f64 {
        self.evaluate(position, None)
    }

    /// Bernoulli draws of `chosen` given task probabilities.
    pub fn simulate_choices<R: Rng + ?Sized>(probabilities: &[f64], rng: &mut R) -> Vec<u8> {
        probabilities
            .iter()
            .map(|&p| u8::from(rng.gen::<f64>() < p))
            .collect()
    }
}

impl LogDensity for ChoiceModel {
    fn dim(&self) -> usize {
        self.layout.dim()
    }

    fn log_density_and_gradient(&self, position: &[f64], grad: &mut [f64]) -> f64 {
        self.evaluate(position, Some(grad))
    }
}

/// Fixed trait covariates from pre-aggregated indices, dropping tasks of
/// individuals with any missing index.
fn aggregate_covariates(
    design: DesignMatrix,
    measurement: &MeasurementData,
) -> Result<(DesignMatrix, DMatrix<f64>), ShapeError> {
    let n = design.individuals().len();
    let k = measurement.n_traits();
    let mut fixed = DMatrix::<f64>::zeros(n, k);
    let mut complete = vec![true; n];
    for (j, t) in measurement.traits().iter().enumerate() {
        for (i, value) in t.aggregates.iter().enumerate() {
            match value {
                Some(v) => fixed[(i, j)] = *v,
                None => complete[i] = false,
            }
        }
    }

    let keep: Vec<bool> = design
        .task_individual()
        .iter()
        .map(|&i| complete[i])
        .collect();
    let dropped = keep.iter().filter(|k| !**k).count();
    if dropped == 0 {
        return Ok((design, fixed));
    }
    tracing::warn!(
        dropped_tasks = dropped,
        "dropping tasks of individuals with missing trait indices"
    );
    Ok((design.retain_tasks(&keep)?, fixed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{AttributeSpec, CategoricalEncoder};
    use crate::table::{AnalysisTable, Package, PackageRow, TableSchema};

    fn two_task_model() -> ChoiceModel {
        let rows = vec![
            PackageRow::new("1", 1, Package::Left, true, "source", "CH", vec!["A".into()]),
            PackageRow::new("1", 1, Package::Right, false, "source", "CH", vec!["B".into()]),
            PackageRow::new("1", 2, Package::Left, false, "source", "CH", vec!["B".into()]),
            PackageRow::new("1", 2, Package::Right, false, "source", "CH", vec!["A".into()]),
        ];
        let table = AnalysisTable::new(TableSchema::new(vec!["attr_x".into()], Vec::new()), rows);
        let encoded = CategoricalEncoder::new(vec![AttributeSpec::new("attr_x", "A")])
            .unwrap()
            .encode(&table)
            .unwrap();
        let design = DesignMatrix::assemble(&table, &encoded).unwrap();
        ChoiceModel::build(ModelVariant::Basic, design, Priors::default(), None).unwrap()
    }

    #[test]
    fn stable_probability_survives_huge_utilities() {
        let naive = |ul: f64, ur: f64| ul.exp() / (ul.exp() + ur.exp());
        assert!(naive(800.0, 750.0).is_nan());
        for (ul, ur) in [(800.0, 750.0), (750.0, 800.0), (50.0, 0.0), (0.0, 50.0)] {
            let p = choice_probability_left(ul, ur);
            assert!(p.is_finite());
            assert!(p > 0.0 && p < 1.0, "p = {p}");
        }
    }

    #[test]
    fn softplus_matches_naive_form_in_safe_range() {
        for x in [-5.0, -0.5, 0.0, 0.5, 5.0] {
            assert!((softplus(x) - (1.0 + f64::exp(x)).ln()).abs() < 1e-12);
        }
        assert!((softplus(1000.0) - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn layout_orders_blocks_and_shapes() {
        let model = two_task_model();
        let names: Vec<&str> = model.layout().blocks().iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["beta", "delta", "gamma"]);
        assert_eq!(model.layout().block("gamma").unwrap().shape, vec![1, 2]);
        assert_eq!(model.layout().dim(), 6);
    }

    #[test]
    fn pack_rejects_wrong_coefficient_length() {
        let model = two_task_model();
        let mut coefs = model.zero_coefficients();
        coefs.beta = vec![0.0; 3];
        let err = model.pack(&coefs).unwrap_err();
        assert!(matches!(err, ShapeError::CoefficientLength { ref name, expected: 2, got: 3 } if name == "beta"));
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let model = two_task_model();
        let position = vec![0.3, -0.2, 0.5, 0.1, -0.4, 0.7];
        let mut grad = vec![0.0; position.len()];
        model.log_density_and_gradient(&position, &mut grad);
        let h = 1e-6;
        for i in 0..position.len() {
            let mut up = position.clone();
            let mut down = position.clone();
            up[i] += h;
            down[i] -= h;
            let fd = (model.log_density(&up) - model.log_density(&down)) / (2.0 * h);
            assert!((fd - grad[i]).abs() < 1e-5, "param {i}: fd {fd} vs grad {}", grad[i]);
        }
    }
}
