#![forbid(unsafe_code)]

//! # ccs-conjoint
//!
//! Bayesian discrete-choice models for a two-package conjoint survey on
//! carbon capture and storage.
//!
//! Respondents repeatedly pick one of two policy packages. Each package is
//! described by categorical attributes; the model explains the choice through
//! per-level utilities that shift with the question framing, the respondent's
//! country and, in the hybrid variants, the respondent's latent political
//! traits. Posteriors are sampled with NUTS and written to a JSON archive
//! addressable by variable, chain and draw.

pub mod archive;
pub mod config;
pub mod design;
pub mod encoding;
pub mod error;
pub mod inference;
pub mod latent;
pub mod model;
pub mod pipeline;
pub mod table;

pub use archive::{DrawSet, PosteriorArchive, VariableDraws};
pub use config::{ModelSpec, RunConfig};
pub use design::DesignMatrix;
pub use encoding::{ordered_levels, AttributeSpec, CategoricalEncoder, EncodedTable, LevelCoordinate};
pub use error::{ArchiveError, ConfigError, PipelineError, ShapeError, TableError};
pub use inference::{InferenceConfig, LogDensity};
pub use latent::{MeasurementData, TraitSpec};
pub use model::{choice_probability_left, ChoiceModel, Coefficients, ModelVariant, Priors};
pub use pipeline::{run, run_to_path, RunOptions, RunOutcome};
pub use table::{AnalysisTable, Package, PackageRow, TableSchema};
