//! Error types shared across the encoding, design and inference stages.
//!
//! Configuration and shape errors are fatal and raised before any sampling
//! work starts. Numerical trouble during sampling (divergences, poor mixing)
//! is not an error: it is recorded in the archive's diagnostics instead.

use thiserror::Error;

/// Problems reading the long-format analysis table.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("missing required column `{0}`")]
    MissingColumn(String),
    #[error("row {row}: invalid value {value:?} in column `{column}`: {reason}")]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
        reason: &'static str,
    },
}

/// The modeling configuration disagrees with itself or with the data.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("attribute `{attribute}`: baseline level {baseline:?} never appears in the data")]
    UnknownBaseline { attribute: String, baseline: String },
    #[error("row {row} has no level for attribute `{attribute}`")]
    MissingLevel { row: usize, attribute: String },
    #[error("attribute column `{0}` is not part of the table schema")]
    UnknownAttribute(String),
    #[error("no attributes configured")]
    NoAttributes,
    #[error("attribute `{0}` configured more than once")]
    DuplicateAttribute(String),
    #[error("framing must have at most 2 levels, found {0:?}")]
    FramingLevels(Vec<String>),
    #[error("invalid setting `{field}`: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Dimensions of two stages that must line up do not.
#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("left/right package counts differ: {left} left vs {right} right")]
    PackageCountMismatch { left: usize, right: usize },
    #[error("task ({id}, {task}) has no matching {missing} package")]
    UnpairedTask {
        id: String,
        task: u32,
        missing: &'static str,
    },
    #[error("task ({id}, {task}) has more than one {package} package")]
    DuplicatePackage {
        id: String,
        task: u32,
        package: &'static str,
    },
    #[error("level coordinate mismatch: design has {found}, model expects {expected}")]
    CoordinateMismatch { expected: String, found: String },
    #[error("coefficient `{name}` has length {got}, level coordinate has {expected}")]
    CoefficientLength {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("task {task} refers to individual index {index}, only {available} individuals known")]
    MissingIndividual {
        task: usize,
        index: usize,
        available: usize,
    },
    #[error("expected {expected} rows, got {got}")]
    EncodedRows { expected: usize, got: usize },
    #[error("design has no tasks")]
    Empty,
}

/// Failures while persisting or reading a posterior archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("failed to publish archive: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),
}

/// Top-level error for a full analysis run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
