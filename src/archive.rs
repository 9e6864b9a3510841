//! Posterior archive: named draws addressable by variable, chain and draw.
//!
//! Values of every variable are stored chain-major: all draws of chain 0,
//! then chain 1, each draw holding the variable's elements in row-major
//! order of its shape. The archive is a single JSON document written to a
//! temporary file beside the destination and renamed into place, so readers
//! never observe a partial file.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, ShapeError};
use crate::inference::{AdviFit, ChainDraws, ConvergenceReport, InferenceConfig, SampleStats};
use crate::model::{ChoiceModel, ModelVariant, ParameterBlock};

pub const ARCHIVE_FORMAT_VERSION: u32 = 1;

pub const DETERMINISTICS: [&str; 3] = ["utility_left", "utility_right", "probability_choice_left"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDraws {
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl VariableDraws {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Draws of many variables over `chains × draws`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawSet {
    pub chains: usize,
    pub draws: usize,
    pub variables: BTreeMap<String, VariableDraws>,
}

impl DrawSet {
    pub fn new(chains: usize, draws: usize) -> Self {
        Self {
            chains,
            draws,
            variables: BTreeMap::new(),
        }
    }

    pub fn insert(
        &mut self,
        name: &str,
        dims: Vec<String>,
        shape: Vec<usize>,
        values: Vec<f64>,
    ) -> Result<(), ShapeError> {
        let expected = self.chains * self.draws * shape.iter().product::<usize>();
        if values.len() != expected {
            return Err(ShapeError::CoefficientLength {
                name: name.to_string(),
                expected,
                got: values.len(),
            });
        }
        self.variables
            .insert(name.to_string(), VariableDraws { dims, shape, values });
        Ok(())
    }

    /// Split per-chain parameter vectors into the model's named blocks,
    /// optionally adding per-task deterministics.
    pub fn from_positions(model: &ChoiceModel, chains: &[&[Vec<f64>]], with_deterministics: bool) -> Self {
        let draws = chains.first().map(|c| c.len()).unwrap_or(0);
        let mut set = Self::new(chains.len(), draws);
        for block in model.layout().blocks() {
            let mut values = Vec::with_capacity(chains.len() * draws * block.size());
            for chain in chains {
                for position in chain.iter() {
                    values.extend_from_slice(&position[block.range()]);
                }
            }
            set.variables.insert(
                block.name.clone(),
                VariableDraws {
                    dims: block.dims.clone(),
                    shape: block.shape.clone(),
                    values,
                },
            );
        }

        if with_deterministics {
            let n_tasks = model.n_tasks();
            let mut columns: [Vec<f64>; 3] = Default::default();
            for chain in chains {
                for position in chain.iter() {
                    let det = model.deterministics(position);
                    columns[0].extend(det.utility_left);
                    columns[1].extend(det.utility_right);
                    columns[2].extend(det.probability_choice_left);
                }
            }
            for (name, values) in DETERMINISTICS.iter().zip(columns) {
                set.variables.insert(
                    name.to_string(),
                    VariableDraws {
                        dims: vec!["task".to_string()],
                        shape: vec![n_tasks],
                        values,
                    },
                );
            }
        }
        set
    }

    pub fn get(&self, name: &str) -> Option<&VariableDraws> {
        self.variables.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(String::as_str)
    }

    /// Elements of `name` at one `(chain, draw)`.
    pub fn draw(&self, name: &str, chain: usize, draw: usize) -> Option<&[f64]> {
        if chain >= self.chains || draw >= self.draws {
            return None;
        }
        let var = self.variables.get(name)?;
        let size = var.element_count();
        let start = (chain * self.draws + draw) * size;
        var.values.get(start..start + size)
    }

    /// Per-chain trace of one element of `name`.
    pub fn chain_series(&self, name: &str, element: usize) -> Option<Vec<Vec<f64>>> {
        let var = self.variables.get(name)?;
        let size = var.element_count();
        if element >= size {
            return None;
        }
        Some(
            (0..self.chains)
                .map(|c| {
                    (0..self.draws)
                        .map(|d| var.values[(c * self.draws + d) * size + element])
                        .collect()
                })
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------
//  Persisted archive
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub variant: ModelVariant,
    pub level_fingerprint: String,
    pub parameters: Vec<ParameterBlock>,
}

/// Coordinate labels for every named dimension of a model.
pub fn model_coords(model: &ChoiceModel) -> BTreeMap<String, Vec<String>> {
    let design = model.design();
    let mut coords = BTreeMap::new();
    coords.insert("level".to_string(), design.coordinate().names());
    coords.insert("country".to_string(), design.country().categories().to_vec());
    coords.insert("framing".to_string(), design.framing().categories().to_vec());
    coords.insert("individual".to_string(), design.individuals().ids().to_vec());
    coords.insert(
        "task".to_string(),
        design
            .task_keys()
            .iter()
            .map(|k| format!("{}:{}", k.id, k.task))
            .collect(),
    );
    coords
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PosteriorArchive {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub model: ModelInfo,
    pub coords: BTreeMap<String, Vec<String>>,
    pub inference: InferenceConfig,
    pub posterior: DrawSet,
    /// One entry per chain, one stats record per retained draw.
    pub sample_stats: Vec<Vec<SampleStats>>,
    pub step_sizes: Vec<f64>,
    pub convergence: ConvergenceReport,
    pub advi: Option<AdviFit>,
}

impl PosteriorArchive {
    pub fn from_chains(
        model: &ChoiceModel,
        config: &InferenceConfig,
        chains: &[ChainDraws],
        advi: Option<AdviFit>,
    ) -> Self {
        let positions: Vec<&[Vec<f64>]> = chains.iter().map(|c| c.draws.as_slice()).collect();
        let posterior = DrawSet::from_positions(model, &positions, config.store_deterministics);
        let coords = model_coords(model);
        let parameter_names: Vec<&str> = model
            .layout()
            .blocks()
            .iter()
            .map(|b| b.name.as_str())
            .collect();
        let divergences = chains.iter().map(ChainDraws::divergences).sum();
        let summaries = crate::inference::summarize(&posterior, &parameter_names, &coords);
        let convergence = ConvergenceReport::from_summaries(&summaries, divergences, chains.len());

        Self {
            format_version: ARCHIVE_FORMAT_VERSION,
            created_at: Utc::now(),
            model: ModelInfo {
                variant: model.variant(),
                level_fingerprint: model.design().coordinate().fingerprint(),
                parameters: model.layout().blocks().to_vec(),
            },
            coords,
            inference: config.clone(),
            posterior,
            sample_stats: chains.iter().map(|c| c.stats.clone()).collect(),
            step_sizes: chains.iter().map(|c| c.step_size).collect(),
            convergence,
            advi,
        }
    }

    pub fn get(&self, name: &str) -> Result<&VariableDraws, ArchiveError> {
        self.posterior
            .get(name)
            .ok_or_else(|| ArchiveError::UnknownVariable(name.to_string()))
    }

    pub fn draw(&self, name: &str, chain: usize, draw: usize) -> Result<&[f64], ArchiveError> {
        self.get(name)?;
        self.posterior
            .draw(name, chain, draw)
            .ok_or_else(|| ArchiveError::UnknownVariable(format!("{name}[chain {chain}, draw {draw}]")))
    }

    /// Write to `path` via a temporary file in the same directory.
    pub fn write_atomic(&self, path: impl AsRef<Path>) -> Result<(), ArchiveError> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut writer, self)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path)?;
        tracing::info!(path = %path.display(), "archive written");
        Ok(())
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}
