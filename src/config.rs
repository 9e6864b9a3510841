//! Run configuration: model definition, priors and inference settings.
//!
//! Loaded from JSON; every field falls back to the survey analysis defaults,
//! so `{}` is a valid configuration for the basic model.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::encoding::{default_attributes, AttributeSpec, LevelCoordinate};
use crate::error::{ConfigError, ShapeError};
use crate::inference::InferenceConfig;
use crate::latent::{default_traits, TraitSpec};
use crate::model::{ModelVariant, Priors};
use crate::table::TableSchema;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpec {
    pub attributes: Vec<AttributeSpec>,
    pub traits: Vec<TraitSpec>,
    pub variant: ModelVariant,
    /// Level column names the design must produce, in order.
    pub expected_levels: Option<Vec<String>>,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            attributes: default_attributes(),
            traits: default_traits(),
            variant: ModelVariant::Basic,
            expected_levels: None,
        }
    }
}

impl ModelSpec {
    /// Columns the table loader must find for this variant.
    pub fn schema(&self) -> TableSchema {
        let traits = if self.variant.uses_traits() {
            self.traits.clone()
        } else {
            Vec::new()
        };
        TableSchema::new(
            self.attributes.iter().map(|a| a.column.clone()).collect(),
            traits,
        )
    }

    /// Compare a derived coordinate against `expected_levels`, if set.
    pub fn check_levels(&self, coordinate: &LevelCoordinate) -> Result<(), ShapeError> {
        let Some(expected) = &self.expected_levels else {
            return Ok(());
        };
        let found = coordinate.names();
        if &found != expected {
            return Err(ShapeError::CoordinateMismatch {
                expected: expected.join(","),
                found: found.join(","),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model: ModelSpec,
    pub priors: Priors,
    pub inference: InferenceConfig,
}

impl RunConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.attributes.is_empty() {
            return Err(ConfigError::NoAttributes);
        }
        let mut seen = HashSet::new();
        for a in &self.model.attributes {
            if a.column.trim().is_empty() || a.baseline.trim().is_empty() {
                return Err(ConfigError::InvalidSetting {
                    field: "model.attributes",
                    reason: format!("attribute {:?} needs a column and a baseline", a.column),
                });
            }
            if !seen.insert(a.column.as_str()) {
                return Err(ConfigError::DuplicateAttribute(a.column.clone()));
            }
        }
        if self.model.variant.uses_traits() {
            if self.model.traits.is_empty() {
                return Err(ConfigError::InvalidSetting {
                    field: "model.traits",
                    reason: format!("{} needs at least one trait", self.model.variant.as_str()),
                });
            }
            if let Some(t) = self.model.traits.iter().find(|t| t.items.is_empty()) {
                return Err(ConfigError::InvalidSetting {
                    field: "model.traits",
                    reason: format!("trait `{}` has no items", t.name),
                });
            }
        }

        let p = &self.priors;
        for (field, sigma) in [
            ("priors.beta_sigma", p.beta_sigma),
            ("priors.delta_sigma", p.delta_sigma),
            ("priors.gamma_sigma", p.gamma_sigma),
            ("priors.theta_sigma", p.theta_sigma),
            ("priors.latent_sigma", p.latent_sigma),
            ("priors.measurement_sigma", p.measurement_sigma),
        ] {
            if !(sigma > 0.0 && sigma.is_finite()) {
                return Err(ConfigError::InvalidSetting {
                    field,
                    reason: format!("must be a positive finite scale, got {sigma}"),
                });
            }
        }

        self.inference.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_analysis_defaults() {
        let config: RunConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.model.attributes.len(), 6);
        assert_eq!(config.priors.beta_sigma, 2.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let config: RunConfig =
            serde_json::from_str(r#"{"inference": {"chains": 2}, "model": {"variant": "hybrid"}}"#).unwrap();
        assert_eq!(config.inference.chains, 2);
        assert_eq!(config.inference.draws, 1000);
        assert_eq!(config.model.variant, ModelVariant::Hybrid);
        assert_eq!(config.model.schema().traits.len(), 3);
    }

    #[test]
    fn rejects_non_positive_prior_scale() {
        let mut config = RunConfig::default();
        config.priors.measurement_sigma = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSetting { field: "priors.measurement_sigma", .. })
        ));
    }

    #[test]
    fn basic_schema_skips_trait_columns() {
        let spec = ModelSpec::default();
        assert!(spec.schema().traits.is_empty());
        assert!(spec.schema().required_columns().contains(&"attr_costs".to_string()));
    }

    #[test]
    fn config_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let mut config = RunConfig::default();
        config.inference.seed = 7;
        std::fs::write(&path, config.to_json_pretty().unwrap()).unwrap();
        assert_eq!(RunConfig::from_path(&path).unwrap(), config);
    }
}
