//! Baseline-anchored categorical encoding.
//!
//! Every attribute expands into one indicator column per observed level. The
//! configured baseline is always the first column of its attribute block and
//! the remaining levels follow in order of first appearance in the data. The
//! resulting [`LevelCoordinate`] is the `level` dimension of every
//! coefficient vector, so its order is part of the model definition.

use std::collections::{HashMap, HashSet};

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::table::AnalysisTable;

/// One attribute column and its reference level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub column: String,
    pub baseline: String,
}

impl AttributeSpec {
    pub fn new(column: impl Into<String>, baseline: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            baseline: baseline.into(),
        }
    }
}

/// The six conjoint attributes of the carbon-storage survey.
pub fn default_attributes() -> Vec<AttributeSpec> {
    vec![
        AttributeSpec::new("attr_engagement", "inform"),
        AttributeSpec::new("attr_vicinity", "abroad"),
        AttributeSpec::new("attr_industry", "waste incineration"),
        AttributeSpec::new("attr_costs", "taxpayer"),
        AttributeSpec::new("attr_reason", "sparsely-populated"),
        AttributeSpec::new("attr_source_purpose", "domestic"),
    ]
}

/// Baseline first, then the other observed levels in first-seen order.
///
/// Returns `None` when the baseline never occurs in `observed`.
pub fn ordered_levels<'a, I>(observed: I, baseline: &str) -> Option<Vec<String>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    let mut levels = vec![baseline.to_string()];
    let mut baseline_seen = false;
    for level in observed {
        if level == baseline {
            baseline_seen = true;
            continue;
        }
        if seen.insert(level) {
            levels.push(level.to_string());
        }
    }
    baseline_seen.then_some(levels)
}

/// Indicator column name, matching the `<column>_<level>` dummy convention.
pub fn column_name(attribute: &str, level: &str) -> String {
    format!("{attribute}_{level}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelColumn {
    pub name: String,
    pub attribute: String,
    pub level: String,
}

/// Ordered `level` coordinate with an explicit name → index mapping.
#[derive(Debug, Clone)]
pub struct LevelCoordinate {
    columns: Vec<LevelColumn>,
    by_name: HashMap<String, usize>,
    by_level: HashMap<(String, String), usize>,
}

impl PartialEq for LevelCoordinate {
    fn eq(&self, other: &Self) -> bool {
        self.columns == other.columns
    }
}

impl LevelCoordinate {
    /// Build from per-attribute ordered level lists.
    ///
    /// A column name that already exists keeps its first owner; the later
    /// `(attribute, level)` pair then has no column.
    pub fn from_blocks(blocks: &[(String, Vec<String>)]) -> Self {
        let mut columns = Vec::new();
        let mut by_name = HashMap::new();
        let mut by_level = HashMap::new();
        for (attribute, levels) in blocks {
            for level in levels {
                let name = column_name(attribute, level);
                if by_name.contains_key(&name) {
                    tracing::warn!(column = %name, attribute = %attribute, "duplicate level column dropped");
                    continue;
                }
                let idx = columns.len();
                by_name.insert(name.clone(), idx);
                by_level.insert((attribute.clone(), level.clone()), idx);
                columns.push(LevelColumn {
                    name,
                    attribute: attribute.clone(),
                    level: level.clone(),
                });
            }
        }
        Self {
            columns,
            by_name,
            by_level,
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[LevelColumn] {
        &self.columns
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn column(&self, attribute: &str, level: &str) -> Option<usize> {
        self.by_level
            .get(&(attribute.to_string(), level.to_string()))
            .copied()
    }

    /// Column indices belonging to one attribute, baseline first.
    pub fn attribute_block(&self, attribute: &str) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.attribute == attribute)
            .map(|(i, _)| i)
            .collect()
    }

    /// Stable hash of the ordered column names.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for c in &self.columns {
            hasher.update(c.name.as_bytes());
            hasher.update(&[0]);
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Indicator matrix aligned row-for-row with the source table.
#[derive(Debug, Clone)]
pub struct EncodedTable {
    coordinate: LevelCoordinate,
    indicators: DMatrix<f64>,
}

impl EncodedTable {
    pub fn coordinate(&self) -> &LevelCoordinate {
        &self.coordinate
    }

    /// Rows × levels, 0/1 entries.
    pub fn indicators(&self) -> &DMatrix<f64> {
        &self.indicators
    }

    pub fn n_rows(&self) -> usize {
        self.indicators.nrows()
    }
}

#[derive(Debug, Clone)]
pub struct CategoricalEncoder {
    attributes: Vec<AttributeSpec>,
}

impl CategoricalEncoder {
    pub fn new(attributes: Vec<AttributeSpec>) -> Result<Self, ConfigError> {
        if attributes.is_empty() {
            return Err(ConfigError::NoAttributes);
        }
        let mut seen = HashSet::new();
        for a in &attributes {
            if !seen.insert(a.column.as_str()) {
                return Err(ConfigError::DuplicateAttribute(a.column.clone()));
            }
        }
        Ok(Self { attributes })
    }

    pub fn attributes(&self) -> &[AttributeSpec] {
        &self.attributes
    }

    /// Derive the level coordinate without building indicators.
    pub fn coordinate_for(&self, table: &AnalysisTable) -> Result<LevelCoordinate, ConfigError> {
        let mut blocks = Vec::with_capacity(self.attributes.len());
        for spec in &self.attributes {
            let position = table
                .schema()
                .attribute_position(&spec.column)
                .ok_or_else(|| ConfigError::UnknownAttribute(spec.column.clone()))?;
            if let Some(row) = table.rows().iter().position(|r| r.attributes.get(position).is_none()) {
                return Err(ConfigError::MissingLevel {
                    row,
                    attribute: spec.column.clone(),
                });
            }
            let levels = ordered_levels(table.attribute_values(position), &spec.baseline)
                .ok_or_else(|| ConfigError::UnknownBaseline {
                    attribute: spec.column.clone(),
                    baseline: spec.baseline.clone(),
                })?;
            blocks.push((spec.column.clone(), levels));
        }
        Ok(LevelCoordinate::from_blocks(&blocks))
    }

    pub fn encode(&self, table: &AnalysisTable) -> Result<EncodedTable, ConfigError> {
        let coordinate = self.coordinate_for(table)?;
        let positions: Vec<usize> = self
            .attributes
            .iter()
            .filter_map(|a| table.schema().attribute_position(&a.column))
            .collect();

        let mut indicators = DMatrix::<f64>::zeros(table.len(), coordinate.len());
        for (r, row) in table.rows().iter().enumerate() {
            for (spec, &pos) in self.attributes.iter().zip(&positions) {
                let Some(level) = row.attributes.get(pos) else {
                    continue;
                };
                if let Some(col) = coordinate.column(&spec.column, level) {
                    indicators[(r, col)] = 1.0;
                }
            }
        }

        tracing::info!(
            rows = table.len(),
            levels = coordinate.len(),
            fingerprint = %coordinate.fingerprint(),
            "encoded attribute levels"
        );
        Ok(EncodedTable {
            coordinate,
            indicators,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Package, PackageRow, TableSchema};

    fn table(levels: &[(&str, &str)]) -> AnalysisTable {
        let schema = TableSchema::new(vec!["attr_a".into(), "attr_b".into()], Vec::new());
        let rows = levels
            .iter()
            .enumerate()
            .map(|(i, (a, b))| {
                PackageRow::new(
                    "1",
                    i as u32,
                    Package::Left,
                    false,
                    "source",
                    "CH",
                    vec![a.to_string(), b.to_string()],
                )
            })
            .collect();
        AnalysisTable::new(schema, rows)
    }

    #[test]
    fn ordered_levels_keeps_first_seen_order_after_baseline() {
        let levels = ordered_levels(["z", "m", "base", "a", "m"], "base").unwrap();
        assert_eq!(levels, vec!["base", "z", "m", "a"]);
    }

    #[test]
    fn ordered_levels_requires_observed_baseline() {
        assert!(ordered_levels(["x", "y"], "base").is_none());
    }

    #[test]
    fn encode_places_baseline_first_in_each_block() {
        let t = table(&[("hi", "no"), ("lo", "yes"), ("hi", "yes")]);
        let enc = CategoricalEncoder::new(vec![
            AttributeSpec::new("attr_a", "lo"),
            AttributeSpec::new("attr_b", "yes"),
        ])
        .unwrap()
        .encode(&t)
        .unwrap();

        assert_eq!(
            enc.coordinate().names(),
            vec!["attr_a_lo", "attr_a_hi", "attr_b_yes", "attr_b_no"]
        );
        assert_eq!(enc.indicators().row(0).iter().copied().collect::<Vec<_>>(), vec![0.0, 1.0, 0.0, 1.0]);
        assert_eq!(enc.indicators().row(1).iter().copied().collect::<Vec<_>>(), vec![1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn single_level_attribute_yields_one_column() {
        let t = table(&[("only", "x"), ("only", "y")]);
        let enc = CategoricalEncoder::new(vec![
            AttributeSpec::new("attr_a", "only"),
            AttributeSpec::new("attr_b", "x"),
        ])
        .unwrap()
        .encode(&t)
        .unwrap();
        assert_eq!(enc.coordinate().attribute_block("attr_a"), vec![0]);
        assert!(enc.indicators().column(0).iter().all(|v| *v == 1.0));
    }

    #[test]
    fn missing_baseline_names_the_attribute() {
        let t = table(&[("hi", "no")]);
        let err = CategoricalEncoder::new(vec![AttributeSpec::new("attr_b", "maybe")])
            .unwrap()
            .encode(&t)
            .unwrap_err();
        match err {
            ConfigError::UnknownBaseline { attribute, .. } => assert_eq!(attribute, "attr_b"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_column_names_keep_first_occurrence() {
        let blocks = vec![
            ("attr_x".to_string(), vec!["a_b".to_string()]),
            ("attr_x_a".to_string(), vec!["b".to_string(), "c".to_string()]),
        ];
        let coord = LevelCoordinate::from_blocks(&blocks);
        assert_eq!(coord.names(), vec!["attr_x_a_b", "attr_x_a_c"]);
        assert_eq!(coord.column("attr_x", "a_b"), Some(0));
        assert_eq!(coord.column("attr_x_a", "b"), None);
    }

    #[test]
    fn fingerprint_tracks_column_order() {
        let ab = LevelCoordinate::from_blocks(&[("attr".into(), vec!["a".into(), "b".into()])]);
        let ba = LevelCoordinate::from_blocks(&[("attr".into(), vec!["b".into(), "a".into()])]);
        assert_ne!(ab.fingerprint(), ba.fingerprint());
        assert_eq!(ab.fingerprint(), ab.clone().fingerprint());
    }

    #[test]
    fn duplicate_attribute_config_is_rejected() {
        let err = CategoricalEncoder::new(vec![
            AttributeSpec::new("attr_a", "x"),
            AttributeSpec::new("attr_a", "y"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateAttribute(_)));
    }

    #[test]
    fn short_attribute_row_is_an_error_not_a_panic() {
        let mut t = table(&[("x", "p"), ("y", "q")]);
        let schema = t.schema().clone();
        let mut rows = t.rows().to_vec();
        rows[1].attributes.truncate(1);
        t = AnalysisTable::new(schema, rows);

        let encoder = CategoricalEncoder::new(vec![
            AttributeSpec::new("attr_a", "x"),
            AttributeSpec::new("attr_b", "p"),
        ])
        .unwrap();
        let err = encoder.coordinate_for(&t).unwrap_err();
        assert!(matches!(err, ConfigError::MissingLevel { row: 1, ref attribute } if attribute == "attr_b"));
        assert!(matches!(encoder.encode(&t), Err(ConfigError::MissingLevel { .. })));
    }
}
