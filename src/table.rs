//! Long-format analysis table: one row per (individual, task, package).
//!
//! The column set is declared up front by a [`TableSchema`] and checked when
//! the CSV header is read. Attribute columns are never discovered by name
//! prefix; a missing column fails the load instead of silently shifting
//! which columns the encoder sees.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord};
use serde::{Deserialize, Serialize};

use crate::error::TableError;
use crate::latent::TraitSpec;

pub const ID_COLUMN: &str = "id";
pub const TASK_COLUMN: &str = "task";
pub const PACKAGE_COLUMN: &str = "package";
pub const CHOSEN_COLUMN: &str = "chosen";
pub const FRAMING_COLUMN: &str = "framing";
pub const COUNTRY_COLUMN: &str = "country";

/// Which side of the choice task a package row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Package {
    /// Package `"1"`; `chosen` is defined relative to it.
    Left,
    /// Package `"2"`.
    Right,
}

impl Package {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "1" | "1.0" => Some(Self::Left),
            "2" | "2.0" => Some(Self::Right),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

/// Declared column layout of the analysis table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Attribute columns, e.g. `attr_costs`, in the order rows store them.
    pub attributes: Vec<String>,
    /// Latent-trait item groups; empty for the basic model.
    #[serde(default)]
    pub traits: Vec<TraitSpec>,
}

impl TableSchema {
    pub fn new(attributes: Vec<String>, traits: Vec<TraitSpec>) -> Self {
        Self { attributes, traits }
    }

    /// Every column the loader insists on, in a stable order.
    pub fn required_columns(&self) -> Vec<String> {
        let mut cols: Vec<String> = [
            ID_COLUMN,
            TASK_COLUMN,
            PACKAGE_COLUMN,
            CHOSEN_COLUMN,
            FRAMING_COLUMN,
            COUNTRY_COLUMN,
        ]
        .iter()
        .map(|c| c.to_string())
        .collect();
        cols.extend(self.attributes.iter().cloned());
        for t in &self.traits {
            cols.extend(t.items.iter().cloned());
            cols.push(t.name.clone());
        }
        cols
    }

    pub fn attribute_position(&self, column: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a == column)
    }
}

/// One package of one choice task.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageRow {
    pub id: String,
    pub task: u32,
    pub package: Package,
    pub chosen: bool,
    pub framing: String,
    pub country: String,
    /// Level per attribute, aligned with [`TableSchema::attributes`].
    pub attributes: Vec<String>,
    /// Item scores per trait, aligned with [`TableSchema::traits`].
    pub items: Vec<Vec<Option<f64>>>,
    /// Pre-aggregated trait index per trait (the non-latent simplification).
    pub aggregates: Vec<Option<f64>>,
}

impl PackageRow {
    pub fn new(
        id: impl Into<String>,
        task: u32,
        package: Package,
        chosen: bool,
        framing: impl Into<String>,
        country: impl Into<String>,
        attributes: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            task,
            package,
            chosen,
            framing: framing.into(),
            country: country.into(),
            attributes,
            items: Vec::new(),
            aggregates: Vec::new(),
        }
    }

    pub fn with_traits(mut self, items: Vec<Vec<Option<f64>>>, aggregates: Vec<Option<f64>>) -> Self {
        self.items = items;
        self.aggregates = aggregates;
        self
    }
}

/// Immutable analysis table. Later stages derive new values from it.
#[derive(Debug, Clone)]
pub struct AnalysisTable {
    schema: TableSchema,
    rows: Vec<PackageRow>,
}

impl AnalysisTable {
    pub fn new(schema: TableSchema, rows: Vec<PackageRow>) -> Self {
        Self { schema, rows }
    }

    pub fn from_csv_path(path: impl AsRef<Path>, schema: TableSchema) -> Result<Self, TableError> {
        let file = File::open(path)?;
        Self::from_reader(file, schema)
    }

    pub fn from_reader<R: Read>(reader: R, schema: TableSchema) -> Result<Self, TableError> {
        let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(reader);
        let headers = rdr.headers()?.clone();
        let columns = ColumnMap::resolve(&headers, &schema)?;

        let mut rows = Vec::new();
        for (i, record) in rdr.records().enumerate() {
            let record = record?;
            // Header is line 1.
            rows.push(columns.parse_row(&record, &schema, i + 2)?);
        }
        tracing::debug!(rows = rows.len(), "loaded analysis table");
        Ok(Self { schema, rows })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn rows(&self) -> &[PackageRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one attribute column in row order.
    pub fn attribute_values(&self, position: usize) -> impl Iterator<Item = &str> + '_ {
        self.rows
            .iter()
            .filter_map(move |r| r.attributes.get(position).map(String::as_str))
    }
}

// ---------------------------------------------------------------------
//  CSV parsing
// ---------------------------------------------------------------------

struct ColumnMap {
    id: usize,
    task: usize,
    package: usize,
    chosen: usize,
    framing: usize,
    country: usize,
    attributes: Vec<usize>,
    items: Vec<Vec<usize>>,
    aggregates: Vec<usize>,
}

impl ColumnMap {
    fn resolve(headers: &StringRecord, schema: &TableSchema) -> Result<Self, TableError> {
        let by_name: HashMap<&str, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim(), i))
            .collect();
        let find = |name: &str| -> Result<usize, TableError> {
            by_name
                .get(name)
                .copied()
                .ok_or_else(|| TableError::MissingColumn(name.to_string()))
        };

        let mut items = Vec::with_capacity(schema.traits.len());
        let mut aggregates = Vec::with_capacity(schema.traits.len());
        for t in &schema.traits {
            items.push(t.items.iter().map(|c| find(c.as_str())).collect::<Result<Vec<_>, _>>()?);
            aggregates.push(find(t.name.as_str())?);
        }

        Ok(Self {
            id: find(ID_COLUMN)?,
            task: find(TASK_COLUMN)?,
            package: find(PACKAGE_COLUMN)?,
            chosen: find(CHOSEN_COLUMN)?,
            framing: find(FRAMING_COLUMN)?,
            country: find(COUNTRY_COLUMN)?,
            attributes: schema
                .attributes
                .iter()
                .map(|c| find(c.as_str()))
                .collect::<Result<Vec<_>, _>>()?,
            items,
            aggregates,
        })
    }

    fn parse_row(
        &self,
        record: &StringRecord,
        schema: &TableSchema,
        line: usize,
    ) -> Result<PackageRow, TableError> {
        let cell = |idx: usize| record.get(idx).unwrap_or("").trim();
        let invalid = |column: &str, value: &str, reason: &'static str| TableError::InvalidValue {
            row: line,
            column: column.to_string(),
            value: value.to_string(),
            reason,
        };

        let id = cell(self.id);
        if id.is_empty() {
            return Err(invalid(ID_COLUMN, id, "empty individual id"));
        }
        let task_raw = cell(self.task);
        let task = parse_task(task_raw).ok_or_else(|| invalid(TASK_COLUMN, task_raw, "expected a task number"))?;
        let package_raw = cell(self.package);
        let package = Package::parse(package_raw)
            .ok_or_else(|| invalid(PACKAGE_COLUMN, package_raw, "expected \"1\" or \"2\""))?;
        let chosen_raw = cell(self.chosen);
        let chosen = parse_flag(chosen_raw).ok_or_else(|| invalid(CHOSEN_COLUMN, chosen_raw, "expected 0 or 1"))?;

        let framing = cell(self.framing);
        if framing.is_empty() {
            return Err(invalid(FRAMING_COLUMN, framing, "empty framing"));
        }
        let country = cell(self.country);
        if country.is_empty() {
            return Err(invalid(COUNTRY_COLUMN, country, "empty country"));
        }

        let mut attributes = Vec::with_capacity(self.attributes.len());
        for (name, &idx) in schema.attributes.iter().zip(&self.attributes) {
            let level = cell(idx);
            if level.is_empty() {
                return Err(invalid(name.as_str(), level, "empty attribute level"));
            }
            attributes.push(level.to_string());
        }

        let mut items = Vec::with_capacity(self.items.len());
        let mut aggregates = Vec::with_capacity(self.aggregates.len());
        for (t, spec) in schema.traits.iter().enumerate() {
            let mut scores = Vec::with_capacity(spec.items.len());
            for (name, &idx) in spec.items.iter().zip(&self.items[t]) {
                let raw = cell(idx);
                let score = parse_optional(raw).ok_or_else(|| invalid(name.as_str(), raw, "expected a number"))?;
                if let Some(v) = score {
                    if !(0.0..=1.0).contains(&v) {
                        return Err(invalid(name.as_str(), raw, "item score outside [0, 1]"));
                    }
                }
                scores.push(score);
            }
            items.push(scores);

            let raw = cell(self.aggregates[t]);
            aggregates.push(parse_optional(raw).ok_or_else(|| invalid(spec.name.as_str(), raw, "expected a number"))?);
        }

        Ok(PackageRow {
            id: id.to_string(),
            task,
            package,
            chosen,
            framing: framing.to_string(),
            country: country.to_string(),
            attributes,
            items,
            aggregates,
        })
    }
}

fn parse_task(raw: &str) -> Option<u32> {
    if let Ok(v) = raw.parse::<u32>() {
        return Some(v);
    }
    let v = raw.parse::<f64>().ok()?;
    if v.fract() == 0.0 && v >= 0.0 && v <= u32::MAX as f64 {
        Some(v as u32)
    } else {
        None
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw {
        "1" | "1.0" | "True" | "true" => Some(true),
        "0" | "0.0" | "False" | "false" => Some(false),
        _ => None,
    }
}

/// Blank and NaN cells are missing; anything else must parse as a float.
fn parse_optional(raw: &str) -> Option<Option<f64>> {
    if raw.is_empty() || raw.eq_ignore_ascii_case("nan") || raw.eq_ignore_ascii_case("na") {
        return Some(None);
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite()).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TableSchema {
        TableSchema::new(vec!["attr_costs".to_string()], Vec::new())
    }

    #[test]
    fn loads_rows_in_file_order() {
        let csv = "id,task,package,chosen,framing,country,attr_costs,extra\n\
                   7,1,1,1,source,CH,taxpayer,x\n\
                   7,1,2,0,source,CH,industry,y\n";
        let table = AnalysisTable::from_reader(csv.as_bytes(), schema()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[0].package, Package::Left);
        assert!(table.rows()[0].chosen);
        assert_eq!(table.rows()[1].attributes, vec!["industry".to_string()]);
    }

    #[test]
    fn missing_attribute_column_fails_fast() {
        let csv = "id,task,package,chosen,framing,country,attr_cost\n7,1,1,1,source,CH,taxpayer\n";
        let err = AnalysisTable::from_reader(csv.as_bytes(), schema()).unwrap_err();
        assert!(matches!(err, TableError::MissingColumn(ref c) if c == "attr_costs"));
    }

    #[test]
    fn item_scores_outside_unit_interval_are_rejected() {
        let traits = vec![TraitSpec::new("lreco", "theta_lreco", &["lreco_1"])];
        let schema = TableSchema::new(vec!["attr_costs".to_string()], traits);
        let csv = "id,task,package,chosen,framing,country,attr_costs,lreco_1,lreco\n\
                   7,1,1,1,source,CH,taxpayer,1.4,1.4\n";
        let err = AnalysisTable::from_reader(csv.as_bytes(), schema).unwrap_err();
        assert!(matches!(err, TableError::InvalidValue { row: 2, .. }));
    }

    #[test]
    fn blank_and_nan_items_are_missing() {
        let traits = vec![TraitSpec::new("lreco", "theta_lreco", &["lreco_1", "lreco_2"])];
        let schema = TableSchema::new(vec!["attr_costs".to_string()], traits);
        let csv = "id,task,package,chosen,framing,country,attr_costs,lreco_1,lreco_2,lreco\n\
                   7,1,1,1,source,CH,taxpayer,0.4,,nan\n";
        let table = AnalysisTable::from_reader(csv.as_bytes(), schema).unwrap();
        assert_eq!(table.rows()[0].items, vec![vec![Some(0.4), None]]);
        assert_eq!(table.rows()[0].aggregates, vec![None]);
    }

    #[test]
    fn package_and_flag_parsing_accepts_float_exports() {
        assert_eq!(Package::parse("2.0"), Some(Package::Right));
        assert_eq!(Package::parse("3"), None);
        assert_eq!(parse_flag("True"), Some(true));
        assert_eq!(parse_task("4.0"), Some(4));
        assert_eq!(parse_task("4.5"), None);
    }

    #[test]
    fn empty_framing_or_country_is_rejected() {
        let csv = "id,task,package,chosen,framing,country,attr_costs\n7,1,1,1,,CH,taxpayer\n";
        let err = AnalysisTable::from_reader(csv.as_bytes(), schema()).unwrap_err();
        assert!(matches!(err, TableError::InvalidValue { row: 2, ref column, .. } if column == "framing"));

        let csv = "id,task,package,chosen,framing,country,attr_costs\n7,1,1,1,source, ,taxpayer\n";
        let err = AnalysisTable::from_reader(csv.as_bytes(), schema()).unwrap_err();
        assert!(matches!(err, TableError::InvalidValue { row: 2, ref column, .. } if column == "country"));
    }
}
