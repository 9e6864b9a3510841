//! Per-task design matrices for the choice model.
//!
//! Package rows are split into left (`"1"`) and right (`"2"`) sets and paired
//! on `(id, task)`. Each task then carries a left and a right indicator row
//! over the level coordinate, a framing code, a country index, the observed
//! choice and the index of the individual who answered it.

use std::collections::HashMap;

use nalgebra::DMatrix;

use crate::encoding::{EncodedTable, LevelCoordinate};
use crate::error::{ConfigError, PipelineError, ShapeError};
use crate::table::{AnalysisTable, Package};

/// Categorical factor with lexicographically sorted categories.
#[derive(Debug, Clone, PartialEq)]
pub struct Factor {
    categories: Vec<String>,
    codes: Vec<usize>,
}

impl Factor {
    pub fn from_values<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let values: Vec<&str> = values.into_iter().collect();
        let mut categories: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        categories.sort();
        categories.dedup();
        let lookup: HashMap<&str, usize> = categories
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_str(), i))
            .collect();
        let codes = values.iter().map(|v| lookup[v]).collect();
        Self { categories, codes }
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn codes(&self) -> &[usize] {
        &self.codes
    }

    pub fn n_categories(&self) -> usize {
        self.categories.len()
    }

    fn subset(&self, keep: &[bool]) -> Self {
        Self {
            categories: self.categories.clone(),
            codes: select(&self.codes, keep),
        }
    }
}

/// Individual ids indexed by first appearance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndividualIndex {
    ids: Vec<String>,
    lookup: HashMap<String, usize>,
}

impl IndividualIndex {
    pub fn insert(&mut self, id: &str) -> usize {
        if let Some(&idx) = self.lookup.get(id) {
            return idx;
        }
        let idx = self.ids.len();
        self.ids.push(id.to_string());
        self.lookup.insert(id.to_string(), idx);
        idx
    }

    pub fn get(&self, id: &str) -> Option<usize> {
        self.lookup.get(id).copied()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub id: String,
    pub task: u32,
}

#[derive(Debug, Clone)]
pub struct DesignMatrix {
    coordinate: LevelCoordinate,
    left: DMatrix<f64>,
    right: DMatrix<f64>,
    framing: Factor,
    country: Factor,
    chosen: Vec<u8>,
    individuals: IndividualIndex,
    task_individual: Vec<usize>,
    task_keys: Vec<TaskKey>,
}

impl DesignMatrix {
    /// Pair left and right packages and gather per-task covariates.
    pub fn assemble(table: &AnalysisTable, encoded: &EncodedTable) -> Result<Self, PipelineError> {
        if encoded.n_rows() != table.len() {
            return Err(ShapeError::EncodedRows {
                expected: table.len(),
                got: encoded.n_rows(),
            }
            .into());
        }

        let mut left_rows = Vec::new();
        let mut right_by_key: HashMap<TaskKey, usize> = HashMap::new();
        let mut right_count = 0usize;
        for (i, row) in table.rows().iter().enumerate() {
            let key = TaskKey {
                id: row.id.clone(),
                task: row.task,
            };
            match row.package {
                Package::Left => left_rows.push((key, i)),
                Package::Right => {
                    right_count += 1;
                    if right_by_key.insert(key.clone(), i).is_some() {
                        return Err(ShapeError::DuplicatePackage {
                            id: key.id,
                            task: key.task,
                            package: Package::Right.label(),
                        }
                        .into());
                    }
                }
            }
        }

        if left_rows.len() != right_count {
            return Err(ShapeError::PackageCountMismatch {
                left: left_rows.len(),
                right: right_count,
            }
            .into());
        }
        if left_rows.is_empty() {
            return Err(ShapeError::Empty.into());
        }

        let n_tasks = left_rows.len();
        let n_levels = encoded.coordinate().len();
        let indicators = encoded.indicators();
        let mut left = DMatrix::<f64>::zeros(n_tasks, n_levels);
        let mut right = DMatrix::<f64>::zeros(n_tasks, n_levels);
        let mut chosen = Vec::with_capacity(n_tasks);
        let mut individuals = IndividualIndex::default();
        let mut task_individual = Vec::with_capacity(n_tasks);
        let mut task_keys = Vec::with_capacity(n_tasks);
        let mut framing_values = Vec::with_capacity(n_tasks);
        let mut country_values = Vec::with_capacity(n_tasks);
        let mut paired = std::collections::HashSet::with_capacity(n_tasks);

        for (t, (key, li)) in left_rows.into_iter().enumerate() {
            let ri = *right_by_key.get(&key).ok_or_else(|| ShapeError::UnpairedTask {
                id: key.id.clone(),
                task: key.task,
                missing: Package::Right.label(),
            })?;
            if !paired.insert(key.clone()) {
                return Err(ShapeError::DuplicatePackage {
                    id: key.id,
                    task: key.task,
                    package: Package::Left.label(),
                }
                .into());
            }
            left.row_mut(t).copy_from(&indicators.row(li));
            right.row_mut(t).copy_from(&indicators.row(ri));

            let row = &table.rows()[li];
            chosen.push(u8::from(row.chosen));
            framing_values.push(row.framing.as_str());
            country_values.push(row.country.as_str());
            task_individual.push(individuals.insert(&row.id));
            task_keys.push(key);
        }

        let framing = Factor::from_values(framing_values);
        if framing.n_categories() > 2 {
            return Err(ConfigError::FramingLevels(framing.categories().to_vec()).into());
        }
        let country = Factor::from_values(country_values);

        tracing::info!(
            tasks = n_tasks,
            individuals = individuals.len(),
            countries = country.n_categories(),
            "assembled design matrix"
        );

        Ok(Self {
            coordinate: encoded.coordinate().clone(),
            left,
            right,
            framing,
            country,
            chosen,
            individuals,
            task_individual,
            task_keys,
        })
    }

    /// New design restricted to the tasks where `keep` is true.
    ///
    /// Individual and category indices are left untouched.
    pub fn retain_tasks(&self, keep: &[bool]) -> Result<Self, ShapeError> {
        if keep.len() != self.n_tasks() {
            return Err(ShapeError::EncodedRows {
                expected: self.n_tasks(),
                got: keep.len(),
            });
        }
        let rows: Vec<usize> = (0..self.n_tasks()).filter(|&t| keep[t]).collect();
        if rows.is_empty() {
            return Err(ShapeError::Empty);
        }
        Ok(Self {
            coordinate: self.coordinate.clone(),
            left: self.left.select_rows(rows.iter()),
            right: self.right.select_rows(rows.iter()),
            framing: self.framing.subset(keep),
            country: self.country.subset(keep),
            chosen: select(&self.chosen, keep),
            individuals: self.individuals.clone(),
            task_individual: select(&self.task_individual, keep),
            task_keys: select(&self.task_keys, keep),
        })
    }

    pub fn coordinate(&self) -> &LevelCoordinate {
        &self.coordinate
    }

    pub fn n_tasks(&self) -> usize {
        self.chosen.len()
    }

    pub fn n_levels(&self) -> usize {
        self.coordinate.len()
    }

    pub fn left(&self) -> &DMatrix<f64> {
        &self.left
    }

    pub fn right(&self) -> &DMatrix<f64> {
        &self.right
    }

    pub fn framing(&self) -> &Factor {
        &self.framing
    }

    pub fn country(&self) -> &Factor {
        &self.country
    }

    /// Framing code of task `t` as a multiplier (0.0 or 1.0).
    pub fn framing_code(&self, t: usize) -> f64 {
        self.framing.codes[t] as f64
    }

    pub fn chosen(&self) -> &[u8] {
        &self.chosen
    }

    pub fn individuals(&self) -> &IndividualIndex {
        &self.individuals
    }

    pub fn task_individual(&self) -> &[usize] {
        &self.task_individual
    }

    pub fn task_keys(&self) -> &[TaskKey] {
        &self.task_keys
    }
}

fn select<T: Clone>(values: &[T], keep: &[bool]) -> Vec<T> {
    values
        .iter()
        .zip(keep)
        .filter(|(_, k)| **k)
        .map(|(v, _)| v.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{AttributeSpec, CategoricalEncoder};
    use crate::table::{PackageRow, TableSchema};

    fn row(id: &str, task: u32, package: Package, chosen: bool, framing: &str, level: &str) -> PackageRow {
        PackageRow::new(id, task, package, chosen, framing, "CH", vec![level.to_string()])
    }

    fn build(rows: Vec<PackageRow>) -> Result<DesignMatrix, PipelineError> {
        let table = AnalysisTable::new(TableSchema::new(vec!["attr_x".into()], Vec::new()), rows);
        let encoded = CategoricalEncoder::new(vec![AttributeSpec::new("attr_x", "A")])
            .unwrap()
            .encode(&table)
            .unwrap();
        DesignMatrix::assemble(&table, &encoded)
    }

    #[test]
    fn pairs_packages_by_individual_and_task() {
        // Right packages listed in a different order than left ones.
        let design = build(vec![
            row("1", 1, Package::Left, true, "source", "A"),
            row("1", 2, Package::Left, false, "source", "B"),
            row("1", 2, Package::Right, false, "source", "A"),
            row("1", 1, Package::Right, false, "source", "B"),
        ])
        .unwrap();

        assert_eq!(design.n_tasks(), 2);
        assert_eq!(design.left()[(0, 0)], 1.0);
        assert_eq!(design.right()[(0, 1)], 1.0);
        assert_eq!(design.left()[(1, 1)], 1.0);
        assert_eq!(design.right()[(1, 0)], 1.0);
        assert_eq!(design.chosen(), &[1, 0]);
    }

    #[test]
    fn mismatched_package_counts_are_a_shape_error() {
        let err = build(vec![
            row("1", 1, Package::Left, true, "source", "A"),
            row("1", 1, Package::Right, false, "source", "B"),
            row("1", 2, Package::Left, false, "source", "B"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Shape(ShapeError::PackageCountMismatch { left: 2, right: 1 })
        ));
    }

    #[test]
    fn unpaired_task_is_a_shape_error() {
        let err = build(vec![
            row("1", 1, Package::Left, true, "source", "A"),
            row("1", 3, Package::Right, false, "source", "B"),
        ])
        .unwrap_err();
        assert!(matches!(err, PipelineError::Shape(ShapeError::UnpairedTask { .. })));
    }

    #[test]
    fn framing_codes_follow_sorted_categories() {
        let design = build(vec![
            row("1", 1, Package::Left, true, "source", "A"),
            row("1", 1, Package::Right, false, "source", "B"),
            row("2", 1, Package::Left, true, "purpose", "A"),
            row("2", 1, Package::Right, false, "purpose", "B"),
        ])
        .unwrap();
        assert_eq!(design.framing().categories(), &["purpose".to_string(), "source".to_string()]);
        assert_eq!(design.framing_code(0), 1.0);
        assert_eq!(design.framing_code(1), 0.0);
        assert_eq!(design.task_individual(), &[0, 1]);
    }

    #[test]
    fn retain_tasks_keeps_selected_rows() {
        let design = build(vec![
            row("1", 1, Package::Left, true, "source", "A"),
            row("1", 1, Package::Right, false, "source", "B"),
            row("2", 1, Package::Left, false, "source", "B"),
            row("2", 1, Package::Right, false, "source", "A"),
        ])
        .unwrap();
        let kept = design.retain_tasks(&[false, true]).unwrap();
        assert_eq!(kept.n_tasks(), 1);
        assert_eq!(kept.task_individual(), &[1]);
        assert_eq!(kept.left()[(0, 1)], 1.0);
        assert!(matches!(design.retain_tasks(&[false, false]), Err(ShapeError::Empty)));
    }
}
