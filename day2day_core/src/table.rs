//! Observation tables and their persisted bundle format.

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};

/// A table of `nrows` observations with ordered, named numeric columns.
///
/// Every column has exactly `nrows` entries. Columns keep insertion order,
/// which is also the order they are exported in. Non-finite values persist
/// as the strings `"NaN"`, `"Inf"` and `"-Inf"`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    nrows: usize,
    #[serde(with = "cells")]
    columns: IndexMap<String, Vec<f64>>,
}

impl Table {
    /// Creates an empty table with `nrows` rows and no columns.
    pub fn new(nrows: usize) -> Self {
        Self {
            nrows,
            columns: IndexMap::new(),
        }
    }

    /// Builds a table from `(name, values)` pairs.
    ///
    /// The row count is taken from the first column; any column of a
    /// different length is a [`SimError::Reshape`].
    pub fn from_columns<I, S>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<f64>)>,
        S: Into<String>,
    {
        let mut iter = columns.into_iter().peekable();
        let nrows = iter.peek().map_or(0, |(_, values)| values.len());
        let mut table = Self::new(nrows);
        for (name, values) in iter {
            table.push_column(name, values)?;
        }
        Ok(table)
    }

    /// Number of rows.
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    /// Number of columns.
    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    /// Returns true if the table has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Returns a column by name.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Returns true if a column with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Column names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// `(name, values)` pairs in order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.columns
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Values of row `index` across all columns, in column order.
    pub fn row(&self, index: usize) -> Option<Vec<f64>> {
        (index < self.nrows).then(|| self.columns.values().map(|c| c[index]).collect())
    }

    /// Appends a new column. Fails if the name is taken or the length is wrong.
    pub fn push_column(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        if self.columns.contains_key(&name) {
            return Err(SimError::invalid(format!("column '{name}' already exists")));
        }
        self.set_column(name, values)
    }

    /// Appends a column, or replaces an existing one in place.
    pub fn set_column(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        if values.len() != self.nrows {
            return Err(SimError::reshape(format!(
                "column '{}' has {} values but the table has {} rows",
                name,
                values.len(),
                self.nrows
            )));
        }
        self.columns.insert(name, values);
        Ok(())
    }

    /// Checks that every column has `nrows` entries.
    ///
    /// Deserialized tables bypass [`Table::push_column`], so loaders call this.
    pub fn validate(&self) -> Result<()> {
        for (name, values) in &self.columns {
            if values.len() != self.nrows {
                return Err(SimError::reshape(format!(
                    "column '{}' has {} values but the table has {} rows",
                    name,
                    values.len(),
                    self.nrows
                )));
            }
        }
        Ok(())
    }
}

/// JSON has no NaN or infinity, so those cells are written as strings.
mod cells {
    use indexmap::IndexMap;
    use serde::de::{self, Deserializer};
    use serde::ser::{SerializeMap, Serializer};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Cell {
        Number(f64),
        Text(String),
        Missing,
    }

    impl From<f64> for Cell {
        fn from(value: f64) -> Self {
            if value.is_finite() {
                Cell::Number(value)
            } else if value.is_nan() {
                Cell::Text("NaN".to_string())
            } else if value > 0.0 {
                Cell::Text("Inf".to_string())
            } else {
                Cell::Text("-Inf".to_string())
            }
        }
    }

    pub fn serialize<S>(columns: &IndexMap<String, Vec<f64>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(columns.len()))?;
        for (name, values) in columns {
            let cells: Vec<Cell> = values.iter().map(|&v| Cell::from(v)).collect();
            map.serialize_entry(name, &cells)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<IndexMap<String, Vec<f64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = IndexMap::<String, Vec<Cell>>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(name, cells)| -> Result<(String, Vec<f64>), D::Error> {
                let values = cells
                    .into_iter()
                    .map(|cell| match cell {
                        Cell::Number(v) => Ok(v),
                        Cell::Missing => Ok(f64::NAN),
                        Cell::Text(text) => match text.as_str() {
                            "NaN" | "NA" => Ok(f64::NAN),
                            "Inf" => Ok(f64::INFINITY),
                            "-Inf" => Ok(f64::NEG_INFINITY),
                            other => Err(de::Error::custom(format!(
                                "column '{name}': expected a number, got \"{other}\""
                            ))),
                        },
                    })
                    .collect::<Result<Vec<f64>, D::Error>>()?;
                Ok((name, values))
            })
            .collect()
    }
}

/// A set of named tables persisted together as one JSON file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableBundle {
    /// Tables keyed by object name
    pub objects: IndexMap<String, Table>,
}

impl TableBundle {
    /// Creates an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bundle holding a single table.
    pub fn with_object(name: impl Into<String>, table: Table) -> Self {
        let mut bundle = Self::new();
        bundle.insert(name, table);
        bundle
    }

    /// Adds (or replaces) a named table.
    pub fn insert(&mut self, name: impl Into<String>, table: Table) {
        self.objects.insert(name.into(), table);
    }

    /// Reads and validates a bundle from a JSON file.
    pub fn read_from(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let bundle: Self = serde_json::from_reader(BufReader::new(file))?;
        for table in bundle.objects.values() {
            table.validate()?;
        }
        Ok(bundle)
    }

    /// Writes the bundle as pretty JSON.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
