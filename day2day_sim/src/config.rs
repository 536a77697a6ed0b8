//! JSON run configuration for the simulator CLI.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use day2day_core::{Family, Formula, MultiSimModel, RandomStream, Result, SimModel, Table, TableBundle};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Configuration for a simulation run.
///
/// ```json
/// {
///   "name": "linear",
///   "formula": ["mean ~ 1 + 2 * x1"],
///   "family": "normal",
///   "n": 100,
///   "seed": 42
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Object name used in exported bundles
    pub name: Option<String>,

    /// One `parameter ~ expression` term per entry
    pub formula: Vec<String>,

    /// Response distribution
    pub family: Family,

    /// Number of rows (locations for multivariate runs)
    pub n: usize,

    /// Seed for the run (overridden by `--seed`)
    pub seed: Option<u64>,

    /// Upper bound of uniform spatial coordinates
    pub extent: f64,

    /// Response column name
    pub response: String,

    /// Use the multivariate engine
    pub multivariate: bool,

    /// Initial data table (a bundle or a bare table, as JSON)
    pub data: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name: None,
            formula: Vec::new(),
            family: Family::Normal,
            n: 100,
            seed: None,
            extent: 1.0,
            response: day2day_core::DEFAULT_RESPONSE.to_string(),
            multivariate: false,
            data: None,
        }
    }
}

/// Initial data files are either a bundle or a single table.
#[derive(Deserialize)]
#[serde(untagged)]
enum DataFile {
    Bundle(TableBundle),
    Table(Table),
}

impl RunConfig {
    /// Loads a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut config: Self = serde_json::from_reader(BufReader::new(file))?;
        // Relative data paths are resolved against the config's folder.
        if let (Some(data), Some(dir)) = (config.data.as_mut(), path.parent()) {
            if data.is_relative() {
                *data = dir.join(&*data);
            }
        }
        debug!(path = %path.display(), terms = config.formula.len(), "loaded run config");
        Ok(config)
    }

    /// Object name for exports, defaulting to `sim`.
    pub fn object_name(&self) -> &str {
        self.name.as_deref().unwrap_or("sim")
    }

    pub fn formula(&self) -> Result<Formula> {
        Formula::parse(&self.formula)
    }

    /// Reads the initial data table, taking the first object of a bundle.
    pub fn initial_data(&self) -> Result<Option<Table>> {
        let Some(path) = &self.data else {
            return Ok(None);
        };
        let file = File::open(path)?;
        let table = match serde_json::from_reader(BufReader::new(file))? {
            DataFile::Table(table) => table,
            DataFile::Bundle(bundle) => match bundle.objects.into_iter().next() {
                Some((_, table)) => table,
                None => return Ok(None),
            },
        };
        table.validate()?;
        Ok(Some(table))
    }

    /// Runs the configured model. `seed` takes precedence over the config.
    pub fn simulate(&self, seed: Option<u64>) -> Result<Table> {
        let formula = self.formula()?;
        let data = self.initial_data()?;
        let seed = seed.or(self.seed);
        let mut stream = RandomStream::from_entropy();

        if self.multivariate {
            let mut model = MultiSimModel::new(formula, self.n)
                .with_extent(self.extent)
                .with_response_name(&self.response);
            if let Some(data) = data {
                model = model.with_data(data);
            }
            if let Some(seed) = seed {
                model = model.with_seed(seed);
            }
            model.run(&self.family, &mut stream)
        } else {
            let mut model = SimModel::new(formula, self.n)
                .with_extent(self.extent)
                .with_response_name(&self.response);
            if let Some(data) = data {
                model = model.with_data(data);
            }
            if let Some(seed) = seed {
                model = model.with_seed(seed);
            }
            model.run(&self.family, &mut stream)
        }
    }
}
