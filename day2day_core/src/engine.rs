//! Formula-driven simulation engines.
//!
//! [`SimModel`] simulates one response column; [`MultiSimModel`] simulates
//! `q` correlated response columns when a parameter evaluates to `n*q`
//! values (typically via `mfe` and `mgp`).
//!
//! Both follow the same pipeline:
//!
//! 1. Pick the random stream (a fresh seeded one, or the caller's).
//! 2. Simulate every predictor the formula names that the data lacks:
//!    ordinary names as standard normals, `s<digits>` names as uniform
//!    coordinates on `[0, extent]`.
//! 3. Evaluate each parameter against the working table.
//! 4. Hand the parameters to the response generator.

use regex::Regex;
use tracing::{debug, info};

use crate::error::{Result, SimError};
use crate::formula::{Evaluator, Formula, FunctionTable};
use crate::response::{Params, ResponseGenerator};
use crate::stream::RandomStream;
use crate::table::Table;

/// Response column name unless overridden.
pub const DEFAULT_RESPONSE: &str = "y";

/// Row identifier column added by the multivariate engine.
pub const ID_COLUMN: &str = "id";

/// Predictor names matching this pattern are spatial coordinates.
pub const SPATIAL_PATTERN: &str = r"^s[0-9]+$";

/// Univariate simulation of a formula model (`sim_model`).
///
/// ```ignore
/// let formula: Formula = "mean ~ 1 + 2*x1".parse()?;
/// let table = SimModel::new(formula, 10)
///     .with_seed(42)
///     .run(&Family::Normal, &mut RandomStream::from_entropy())?;
/// ```
#[derive(Debug, Clone)]
pub struct SimModel {
    /// Parameter terms
    formula: Formula,

    /// Number of observations
    n: usize,

    /// Supplied predictors (`n` rows)
    data: Option<Table>,

    /// Seed for a fresh stream; `None` continues the caller's stream
    seed: Option<u64>,

    /// Upper bound of simulated spatial coordinates
    extent: f64,

    /// Name of the response column
    response: String,

    /// Extra functions visible to the formula
    functions: FunctionTable,
}

impl SimModel {
    /// Creates a model simulating `n` observations.
    pub fn new(formula: Formula, n: usize) -> Self {
        Self {
            formula,
            n,
            data: None,
            seed: None,
            extent: 1.0,
            response: DEFAULT_RESPONSE.to_string(),
            functions: FunctionTable::new(),
        }
    }

    /// Supplies predictor columns; names found here are not simulated.
    pub fn with_data(mut self, data: Table) -> Self {
        self.data = Some(data);
        self
    }

    /// Makes every draw of a run reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sets the upper bound for simulated spatial coordinates.
    pub fn with_extent(mut self, extent: f64) -> Self {
        self.extent = extent;
        self
    }

    /// Sets the response column name.
    pub fn with_response_name(mut self, name: impl Into<String>) -> Self {
        self.response = name.into();
        self
    }

    /// Makes a user function callable from the formula.
    pub fn with_function<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[f64]) -> Vec<f64> + Send + Sync + 'static,
    {
        self.functions.register(name, function);
        self
    }

    pub fn formula(&self) -> &Formula {
        &self.formula
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Runs the simulation and returns predictors, parameters and response.
    pub fn run<G>(&self, generator: &G, stream: &mut RandomStream) -> Result<Table>
    where
        G: ResponseGenerator + ?Sized,
    {
        let mut seeded;
        let stream = match self.seed {
            Some(seed) => {
                seeded = RandomStream::from_seed(seed);
                &mut seeded
            }
            None => stream,
        };
        info!(
            n = self.n,
            terms = self.formula.len(),
            seed = ?self.seed,
            "simulating univariate model"
        );

        let mut table = self.prepare(stream)?;

        let mut params = Params::new();
        for term in self.formula.terms() {
            let values = Evaluator::new(&table, stream, &self.functions)
                .eval(&term.expr)?
                .into_vector()?;
            let values = broadcast(&term.parameter, values, self.n)?;
            debug!(parameter = %term.parameter, "evaluated parameter");
            table.set_column(term.parameter.as_str(), values.clone())?;
            params.insert(term.parameter.clone(), values);
        }

        let response = generate(generator, self.n, &params, stream)?;
        table.set_column(self.response.as_str(), response)?;
        Ok(table)
    }

    /// Builds the base table: supplied data plus simulated predictors.
    fn prepare(&self, stream: &mut RandomStream) -> Result<Table> {
        if !self.extent.is_finite() || self.extent < 0.0 {
            return Err(SimError::invalid(format!(
                "extent must be a finite non-negative number, got {}",
                self.extent
            )));
        }

        let mut table = match &self.data {
            Some(data) if data.nrows() != self.n => {
                return Err(SimError::reshape(format!(
                    "data has {} rows but n = {}",
                    data.nrows(),
                    self.n
                )))
            }
            Some(data) => data.clone(),
            None => Table::new(self.n),
        };

        let spatial_pattern = Regex::new(SPATIAL_PATTERN)
            .map_err(|e| SimError::invalid(format!("spatial pattern: {e}")))?;
        let (spatial, ordinary): (Vec<String>, Vec<String>) = self
            .formula
            .predictors()
            .into_iter()
            .filter(|name| !table.contains(name))
            .partition(|name| spatial_pattern.is_match(name));

        debug!(
            ordinary = ?ordinary,
            spatial = ?spatial,
            supplied = table.ncols(),
            "partitioned predictors"
        );

        let n = self.n;
        let normals = stream.standard_normals(n * ordinary.len());
        for (j, name) in ordinary.into_iter().enumerate() {
            table.push_column(name, normals[j * n..(j + 1) * n].to_vec())?;
        }

        let coordinates = stream.uniforms(n * spatial.len(), self.extent);
        for (j, name) in spatial.into_iter().enumerate() {
            table.push_column(name, coordinates[j * n..(j + 1) * n].to_vec())?;
        }

        Ok(table)
    }
}

/// Multivariate simulation of a formula model (`msim_model`).
///
/// The number of processes `q` is inferred from the longest parameter,
/// which must have exactly `n*q` values in block layout. Output columns
/// are suffixed with the process index: `mean1, mean2, ..., y1, y2, ...`.
#[derive(Debug, Clone)]
pub struct MultiSimModel {
    model: SimModel,
}

impl MultiSimModel {
    pub fn new(formula: Formula, n: usize) -> Self {
        Self {
            model: SimModel::new(formula, n),
        }
    }

    pub fn with_data(mut self, data: Table) -> Self {
        self.model = self.model.with_data(data);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.model = self.model.with_seed(seed);
        self
    }

    pub fn with_extent(mut self, extent: f64) -> Self {
        self.model = self.model.with_extent(extent);
        self
    }

    pub fn with_response_name(mut self, name: impl Into<String>) -> Self {
        self.model = self.model.with_response_name(name);
        self
    }

    pub fn with_function<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[f64]) -> Vec<f64> + Send + Sync + 'static,
    {
        self.model = self.model.with_function(name, function);
        self
    }

    pub fn formula(&self) -> &Formula {
        &self.model.formula
    }

    pub fn n(&self) -> usize {
        self.model.n
    }

    /// Runs the simulation and returns the wide table.
    pub fn run<G>(&self, generator: &G, stream: &mut RandomStream) -> Result<Table>
    where
        G: ResponseGenerator + ?Sized,
    {
        let model = &self.model;
        let n = model.n;
        if n == 0 {
            return Err(SimError::reshape(
                "cannot infer the number of processes with n = 0",
            ));
        }

        let mut seeded;
        let stream = match model.seed {
            Some(seed) => {
                seeded = RandomStream::from_seed(seed);
                &mut seeded
            }
            None => stream,
        };
        info!(
            n,
            terms = model.formula.len(),
            seed = ?model.seed,
            "simulating multivariate model"
        );

        let mut table = model.prepare(stream)?;
        table.set_column(ID_COLUMN, (1..=n).map(|i| i as f64).collect())?;

        // Per-observation results join the table right away so later terms
        // can reference them; stacked results are widened at the end.
        let mut evaluated = Vec::with_capacity(model.formula.len());
        for term in model.formula.terms() {
            let values = Evaluator::new(&table, stream, &model.functions)
                .eval(&term.expr)?
                .into_vector()?;
            if values.len() == 1 || values.len() == n {
                table.set_column(term.parameter.as_str(), broadcast(&term.parameter, values.clone(), n)?)?;
            }
            evaluated.push((term.parameter.clone(), values));
        }

        let q = infer_processes(&evaluated, n)?;
        debug!(q, "inferred number of processes");

        let params: Params = evaluated
            .iter()
            .map(|(name, values)| {
                let stacked: Vec<f64> = (0..n * q).map(|i| values[i % values.len()]).collect();
                (name.clone(), stacked)
            })
            .collect();

        let response = generate(generator, n * q, &params, stream)?;

        let ids = table
            .column(ID_COLUMN)
            .ok_or_else(|| SimError::reshape("row identifier column is missing"))?
            .to_vec();
        for (name, values) in &evaluated {
            if values.len() == n * q {
                for (k, column) in widen(values, n, q, &ids)?.into_iter().enumerate() {
                    table.set_column(format!("{name}{}", k + 1), column)?;
                }
            }
        }
        for (k, column) in widen(&response, n, q, &ids)?.into_iter().enumerate() {
            table.set_column(format!("{}{}", model.response, k + 1), column)?;
        }

        info!(n, q, columns = table.ncols(), "multivariate simulation complete");
        Ok(table)
    }
}

/// Extends a length-1 parameter to `n`; any other length must be `n`.
fn broadcast(parameter: &str, values: Vec<f64>, n: usize) -> Result<Vec<f64>> {
    match values.len() {
        len if len == n => Ok(values),
        1 => Ok(vec![values[0]; n]),
        len => Err(SimError::reshape(format!(
            "parameter '{parameter}' has {len} values, expected 1 or {n}"
        ))),
    }
}

fn generate<G>(generator: &G, count: usize, params: &Params, stream: &mut RandomStream) -> Result<Vec<f64>>
where
    G: ResponseGenerator + ?Sized,
{
    let response = generator.generate(count, params, stream)?;
    if response.len() != count {
        return Err(SimError::invocation(format!(
            "response generator returned {} values, expected {count}",
            response.len()
        )));
    }
    Ok(response)
}

/// Number of processes implied by the evaluated parameter lengths.
fn infer_processes(evaluated: &[(String, Vec<f64>)], n: usize) -> Result<usize> {
    let longest = evaluated.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
    if longest % n != 0 || longest / n < 2 {
        return Err(SimError::reshape(format!(
            "no parameter has n*q values for an integer q > 1 (longest has {longest}, n = {n})"
        )));
    }
    let q = longest / n;
    for (name, values) in evaluated {
        let len = values.len();
        if len != 1 && len != n && len != n * q {
            return Err(SimError::reshape(format!(
                "parameter '{name}' has {len} values, expected 1, {n} or {}",
                n * q
            )));
        }
    }
    Ok(q)
}

/// Pivots a block-layout vector to `q` columns ordered by the table's ids.
///
/// Entry `idx` belongs to row `id = idx % n + 1` of process `idx / n + 1`.
fn widen(values: &[f64], n: usize, q: usize, ids: &[f64]) -> Result<Vec<Vec<f64>>> {
    let mut slots: Vec<Vec<Option<f64>>> = vec![vec![None; n]; q];
    for (idx, &value) in values.iter().enumerate() {
        let slot = &mut slots[idx / n][idx % n];
        if slot.is_some() {
            return Err(SimError::reshape(format!("duplicate entry for id {}", idx % n + 1)));
        }
        *slot = Some(value);
    }

    let mut seen = vec![false; n];
    let mut columns = vec![Vec::with_capacity(n); q];
    for &id in ids {
        let row = id as usize;
        if id.fract() != 0.0 || row == 0 || row > n || seen[row - 1] {
            return Err(SimError::reshape(format!("row identifier {id} does not join one to one")));
        }
        seen[row - 1] = true;
        for (column, process) in columns.iter_mut().zip(&slots) {
            let value = process[row - 1]
                .ok_or_else(|| SimError::reshape(format!("no value for id {row}")))?;
            column.push(value);
        }
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Family;

    fn formula(lines: &[&str]) -> Formula {
        Formula::parse(lines).unwrap()
    }

    fn identity(count: usize, params: &Params, _: &mut RandomStream) -> Result<Vec<f64>> {
        Ok(params["mean"].iter().cycle().take(count).copied().collect())
    }

    #[test]
    fn test_columns_and_rows() {
        let model = SimModel::new(formula(&["mean ~ 1 + x1 + x2 + gp(s1, s2, phi = 0.3)", "sd ~ 0.5"]), 25)
            .with_seed(7);
        let table = model.run(&Family::Normal, &mut RandomStream::from_seed(0)).unwrap();

        assert_eq!(table.nrows(), 25);
        assert_eq!(
            table.names().collect::<Vec<_>>(),
            vec!["x1", "x2", "s1", "s2", "mean", "sd", "y"]
        );
        assert!(table.column("sd").unwrap().iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_mean_is_linear_in_predictor() {
        let model = SimModel::new(formula(&["mean ~ 1 + 2*x1"]), 10).with_seed(42);
        let table = model.run(&Family::Normal, &mut RandomStream::from_seed(0)).unwrap();

        let x1 = table.column("x1").unwrap();
        let mean = table.column("mean").unwrap();
        for (x, m) in x1.iter().zip(mean) {
            assert_eq!(*m, 1.0 + 2.0 * x);
        }

        let again = model.run(&Family::Normal, &mut RandomStream::from_seed(99)).unwrap();
        assert_eq!(table, again);
    }

    #[test]
    fn test_seeded_run_matches_stream_from_same_seed() {
        let f = formula(&["mean ~ x1"]);
        let seeded = SimModel::new(f.clone(), 12)
            .with_seed(5)
            .run(&Family::Normal, &mut RandomStream::from_seed(0))
            .unwrap();
        let unseeded = SimModel::new(f, 12)
            .run(&Family::Normal, &mut RandomStream::from_seed(5))
            .unwrap();
        assert_eq!(seeded, unseeded);
    }

    #[test]
    fn test_seeded_run_leaves_caller_stream_alone() {
        let mut stream = RandomStream::from_seed(3);
        let mut reference = stream.clone();

        SimModel::new(formula(&["mean ~ x1"]), 8)
            .with_seed(11)
            .run(&Family::Normal, &mut stream)
            .unwrap();

        assert_eq!(stream.standard_normals(4), reference.standard_normals(4));
    }

    #[test]
    fn test_unseeded_runs_continue_the_stream() {
        let model = SimModel::new(formula(&["mean ~ x1"]), 6);
        let mut stream = RandomStream::from_seed(3);
        let first = model.run(&Family::Normal, &mut stream).unwrap();
        let second = model.run(&Family::Normal, &mut stream).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_spatial_coordinates_within_extent() {
        let model = SimModel::new(formula(&["mean ~ gp(s1, s2, phi = 2)"]), 30)
            .with_seed(1)
            .with_extent(10.0);
        let table = model.run(&Family::Normal, &mut RandomStream::from_seed(0)).unwrap();

        for name in ["s1", "s2"] {
            assert!(table.column(name).unwrap().iter().all(|&s| (0.0..=10.0).contains(&s)));
        }
    }

    #[test]
    fn test_supplied_data_is_kept() {
        let data = Table::from_columns([("x1", vec![1.0, 2.0, 3.0])]).unwrap();
        let model = SimModel::new(formula(&["mean ~ x1 + x2"]), 3)
            .with_data(data)
            .with_seed(2)
            .with_response_name("z");
        let table = model.run(&Family::Normal, &mut RandomStream::from_seed(0)).unwrap();

        assert_eq!(table.column("x1"), Some(&[1.0, 2.0, 3.0][..]));
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["x1", "x2", "mean", "z"]);
    }

    #[test]
    fn test_parameters_see_earlier_parameters() {
        let model = SimModel::new(formula(&["a ~ 2*x1", "mean ~ a + 1"]), 5).with_seed(4);
        let table = model.run(&identity, &mut RandomStream::from_seed(0)).unwrap();

        let a = table.column("a").unwrap();
        let y = table.column("y").unwrap();
        for (a, y) in a.iter().zip(y) {
            assert_eq!(*y, a + 1.0);
        }
    }

    #[test]
    fn test_error_kinds() {
        let mut stream = RandomStream::from_seed(0);

        let forward_reference = SimModel::new(formula(&["b ~ a + 1", "a ~ x1"]), 4);
        assert!(matches!(
            forward_reference.run(&Family::Normal, &mut stream),
            Err(SimError::Resolution(_))
        ));

        let unknown_function = SimModel::new(formula(&["mean ~ wobble(x1)"]), 4);
        assert!(matches!(
            unknown_function.run(&Family::Normal, &mut stream),
            Err(SimError::Resolution(_))
        ));

        let bad_argument = SimModel::new(formula(&["mu ~ x1"]), 4);
        assert!(matches!(
            bad_argument.run(&Family::Normal, &mut stream),
            Err(SimError::Invocation(_))
        ));

        let wrong_length = SimModel::new(formula(&["mean ~ c(1, 2, 3)"]), 4);
        assert!(matches!(
            wrong_length.run(&Family::Normal, &mut stream),
            Err(SimError::Reshape(_))
        ));

        let data = Table::from_columns([("x1", vec![0.0; 3])]).unwrap();
        let wrong_rows = SimModel::new(formula(&["mean ~ x1"]), 4).with_data(data);
        assert!(matches!(
            wrong_rows.run(&Family::Normal, &mut stream),
            Err(SimError::Reshape(_))
        ));

        let bad_extent = SimModel::new(formula(&["mean ~ s1"]), 4).with_extent(-1.0);
        assert!(matches!(
            bad_extent.run(&Family::Normal, &mut stream),
            Err(SimError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_short_generator_output_is_invocation_error() {
        let short = |_: usize, _: &Params, _: &mut RandomStream| -> Result<Vec<f64>> { Ok(vec![0.0]) };
        let model = SimModel::new(formula(&["mean ~ x1"]), 4);
        assert!(matches!(
            model.run(&short, &mut RandomStream::from_seed(0)),
            Err(SimError::Invocation(_))
        ));
    }

    #[test]
    fn test_user_function_in_formula() {
        let model = SimModel::new(formula(&["mean ~ clamp01(x1)"]), 20)
            .with_seed(8)
            .with_function("clamp01", |x: &[f64]| x.iter().map(|v| v.clamp(0.0, 1.0)).collect());
        let table = model.run(&identity, &mut RandomStream::from_seed(0)).unwrap();
        assert!(table.column("y").unwrap().iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_multivariate_layout() {
        let model = MultiSimModel::new(
            formula(&[
                "mean ~ mfe(x1, c(1, 2)) + mgp(s1, s2, variance = c(1, 0.5, 0.5, 1), phi = 0.2)",
                "sd ~ 0.1",
            ]),
            20,
        )
        .with_seed(17);
        let table = model.run(&Family::Normal, &mut RandomStream::from_seed(0)).unwrap();

        assert_eq!(table.nrows(), 20);
        assert_eq!(
            table.names().collect::<Vec<_>>(),
            vec!["x1", "s1", "s2", "id", "sd", "mean1", "mean2", "y1", "y2"]
        );

        let mut ids: Vec<u64> = table.column(ID_COLUMN).unwrap().iter().map(|&i| i as u64).collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=20).collect::<Vec<u64>>());
    }

    #[test]
    fn test_multivariate_identity_round_trip() {
        let model = MultiSimModel::new(formula(&["mean ~ mfe(x1, c(1, 2))"]), 6).with_seed(21);
        let table = model.run(&identity, &mut RandomStream::from_seed(0)).unwrap();

        let x1 = table.column("x1").unwrap();
        let y1 = table.column("y1").unwrap();
        let y2 = table.column("y2").unwrap();
        for i in 0..6 {
            assert_eq!(y1[i], x1[i]);
            assert_eq!(y2[i], 2.0 * x1[i]);
        }
        assert_eq!(table.column("mean2"), Some(y2));
    }

    #[test]
    fn test_multivariate_needs_stacked_parameter() {
        let per_row = MultiSimModel::new(formula(&["mean ~ x1"]), 5).with_seed(1);
        assert!(matches!(
            per_row.run(&Family::Normal, &mut RandomStream::from_seed(0)),
            Err(SimError::Reshape(_))
        ));

        let ragged = MultiSimModel::new(formula(&["mean ~ c(x1, 1)"]), 4).with_seed(1);
        assert!(matches!(
            ragged.run(&Family::Normal, &mut RandomStream::from_seed(0)),
            Err(SimError::Reshape(_))
        ));

        let mixed = MultiSimModel::new(
            formula(&["mean ~ mfe(x1, c(1, 2, 3))", "sd ~ mfe(x1, c(1, 2))"]),
            4,
        );
        assert!(matches!(
            mixed.run(&Family::Normal, &mut RandomStream::from_seed(0)),
            Err(SimError::Reshape(_))
        ));
    }

    #[test]
    fn test_multivariate_is_deterministic() {
        let model = MultiSimModel::new(
            formula(&["mean ~ mfe(x1, c(0.5, -1)) + mgp(s1, s2, variance = diag(2), phi = 0.4)"]),
            10,
        )
        .with_seed(123);
        let a = model.run(&Family::Normal, &mut RandomStream::from_seed(1)).unwrap();
        let b = model.run(&Family::Normal, &mut RandomStream::from_seed(2)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_widen_rejects_bad_ids() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(
            widen(&values, 2, 2, &[1.0, 2.0]).unwrap(),
            vec![vec![1.0, 2.0], vec![3.0, 4.0]]
        );
        assert_eq!(
            widen(&values, 2, 2, &[2.0, 1.0]).unwrap(),
            vec![vec![2.0, 1.0], vec![4.0, 3.0]]
        );
        assert!(matches!(widen(&values, 2, 2, &[1.0, 1.0]), Err(SimError::Reshape(_))));
        assert!(matches!(widen(&values, 2, 2, &[1.0, 3.0]), Err(SimError::Reshape(_))));
    }
}
