//! day2day Simulator
//!
//! Command line front end for `day2day_core`: loads a JSON run
//! configuration, simulates the model and exports the resulting table.
//!
//! # Usage
//!
//! ```ignore
//! use day2day_sim::{RunConfig, OutputFormat, write_table};
//!
//! let config = RunConfig::load(Path::new("run.json"))?;
//! let table = config.simulate(Some(42))?;
//! write_table(&table, config.object_name(), Path::new("out.json"), OutputFormat::Json)?;
//! ```

pub mod config;
pub mod exporter;

pub use config::RunConfig;
pub use exporter::{to_csv, write_table, OutputFormat};
