//! Exporters for simulated tables.
//!
//! Tables are written either as a JSON bundle (readable by
//! `summarize_folder`) or as plain CSV.

use std::fmt::Write as _;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use clap::ValueEnum;
use day2day_core::{Result, Table, TableBundle};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Output file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
        }
    }
}

/// Renders a table as CSV with a header row.
pub fn to_csv(table: &Table) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", table.names().collect::<Vec<_>>().join(","));
    for i in 0..table.nrows() {
        let row = table
            .columns()
            .map(|(_, values)| values[i].to_string())
            .collect::<Vec<_>>();
        let _ = writeln!(out, "{}", row.join(","));
    }
    out
}

/// Writes `table` to `path`. JSON output is a bundle holding the table under `name`.
pub fn write_table(table: &Table, name: &str, path: &Path, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => TableBundle::with_object(name, table.clone()).write_to(path)?,
        OutputFormat::Csv => {
            let mut file = File::create(path)?;
            file.write_all(to_csv(table).as_bytes())?;
        }
    }
    info!(
        path = %path.display(),
        format = format.extension(),
        rows = table.nrows(),
        "exported table"
    );
    Ok(())
}
