//! day2day Simulator CLI
//!
//! Simulate formula models from JSON configs and summarize result folders.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use day2day_core::summarize_folder;
use day2day_sim::{write_table, OutputFormat, RunConfig};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

/// day2day formula-driven data simulator
#[derive(Parser, Debug)]
#[command(name = "day2day-sim")]
#[command(about = "Formula-driven simulation of synthetic datasets")]
struct Args {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Simulate a model described by a JSON run config
    Simulate {
        /// Run configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Seed (overrides the config)
        #[arg(short, long)]
        seed: Option<u64>,

        /// Output file (defaults to <name>.<format> in the working directory)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },

    /// Write a text summary of the JSON bundles in a folder
    Summarize {
        /// Folder to scan
        dir: PathBuf,

        /// Report file (defaults to <dir>/folder_summary.txt)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    info!("day2day simulator v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Simulate { config, seed, out, format } => {
            let run = RunConfig::load(&config)
                .with_context(|| format!("loading config {}", config.display()))?;
            if run.formula.is_empty() {
                bail!("config {} has no formula terms", config.display());
            }
            debug!(?run, "running configuration");

            let table = run.simulate(seed).context("simulation failed")?;
            let out = out.unwrap_or_else(|| {
                PathBuf::from(format!("{}.{}", run.object_name(), format.extension()))
            });
            write_table(&table, run.object_name(), &out, format)
                .with_context(|| format!("writing {}", out.display()))?;

            info!(
                rows = table.nrows(),
                columns = table.ncols(),
                path = %out.display(),
                "simulation complete"
            );
        }
        Command::Summarize { dir, output } => {
            let report = summarize_folder(&dir, output.as_deref())
                .with_context(|| format!("summarizing {}", dir.display()))?;
            println!("{}", report.display());
        }
    }

    Ok(())
}
