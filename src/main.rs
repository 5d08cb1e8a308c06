//! weaver: offline front end for metrics-weaver
//!
//! ## Commands
//!
//! - **transform**: rewrite every `*.unit` under a directory according to a config
//! - **run**: load units with instrumentation enabled, run an entry point, print the metrics
//! - **disasm**: print a unit file as text
//!
//! ## Example Usage
//!
//! ```bash
//! weaver transform --config weaver.yaml --units build/units --out build/instrumented
//! weaver run --config weaver.yaml --units build/units --entry "app/Main.main()V"
//! weaver disasm build/instrumented/app/Main.unit
//! RUST_LOG=weaver_core=debug weaver transform ...
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use metrics_weaver::run::{instrumented_loader, run_entry};
use metrics_weaver::transform::{transform_dir, TransformReport};
use weaver_core::{ConfigIndex, MethodKey, TransformDispatcher};
use weaver_prometheus::PrometheusRegister;
use weaver_spi::{InMemoryRegister, MetricsProvider};
use weaver_unit::{decode_unit, disasm::disassemble};

#[derive(Parser)]
#[command(
    name = "weaver",
    author,
    version,
    about = "Load-time metrics instrumentation for compiled units"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rewrite a directory of units
    Transform {
        /// Metrics configuration (YAML)
        #[arg(long)]
        config: PathBuf,

        /// Directory searched recursively for *.unit files
        #[arg(long)]
        units: PathBuf,

        /// Output directory; units are written under their internal names
        #[arg(long)]
        out: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a static, argument-less entry point with instrumentation enabled
    Run {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        units: PathBuf,

        /// Entry point as `<unit>.<method>(<signature>)`
        #[arg(long)]
        entry: String,
    },

    /// Print a unit file as text
    Disasm {
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Commands::Transform {
            config,
            units,
            out,
            json,
        } => transform(config, units, out, json),
        Commands::Run {
            config,
            units,
            entry,
        } => run(config, units, entry),
        Commands::Disasm { file } => {
            let bytes = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let unit = decode_unit(&bytes).with_context(|| format!("decoding {}", file.display()))?;
            print!("{}", disassemble(&unit));
            Ok(())
        }
    }
}

fn transform(config: PathBuf, units: PathBuf, out: PathBuf, json: bool) -> Result<()> {
    let config = ConfigIndex::from_file(&config)?;
    // Instruments registered while rewriting are not observed offline.
    let dispatcher = TransformDispatcher::new(Arc::new(config), Arc::new(InMemoryRegister::new()));
    let report = transform_dir(&dispatcher, &units, &out)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if !report.is_success() {
        bail!("{} unit(s) could not be rewritten", report.failed.len());
    }
    Ok(())
}

fn print_report(report: &TransformReport) {
    for unit in &report.rewritten {
        println!("rewritten  {}", unit);
    }
    for unit in &report.unchanged {
        println!("unchanged  {}", unit);
    }
    for failed in &report.failed {
        println!("FAILED     {}: {}", failed.unit, failed.error);
    }
}

fn run(config: PathBuf, units: PathBuf, entry: String) -> Result<()> {
    let config = ConfigIndex::from_file(&config)?;
    let register = Arc::new(PrometheusRegister::from_settings(config.backend())?);
    MetricsProvider::install_register(register.clone())?;

    let entry = MethodKey::parse(&entry)?;
    let dispatcher = TransformDispatcher::new(Arc::new(config), register.clone());
    let loader = instrumented_loader(dispatcher, &units)?;
    let outcome = run_entry(loader, register.clone(), &entry)?;

    match &outcome {
        Ok(Some(value)) => eprintln!("{} returned {:?}", entry, value),
        Ok(None) => eprintln!("{} returned", entry),
        Err(e) => eprintln!("{} failed: {}", entry, e),
    }
    print!("{}", register.render()?);
    outcome.map(|_| ()).map_err(Into::into)
}
