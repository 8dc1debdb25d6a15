//! cplus-plan: dry-run a scenario analysis and print the planned raster
//! operations.
//!
//! Layer metadata comes from a JSON layer catalog instead of real files,
//! and every raster operation is recorded rather than executed. The
//! ordered operation list and per-stage diagnostics are printed, which
//! makes it easy to check what a scenario and a set of settings would do
//! before running them for real.
//!
//! # Usage
//!
//! ```text
//! cargo run --bin cplus-plan -- [OPTIONS] <SCENARIO> <SETTINGS> <CATALOG>
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use cplus_pipeline::gateway::LayerCatalog;
use cplus_pipeline::{
    AnalysisConfig, GatewayRequest, MapSettings, RecordingGateway, RunDiagnostics, RunState,
    Scenario, ScenarioResult, ScenarioTask,
};
use serde::Serialize;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Dry-run a scenario analysis.
///
/// Reads a scenario, a settings store and a layer catalog (all JSON),
/// runs every stage against a recording gateway and prints the raster
/// operations the run would perform.
#[derive(Parser)]
#[command(name = "cplus-plan", version)]
struct Cli {
    /// Scenario JSON file.
    scenario: PathBuf,

    /// Settings store JSON file (`values` and `priority_layers`).
    settings: PathBuf,

    /// Layer catalog JSON file (`rasters` and `vectors` keyed by path).
    catalog: PathBuf,

    /// Directory for scenario directories; overrides the `base_dir` setting.
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Directory for temporary outputs.
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Study-area polygon layer pathways are clipped to.
    #[arg(long)]
    study_area: Option<PathBuf>,

    /// Output the plan as JSON instead of a human-readable report.
    #[arg(long)]
    json: bool,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

/// Everything printed by `--json`.
#[derive(Serialize)]
struct Plan<'a> {
    state: RunState,
    error: Option<String>,
    result: Option<&'a ScenarioResult>,
    requests: Vec<GatewayRequest>,
    diagnostics: &'a RunDiagnostics,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("Error reading {what} {}: {e}", path.display()))?;
    serde_json::from_str(&text).map_err(|e| format!("Error parsing {what} {}: {e}", path.display()))
}

fn init_tracing(verbose: bool) -> Result<(), String> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Error setting up logging: {e}"))
}

fn run(cli: &Cli) -> Result<bool, String> {
    let scenario: Scenario = read_json(&cli.scenario, "scenario")?;
    let settings: MapSettings = read_json(&cli.settings, "settings")?;
    let catalog: LayerCatalog = read_json(&cli.catalog, "layer catalog")?;

    let mut config = AnalysisConfig::from_settings(&settings);
    if let Some(base_dir) = &cli.base_dir {
        config.base_dir.clone_from(base_dir);
    }
    let scratch_dir = cli
        .scratch_dir
        .clone()
        .unwrap_or_else(|| config.base_dir.join("scratch"));

    eprintln!("Scenario: {} ({})", scenario.name, scenario.uuid);
    eprintln!("Activities: {}", scenario.activities.len());
    eprintln!("Base directory: {}", config.base_dir.display());
    eprintln!();

    let gateway = RecordingGateway::with_catalog(scratch_dir, catalog);
    let mut task = ScenarioTask::new(scenario, &gateway, &settings, config);
    if let Some(study_area) = &cli.study_area {
        task = task.with_study_area(study_area);
    }
    let outcome = task.run().map(|_| ()).map_err(|e| e.to_string());
    let requests = gateway.requests();

    if cli.json {
        let plan = Plan {
            state: task.state(),
            error: outcome.as_ref().err().cloned(),
            result: task.result(),
            requests,
            diagnostics: task.diagnostics(),
        };
        let json = serde_json::to_string_pretty(&plan)
            .map_err(|e| format!("Error serializing plan: {e}"))?;
        println!("{json}");
    } else {
        println!("Planned operations\n{}", "=".repeat(60));
        for (index, request) in requests.iter().enumerate() {
            let output = request
                .output_file()
                .map_or_else(|| "(temporary)".to_string(), |p| p.display().to_string());
            println!("{:>3}. {:<22} -> {output}", index + 1, request.operation().name());
        }
        println!();
        println!("{}", task.diagnostics().report());
        println!();
        match (&outcome, task.result()) {
            (Ok(()), Some(result)) => {
                println!("Scenario output: {}", result.output_path().display());
            }
            (Err(e), _) => println!("Run {}: {e}", task.state()),
            (Ok(()), None) => println!("Run {}", task.state()),
        }
    }
    Ok(outcome.is_ok())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(msg) = init_tracing(cli.verbose) {
        eprintln!("{msg}");
        return ExitCode::FAILURE;
    }

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(msg) => {
            eprintln!("{msg}");
            ExitCode::FAILURE
        }
    }
}
