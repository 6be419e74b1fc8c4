//! The command line interface of the optimizer.
use crate::building::read_buildings;
use crate::clustering::{ClusterOptions, cache};
use crate::decomposition::Decomposition;
use crate::infrastructure::Catalog;
use crate::log;
use crate::model::hub::HubModel;
use crate::output::{self, OutputFormat, ResultSet, create_output_directory, get_output_dir};
use crate::pareto::ParetoDriver;
use crate::profiles::Profiles;
use crate::results::aggregate;
use crate::scenario::{ObjectiveSpec, Scenario, read_scenarios};
use crate::settings::Settings;
use crate::subproblem::{Campaign, SubproblemDriver};
use crate::weather::AnnualSeries;
use ::log::info;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

/// File holding the annual meteorological series of a model directory
const WEATHER_FILE_NAME: &str = "weather.csv";

/// The command line interface of the optimizer.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// The available commands
    #[command(subcommand)]
    pub command: Commands,
}

/// Options for the run command
#[derive(Args)]
pub struct RunOpts {
    /// Directory for output files
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,
    /// Whether to overwrite existing output files instead of suffixing new ones
    #[arg(long)]
    pub overwrite: bool,
    /// Output format: dict, csv or archive
    #[arg(long, default_value_t = OutputFormat::Csv)]
    pub format: OutputFormat,
}

/// The available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the scenarios of a model.
    Run {
        /// Path to the model directory
        model_dir: PathBuf,
        /// Other run options
        #[command(flatten)]
        opts: RunOpts,
    },
    /// Validate a model directory without solving anything.
    Validate {
        /// Path to the model directory
        model_dir: PathBuf,
    },
}

/// Handle the `run` command.
pub fn handle_run_command(model_dir: &Path, opts: &RunOpts) -> Result<()> {
    let settings = Settings::from_path(model_dir)?;
    let output_dir = match &opts.output_dir {
        Some(dir) => dir.clone(),
        None => get_output_dir(model_dir)?,
    };
    create_output_directory(&output_dir).context("Failed to create output directory")?;
    log::init(settings.log_level.as_deref(), Some(&output_dir))
        .context("Failed to initialize logging")?;

    let buildings = read_buildings(model_dir)?;
    let catalog = Catalog::from_path(model_dir, &buildings)?;
    let series = AnnualSeries::from_path(&model_dir.join(WEATHER_FILE_NAME))?;
    let scenarios = read_scenarios(model_dir)?;
    info!(
        "Model loaded: {} buildings, {} units, {} scenarios",
        buildings.len(),
        catalog.units.len(),
        scenarios.len()
    );

    let location = model_dir
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("model");
    let clustering = cache::cluster_or_load(
        &series,
        &ClusterOptions::new(location),
        &output_dir.join("clusters"),
    )?;
    let profiles = Profiles::assemble(&buildings, &catalog, &clustering.grid, &settings.method)?;
    let campaign = Campaign {
        buildings: &buildings,
        catalog: &catalog,
        grid: &clustering.grid,
        profiles: &profiles,
        options: &settings.method,
    };

    let mut set = ResultSet::default();
    for scenario in &scenarios {
        info!("Running scenario {}", scenario.name);
        run_scenario(campaign, &settings, scenario, &mut set)?;
    }

    let overwrite = opts.overwrite || settings.overwrite;
    output::write(&set, &output_dir, opts.format, "results", overwrite)?;
    info!("Done: {} result bundles", set.len());
    Ok(())
}

/// Solve one scenario and file its bundles in the result set.
fn run_scenario(
    campaign: Campaign,
    settings: &Settings,
    scenario: &Scenario,
    set: &mut ResultSet,
) -> Result<()> {
    let driver = SubproblemDriver::new(campaign, &HubModel, scenario)?;
    match scenario.objective {
        ObjectiveSpec::Single(objective) => {
            let outcome =
                Decomposition::new(campaign, &driver, settings, objective, Vec::new()).run()?;
            set.insert(aggregate(&campaign, &outcome, &scenario.name, 1)?);
        }
        ObjectiveSpec::Pair(first, second) => {
            let points = ParetoDriver::new(campaign, &driver, settings).run(
                first,
                second,
                scenario.n_pareto,
            )?;
            for point in points {
                // Unreachable points stay off the result set
                if let Some(outcome) = point.outcome {
                    set.insert(aggregate(&campaign, &outcome, &scenario.name, point.id)?);
                }
            }
        }
    }
    Ok(())
}

/// Handle the `validate` command: load and check every input, solve nothing.
pub fn handle_validate_command(model_dir: &Path) -> Result<()> {
    let settings = Settings::from_path(model_dir)?;
    log::init(settings.log_level.as_deref(), None).context("Failed to initialize logging")?;

    let buildings = read_buildings(model_dir)?;
    let catalog = Catalog::from_path(model_dir, &buildings)?;
    AnnualSeries::from_path(&model_dir.join(WEATHER_FILE_NAME))?;
    let scenarios = read_scenarios(model_dir)?;
    for scenario in &scenarios {
        catalog.resolve_fixing(&scenario.enforce_units, &scenario.exclude_units)?;
    }
    info!(
        "Model is valid: {} buildings, {} units, {} scenarios",
        buildings.len(),
        catalog.units.len(),
        scenarios.len()
    );
    Ok(())
}
