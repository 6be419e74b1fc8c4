//! Writing result bundles to disk.
//!
//! Three formats are supported: keeping the bundles in memory (`dict`), one CSV file per
//! non-empty table (`csv`), and a single TOML archive per run (`archive`). File formats filter
//! all-zero rows so that sparse dispatch tables stay readable; descriptive columns such as
//! lifetimes never count toward zero-ness.
use crate::error::{FailureKind, kind};
use crate::results::{
    AnnualRow, BuildingFlowRow, BuildingRow, GridRow, PerformanceRow, ResultBundle, TimeRow,
    UnitFlowRow, UnitRow,
};
use anyhow::{Context, Result};
use indexmap::IndexMap;
use log::info;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use strum::{Display, EnumString};

/// The root folder in which model-specific output folders are created
const OUTPUT_DIRECTORY_ROOT: &str = "rehub_results";

/// How result bundles are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    /// Keep the bundles in memory only
    Dict,
    /// One CSV file per non-empty table
    #[default]
    Csv,
    /// A single TOML archive for the whole run
    Archive,
}

/// Every bundle of one program run, keyed by scenario name and ordered by Pareto ID
#[derive(Debug, Default, Serialize)]
pub struct ResultSet {
    /// Bundles per scenario, in Pareto ID order
    pub scenarios: IndexMap<String, Vec<ResultBundle>>,
}

impl ResultSet {
    /// File in the set under its scenario key.
    pub fn insert(&mut self, bundle: ResultBundle) {
        self.scenarios
            .entry(bundle.scenario.clone())
            .or_default()
            .push(bundle);
    }

    /// Look one bundle up by scenario name and Pareto ID.
    pub fn bundle(&self, scenario: &str, pareto_id: u32) -> Option<&ResultBundle> {
        self.scenarios
            .get(scenario)?
            .iter()
            .find(|bundle| bundle.pareto_id == pareto_id)
    }

    /// Total number of bundles
    pub fn len(&self) -> usize {
        self.scenarios.values().map(Vec::len).sum()
    }

    /// Whether the set holds no bundle
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Derive the output directory from the model directory name.
pub fn get_output_dir(model_dir: &Path) -> Result<PathBuf> {
    let model_dir = model_dir
        .canonicalize()
        .context("Could not resolve path to model")?;
    let model_name = model_dir
        .file_name()
        .context("Model cannot be in root folder")?
        .to_str()
        .context("Invalid chars in model dir name")?;

    Ok([OUTPUT_DIRECTORY_ROOT, model_name].iter().collect())
}

/// Create the output directory, with parents, if it does not exist yet.
pub fn create_output_directory(output_dir: &Path) -> Result<()> {
    if output_dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(output_dir).context(kind(FailureKind::IoError))
}

/// Persist a result set.
///
/// Returns the files written; the `dict` format writes nothing. With `overwrite` disabled, a
/// deterministic numeric suffix is appended whenever a target file already exists.
pub fn write(
    set: &ResultSet,
    output_dir: &Path,
    format: OutputFormat,
    stem: &str,
    overwrite: bool,
) -> Result<Vec<PathBuf>> {
    if format == OutputFormat::Dict {
        return Ok(Vec::new());
    }
    create_output_directory(output_dir)?;

    let mut written = Vec::new();
    match format {
        OutputFormat::Dict => unreachable!(),
        OutputFormat::Csv => {
            for bundles in set.scenarios.values() {
                for bundle in bundles {
                    written.extend(write_bundle_csv(bundle, output_dir, stem, overwrite)?);
                }
            }
        }
        OutputFormat::Archive => {
            let path = target_path(output_dir, &format!("{stem}.toml"), overwrite)?;
            let contents = toml::to_string(set).context("Could not serialize result set")?;
            fs::write(&path, contents)
                .with_context(|| format!("Could not write {}", path.display()))
                .context(kind(FailureKind::IoError))?;
            written.push(path);
        }
    }
    info!("Wrote {} result files to {}", written.len(), output_dir.display());
    Ok(written)
}

/// One CSV file per non-empty table of one bundle
fn write_bundle_csv(
    bundle: &ResultBundle,
    output_dir: &Path,
    stem: &str,
    overwrite: bool,
) -> Result<Vec<PathBuf>> {
    let prefix = format!("{stem}_{}_{}", bundle.scenario, bundle.pareto_id);
    let mut written = Vec::new();
    let mut write_table = |name: &str, contents: &[u8]| -> Result<()> {
        if contents.is_empty() {
            return Ok(());
        }
        let path = target_path(output_dir, &format!("{prefix}_{name}.csv"), overwrite)?;
        fs::write(&path, contents)
            .with_context(|| format!("Could not write {}", path.display()))
            .context(kind(FailureKind::IoError))?;
        written.push(path);
        Ok(())
    };

    write_table("Performance", &to_csv(&bundle.performance)?)?;
    write_table("Annuals", &to_csv(&bundle.annuals)?)?;
    write_table("Unit", &to_csv(&bundle.units)?)?;
    write_table("Grid_t", &to_csv(&bundle.grid_t)?)?;
    write_table("Unit_t", &to_csv(&bundle.unit_t)?)?;
    write_table("Time", &to_csv(&bundle.time)?)?;
    write_table("Buildings", &to_csv(&bundle.buildings)?)?;
    write_table("Buildings_t", &to_csv(&bundle.buildings_t)?)?;
    write_table("KPI", &to_csv(&bundle.kpis)?)?;
    Ok(written)
}

/// Serialize rows to CSV bytes, dropping all-zero rows; empty output means an empty table.
fn to_csv<T: Serialize + FilterRow>(rows: &[T]) -> Result<Vec<u8>> {
    let kept: Vec<&T> = rows.iter().filter(|row| !row.is_zero()).collect();
    if kept.is_empty() {
        return Ok(Vec::new());
    }
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in kept {
        writer.serialize(row).context("Could not serialize row")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("Could not finish CSV buffer: {err}"))
}

/// The path to write, resolving collisions with a numeric suffix when overwrite is disabled
fn target_path(output_dir: &Path, file_name: &str, overwrite: bool) -> Result<PathBuf> {
    let path = output_dir.join(file_name);
    if overwrite || !path.exists() {
        return Ok(path);
    }

    let (base, extension) = file_name
        .rsplit_once('.')
        .unwrap_or((file_name, ""));
    // Smallest free counter keeps the suffix deterministic
    for counter in 1.. {
        let candidate = output_dir.join(format!("{base}_{counter}.{extension}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    unreachable!("Counter space exhausted");
}

/// Whether a row is all-zero for filtering purposes; descriptive columns do not count.
trait FilterRow {
    fn is_zero(&self) -> bool {
        false
    }
}

impl FilterRow for PerformanceRow {}
impl FilterRow for TimeRow {}
impl FilterRow for BuildingRow {}
impl FilterRow for crate::kpi::KpiRow {}

impl FilterRow for AnnualRow {
    fn is_zero(&self) -> bool {
        self.supply_mwh == 0.0 && self.demand_mwh == 0.0
    }
}

impl FilterRow for UnitRow {
    // Lifetime is descriptive and excluded from the test
    fn is_zero(&self) -> bool {
        !self.installed && self.mult == 0.0
    }
}

impl FilterRow for GridRow {
    // Tariff and emission columns are descriptive and excluded from the test
    fn is_zero(&self) -> bool {
        self.supply == 0.0 && self.demand == 0.0
    }
}

impl FilterRow for UnitFlowRow {
    fn is_zero(&self) -> bool {
        self.flow == 0.0
    }
}

impl FilterRow for BuildingFlowRow {
    fn is_zero(&self) -> bool {
        self.demand == 0.0
    }
}
