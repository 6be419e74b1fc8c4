//! Code for loading program settings and method options.
//!
//! Method options steer how an optimization campaign is assembled: whether the district is solved
//! building by building or with coupling, whether emission factors are time resolved, whether
//! demand profiles are perturbed stochastically, and so on. Unknown keys are rejected rather than
//! ignored so that typos surface immediately.
use crate::input::read_toml;
use anyhow::{Result, ensure};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;

const SETTINGS_FILE_NAME: &str = "settings.toml";

/// Program settings from the settings file
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// The default program log level
    #[serde(default)]
    pub log_level: Option<String>,
    /// Whether to overwrite output files by default
    #[serde(default)]
    pub overwrite: bool,
    /// Method options for the optimization campaign
    #[serde(default)]
    pub method: MethodOptions,
    /// Parameters of the Dantzig-Wolfe decomposition loop
    #[serde(default)]
    pub decomposition: DwSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: None,
            overwrite: false,
            method: MethodOptions::default(),
            decomposition: DwSettings::default(),
        }
    }
}

/// Options steering model assembly and the solution strategy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MethodOptions {
    /// Solve each building independently (decomposition with a single iteration)
    #[serde(default)]
    pub building_scale: bool,
    /// Couple buildings through shared layers and district-scope units
    #[serde(default = "default_true")]
    pub district_scale: bool,
    /// Include facade irradiation in the solar gain computation
    #[serde(default)]
    pub use_facades: bool,
    /// Resolve PV production per roof orientation; accepted but currently ignored
    #[serde(default)]
    pub use_pv_orientation: bool,
    /// Use hourly grid carbon intensity instead of constant emission factors
    #[serde(default)]
    pub use_dynamic_emission_profiles: bool,
    /// Perturb demand profiles stochastically
    #[serde(default)]
    pub include_stochasticity: bool,
    /// Standard deviations for the stochastic perturbation: (amplitude, time shift in hours)
    #[serde(default = "default_sd_stochasticity")]
    pub sd_stochasticity: (f64, f64),
    /// Solve the subproblems of one pricing step in parallel across buildings
    #[serde(default = "default_true")]
    pub parallel_computation: bool,
    /// Skip the epsilon sweep on the second objective in Pareto runs
    #[serde(default)]
    pub switch_off_second_objective: bool,
    /// Keep unit sizing fixed at the values of a previous run; accepted but currently ignored
    #[serde(default)]
    pub fix_units: bool,
    /// Account for the CO2 content of district-heating-network imports; accepted but currently
    /// ignored
    #[serde(default)]
    pub dhn_co2: bool,
    /// Link storage state across typical periods instead of cycling within each period
    #[serde(default)]
    pub interperiod_storage: bool,
    /// Retain every generated column in the result bundle (ignored in building-scale mode)
    #[serde(default)]
    pub include_all_solutions: bool,
    /// Wall-clock limit per solver invocation in seconds; unlimited when absent
    #[serde(default)]
    pub solver_time_limit: Option<f64>,
}

fn default_true() -> bool {
    true
}

fn default_sd_stochasticity() -> (f64, f64) {
    (0.1, 1.0)
}

impl Default for MethodOptions {
    fn default() -> Self {
        // serde defaults double as programmatic defaults
        toml::from_str("").expect("Cannot create method options from empty TOML")
    }
}

/// Parameters of the Dantzig-Wolfe decomposition loop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DwSettings {
    /// Maximum number of iterations, the last being reserved for the binary master
    #[serde(default = "default_max_iter")]
    pub max_iter: u32,
    /// Relative improvement below which an iteration counts as stalled
    #[serde(default = "default_threshold_no_improvement")]
    pub threshold_no_improvement: f64,
    /// Number of consecutive stalled iterations required to declare convergence
    #[serde(default = "default_termination_iter")]
    pub termination_iter: u32,
}

fn default_max_iter() -> u32 {
    5
}

fn default_threshold_no_improvement() -> f64 {
    0.1
}

fn default_termination_iter() -> u32 {
    3
}

impl Default for DwSettings {
    fn default() -> Self {
        toml::from_str("").expect("Cannot create DW settings from empty TOML")
    }
}

impl Settings {
    /// Read the settings file from the given model directory.
    ///
    /// If the file is not present, default values for settings will be used.
    pub fn from_path(model_dir: &Path) -> Result<Settings> {
        let file_path = model_dir.join(SETTINGS_FILE_NAME);
        if !file_path.is_file() {
            return Ok(Settings::default());
        }

        let settings: Settings = read_toml(&file_path)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.method.building_scale || self.method.district_scale,
            "One of building_scale and district_scale must be enabled"
        );
        ensure!(
            self.decomposition.max_iter >= 1,
            "max_iter must be at least 1"
        );
        ensure!(
            self.method.sd_stochasticity.0 >= 0.0 && self.method.sd_stochasticity.1 >= 0.0,
            "sd_stochasticity values must be non-negative"
        );
        for (enabled, name) in [
            (self.method.use_pv_orientation, "use_pv_orientation"),
            (self.method.fix_units, "fix_units"),
            (self.method.dhn_co2, "dhn_co2"),
        ] {
            if enabled {
                warn!("Method option {name} is not supported and will be ignored");
            }
        }
        Ok(())
    }

    /// The effective iteration cap: building-scale mode is the same state machine with one pass.
    pub fn effective_max_iter(&self) -> u32 {
        if self.method.building_scale {
            1
        } else {
            self.decomposition.max_iter
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_settings_from_path_no_file() {
        let dir = tempdir().unwrap();
        assert_eq!(Settings::from_path(dir.path()).unwrap(), Settings::default());
    }

    #[test]
    fn test_settings_from_path() {
        let dir = tempdir().unwrap();
        {
            let mut file = File::create(dir.path().join(SETTINGS_FILE_NAME)).unwrap();
            writeln!(
                file,
                "log_level = \"warn\"\n[method]\nbuilding_scale = true\n[decomposition]\nmax_iter = 3"
            )
            .unwrap();
        }

        let settings = Settings::from_path(dir.path()).unwrap();
        assert_eq!(settings.log_level.as_deref(), Some("warn"));
        assert!(settings.method.building_scale);
        assert_eq!(settings.decomposition.max_iter, 3);
        assert_eq!(settings.effective_max_iter(), 1);
    }

    #[test]
    fn test_settings_rejects_unknown_keys() {
        let dir = tempdir().unwrap();
        {
            let mut file = File::create(dir.path().join(SETTINGS_FILE_NAME)).unwrap();
            writeln!(file, "not_a_setting = 3").unwrap();
        }

        assert!(Settings::from_path(dir.path()).is_err());
    }

    #[test]
    fn test_ignored_options_still_validate() {
        let mut settings = Settings::default();
        settings.method.use_pv_orientation = true;
        settings.method.fix_units = true;
        settings.method.dhn_co2 = true;
        // Warned about, not rejected
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_default_dw_settings() {
        let dw = DwSettings::default();
        assert_eq!(dw.max_iter, 5);
        assert_eq!(dw.termination_iter, 3);
        assert_eq!(dw.threshold_no_improvement, 0.1);
    }
}
