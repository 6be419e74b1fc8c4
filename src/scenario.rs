//! Scenario objects: what to optimize, which epsilon caps apply, which units are forced in or out.
use crate::error::{FailureKind, kind};
use crate::infrastructure::LayerID;
use crate::input::read_toml;
use anyhow::{Context, Result, bail, ensure};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use strum::{Display, EnumString};

/// File holding the scenarios of a model directory
const SCENARIOS_FILE_NAME: &str = "scenarios.toml";

/// A scalar objective the optimizer can minimize or cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum Objective {
    /// Annual operating expenditure
    #[strum(serialize = "OPEX")]
    #[serde(rename = "OPEX")]
    Opex,
    /// Annualized investment expenditure
    #[strum(serialize = "CAPEX")]
    #[serde(rename = "CAPEX")]
    Capex,
    /// Total expenditure (OPEX + CAPEX)
    #[strum(serialize = "TOTEX")]
    #[serde(rename = "TOTEX")]
    Totex,
    /// Global warming potential, construction and operation
    #[strum(serialize = "GWP")]
    #[serde(rename = "GWP")]
    Gwp,
}

/// An epsilon constraint: cap one quantity while another is optimized.
#[derive(Debug, Clone, PartialEq)]
pub enum EmooTarget {
    /// Cap a scalar objective
    Objective(Objective),
    /// Cap grid exchange on one layer, or on every shared layer when no layer is named
    Grid(Option<LayerID>),
}

/// A scenario: objective(s), epsilon caps, extra constraint toggles and unit fixing lists.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Scenario label, used in result keys
    pub name: String,
    /// The objective to minimize; two entries request a Pareto front
    #[serde(rename = "Objective")]
    pub objective: ObjectiveSpec,
    /// Epsilon constraints: target name to cap value.
    ///
    /// Recognized names are the objectives plus `grid` (every shared layer) and `grid:<layer>`.
    #[serde(rename = "EMOO", default)]
    pub emoo: IndexMap<String, f64>,
    /// Ordered list of named extra-constraint toggles passed to the model bundle
    #[serde(default)]
    pub specific: Vec<String>,
    /// Unit families or instances fixed to `Use = 0, Mult = 0`
    #[serde(default)]
    pub exclude_units: Vec<String>,
    /// Unit families or instances fixed to `Use = 1`
    #[serde(default)]
    pub enforce_units: Vec<String>,
    /// Number of intermediate Pareto points
    #[serde(rename = "nPareto", default)]
    pub n_pareto: u32,
}

/// One objective or a pair of objectives
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ObjectiveSpec {
    /// Single-objective run
    Single(Objective),
    /// Multi-objective run with a Pareto sweep
    Pair(Objective, Objective),
}

impl Scenario {
    /// Validate the scenario, classifying failures as [`FailureKind::InvalidScenario`].
    pub fn validate(&self) -> Result<()> {
        self.check().context(kind(FailureKind::InvalidScenario))
    }

    fn check(&self) -> Result<()> {
        ensure!(!self.name.is_empty(), "Scenario name cannot be empty");

        // Every EMOO key must parse
        for target in self.emoo.keys() {
            parse_emoo_target(target)?;
        }

        // A unit cannot be both enforced and excluded
        let excluded: HashSet<&str> = self.exclude_units.iter().map(String::as_str).collect();
        for enforced in &self.enforce_units {
            ensure!(
                !excluded.contains(enforced.as_str()),
                "Unit {enforced} is both enforced and excluded"
            );
        }

        if let ObjectiveSpec::Pair(first, second) = &self.objective {
            ensure!(
                first != second,
                "Multi-objective scenario requires two distinct objectives"
            );
        }

        Ok(())
    }

    /// The single objective of this scenario, or an error for Pareto scenarios.
    pub fn single_objective(&self) -> Result<Objective> {
        match self.objective {
            ObjectiveSpec::Single(objective) => Ok(objective),
            ObjectiveSpec::Pair(..) => {
                bail!("Scenario {} declares two objectives", self.name)
            }
        }
    }

    /// Iterate over the parsed epsilon constraints.
    ///
    /// Call [`Scenario::validate`] first; unknown names panic here.
    pub fn iter_emoo(&self) -> impl Iterator<Item = (EmooTarget, f64)> + '_ {
        self.emoo.iter().map(|(name, cap)| {
            let target = parse_emoo_target(name).expect("EMOO target not validated");
            (target, *cap)
        })
    }
}

/// The scenarios file: an array of `[[scenario]]` tables
#[derive(Debug, Deserialize)]
struct ScenarioFile {
    #[serde(rename = "scenario")]
    scenarios: Vec<Scenario>,
}

/// Read and validate the scenarios of the given model directory.
pub fn read_scenarios(model_dir: &Path) -> Result<Vec<Scenario>> {
    let file_path = model_dir.join(SCENARIOS_FILE_NAME);
    let file: ScenarioFile = read_toml(&file_path)?;
    ensure!(
        !file.scenarios.is_empty(),
        "{} declares no scenario",
        file_path.display()
    );

    let mut names = HashSet::new();
    for scenario in &file.scenarios {
        scenario
            .validate()
            .with_context(|| format!("Invalid scenario {}", scenario.name))?;
        ensure!(
            names.insert(scenario.name.as_str()),
            "Duplicate scenario name {}",
            scenario.name
        );
    }
    Ok(file.scenarios)
}

/// Parse an EMOO key into its target.
fn parse_emoo_target(name: &str) -> Result<EmooTarget> {
    if let Ok(objective) = name.parse::<Objective>() {
        return Ok(EmooTarget::Objective(objective));
    }
    if name == "grid" {
        return Ok(EmooTarget::Grid(None));
    }
    if let Some(layer) = name.strip_prefix("grid:") {
        ensure!(!layer.is_empty(), "Empty layer in EMOO target '{name}'");
        return Ok(EmooTarget::Grid(Some(layer.into())));
    }

    bail!("Unknown EMOO target '{name}'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::failure_kind;
    use map_macro::hash_set;
    use rstest::{fixture, rstest};

    #[fixture]
    pub fn scenario() -> Scenario {
        Scenario {
            name: "baseline".into(),
            objective: ObjectiveSpec::Single(Objective::Totex),
            emoo: IndexMap::new(),
            specific: Vec::new(),
            exclude_units: vec!["Battery".into()],
            enforce_units: Vec::new(),
            n_pareto: 0,
        }
    }

    #[rstest]
    fn test_validate_ok(scenario: Scenario) {
        scenario.validate().unwrap();
    }

    #[rstest]
    fn test_validate_conflicting_fixing(mut scenario: Scenario) {
        scenario.enforce_units.push("Battery".into());
        let err = scenario.validate().unwrap_err();
        assert_eq!(failure_kind(&err), Some(FailureKind::InvalidScenario));
    }

    #[rstest]
    fn test_validate_unknown_emoo(mut scenario: Scenario) {
        scenario.emoo.insert("NPV".into(), 1.0);
        assert!(scenario.validate().is_err());
    }

    #[rstest]
    fn test_iter_emoo(mut scenario: Scenario) {
        scenario.emoo.insert("GWP".into(), 500.0);
        scenario.emoo.insert("grid".into(), 100.0);
        scenario.emoo.insert("grid:Electricity".into(), 50.0);
        scenario.validate().unwrap();

        let targets: Vec<_> = scenario.iter_emoo().collect();
        assert_eq!(
            targets[0],
            (EmooTarget::Objective(Objective::Gwp), 500.0)
        );
        assert_eq!(targets[1], (EmooTarget::Grid(None), 100.0));
        assert_eq!(
            targets[2],
            (EmooTarget::Grid(Some("Electricity".into())), 50.0)
        );
    }

    #[test]
    fn test_objective_names_roundtrip() {
        let names = hash_set! {"OPEX", "CAPEX", "TOTEX", "GWP"};
        for name in names {
            let objective: Objective = name.parse().unwrap();
            assert_eq!(objective.to_string(), name);
        }
    }

    #[test]
    fn test_objective_spec_deserialize() {
        let single: ObjectiveSpec = from_toml_fragment("\"TOTEX\"");
        assert_eq!(single, ObjectiveSpec::Single(Objective::Totex));
        let pair: ObjectiveSpec = from_toml_fragment("[\"OPEX\", \"CAPEX\"]");
        assert_eq!(pair, ObjectiveSpec::Pair(Objective::Opex, Objective::Capex));
    }

    #[test]
    fn test_read_scenarios() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SCENARIOS_FILE_NAME),
            concat!(
                "[[scenario]]\n",
                "name = \"baseline\"\n",
                "Objective = \"TOTEX\"\n",
                "\n",
                "[[scenario]]\n",
                "name = \"green\"\n",
                "Objective = [\"TOTEX\", \"GWP\"]\n",
                "nPareto = 2\n",
                "exclude_units = [\"Battery\"]\n",
            ),
        )
        .unwrap();

        let scenarios = read_scenarios(dir.path()).unwrap();
        assert_eq!(scenarios.len(), 2);
        assert_eq!(scenarios[1].n_pareto, 2);
        assert_eq!(
            scenarios[1].objective,
            ObjectiveSpec::Pair(Objective::Totex, Objective::Gwp)
        );
    }

    #[test]
    fn test_read_scenarios_duplicate_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SCENARIOS_FILE_NAME),
            "[[scenario]]\nname = \"a\"\nObjective = \"TOTEX\"\n\n[[scenario]]\nname = \"a\"\nObjective = \"OPEX\"\n",
        )
        .unwrap();
        assert!(read_scenarios(dir.path()).is_err());
    }

    /// Deserialize from a TOML value fragment
    fn from_toml_fragment<T: serde::de::DeserializeOwned>(fragment: &str) -> T {
        #[derive(Deserialize)]
        struct Wrapper<T> {
            v: T,
        }
        let wrapper: Wrapper<T> = toml::from_str(&format!("v = {fragment}")).unwrap();
        wrapper.v
    }
}
