//! The model-bundle seam: the contract between the orchestrator and the MILP formulation.
//!
//! The orchestrator feeds a bundle named sets and parameters and reads named variable values
//! back. The built-in [`hub::HubModel`] expresses the hub MILP directly over HiGHS; alternative
//! formulations plug in through the [`ModelBundle`] trait.
use crate::building::{BuildingID, BuildingMap};
use crate::clustering::ReducedGrid;
use crate::infrastructure::{Catalog, LayerID, UnitFixing, UnitID};
use crate::profiles::Profiles;
use crate::scenario::{EmooTarget, Objective};
use crate::settings::MethodOptions;
use anyhow::{Result, bail};
use indexmap::IndexMap;

pub mod hub;

/// What the solve covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// One building, its units only
    Building(BuildingID),
    /// Every building plus the district-scope units, coupled through the shared layers
    District,
}

impl Scope {
    /// Whether a unit owned by `building` (or none for district units) is in scope
    pub fn covers(&self, building: Option<&BuildingID>) -> bool {
        match self {
            Self::District => true,
            Self::Building(own) => building == Some(own),
        }
    }
}

/// How boundary flows to the shared layers are priced
#[derive(Debug, Clone, PartialEq)]
pub enum BoundaryPricing {
    /// Layer tariffs apply at the boundary (monolithic and initiating solves)
    Tariff,
    /// Master shadow prices replace the tariffs (column-generation pricing solves)
    Duals(DualPrices),
}

/// A snapshot of the master duals passed to one subproblem task.
///
/// Owned, so tasks share no state with the master between iterations.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DualPrices {
    /// Dual of the shared-layer balance per (layer, concatenated timestep)
    pub pi: IndexMap<LayerID, Vec<f64>>,
    /// Dual of the building's convexity constraint
    pub nu: f64,
}

impl DualPrices {
    /// The price on `layer` at concatenated timestep `step`, zero when the layer is unpriced
    pub fn price(&self, layer: &LayerID, step: usize) -> f64 {
        self.pi.get(layer).map_or(0.0, |prices| prices[step])
    }
}

/// Everything a bundle needs to assemble one solve.
pub struct ModelInputs<'a> {
    /// What the solve covers
    pub scope: Scope,
    /// The building catalog
    pub buildings: &'a BuildingMap,
    /// The infrastructure catalog
    pub catalog: &'a Catalog,
    /// The reduced time grid
    pub grid: &'a ReducedGrid,
    /// Demand and environmental series on the grid
    pub profiles: &'a Profiles,
    /// The objective to minimize
    pub objective: Objective,
    /// Epsilon constraints, resolved to (target, cap)
    pub emoo: &'a [(EmooTarget, f64)],
    /// Named extra-constraint toggles
    pub specific: &'a [String],
    /// Units fixed in or out by the scenario
    pub fixing: &'a IndexMap<UnitID, UnitFixing>,
    /// How boundary flows are priced
    pub pricing: BoundaryPricing,
    /// Method options
    pub options: &'a MethodOptions,
    /// Relax the install binaries to [0, 1]
    pub relaxed: bool,
}

/// Sizing decision of one unit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sizing {
    /// The install decision
    pub installed: bool,
    /// The installed capacity (kW, or kWh for storage)
    pub mult: f64,
}

/// Annualized objective values of one solution
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ObjectiveValues {
    /// Operating expenditure at the layer tariffs, in currency/y
    pub opex: f64,
    /// Annualized investment expenditure, in currency/y
    pub capex: f64,
    /// Construction (embedded) emissions, in kgCO2/y
    pub gwp_construction: f64,
    /// Operational emissions, in kgCO2/y
    pub gwp_operation: f64,
}

impl ObjectiveValues {
    /// Total expenditure
    pub fn totex(&self) -> f64 {
        self.opex + self.capex
    }

    /// Total global warming potential
    pub fn gwp(&self) -> f64 {
        self.gwp_construction + self.gwp_operation
    }

    /// The value of one scalar objective
    pub fn value(&self, objective: Objective) -> f64 {
        match objective {
            Objective::Opex => self.opex,
            Objective::Capex => self.capex,
            Objective::Totex => self.totex(),
            Objective::Gwp => self.gwp(),
        }
    }

    /// The part of the objective that does not depend on boundary tariffs.
    ///
    /// This is what a column costs the master problem; boundary purchases are re-priced there.
    pub fn internal(&self, objective: Objective) -> f64 {
        match objective {
            Objective::Opex => 0.0,
            Objective::Capex | Objective::Totex => self.capex,
            Objective::Gwp => self.gwp_construction,
        }
    }
}

impl std::ops::AddAssign for ObjectiveValues {
    fn add_assign(&mut self, rhs: Self) {
        self.opex += rhs.opex;
        self.capex += rhs.capex;
        self.gwp_construction += rhs.gwp_construction;
        self.gwp_operation += rhs.gwp_operation;
    }
}

/// The labeled variable values of one solve.
///
/// Time-resolved vectors are indexed by the concatenated timestep of the reduced grid.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSolution {
    /// Sizing per unit instance in scope
    pub sizing: IndexMap<UnitID, Sizing>,
    /// Signed flow per (unit, layer): positive production, negative consumption, in kW
    pub unit_flows: IndexMap<(UnitID, LayerID), Vec<f64>>,
    /// State of charge per storage unit, in kWh
    pub soc: IndexMap<UnitID, Vec<f64>>,
    /// Import from the network per layer, in kW
    pub imports: IndexMap<LayerID, Vec<f64>>,
    /// Export to the network per layer, in kW
    pub exports: IndexMap<LayerID, Vec<f64>>,
    /// Objective breakdown at the layer tariffs
    pub objectives: ObjectiveValues,
    /// Raw solver objective (tariff- or dual-priced, depending on the pricing mode)
    pub solver_objective: f64,
    /// The solver hit its time limit; values are the best feasible point found
    pub timed_out: bool,
}

impl ModelSolution {
    /// Net import (import minus export) on `layer` at `step`
    pub fn boundary_flow(&self, layer: &LayerID, step: usize) -> f64 {
        let import = self.imports.get(layer).map_or(0.0, |series| series[step]);
        let export = self.exports.get(layer).map_or(0.0, |series| series[step]);
        import - export
    }
}

/// A MILP formulation the orchestrator can drive.
///
/// Implementations must be freely shareable across the subproblem worker threads.
pub trait ModelBundle: Send + Sync {
    /// The bundle name, used in settings and logs
    fn name(&self) -> &str;

    /// Assemble and solve the model for the given inputs.
    fn solve(&self, inputs: &ModelInputs) -> Result<ModelSolution>;
}

/// Look up a model bundle by name.
pub fn bundle_by_name(name: &str) -> Result<Box<dyn ModelBundle>> {
    match name {
        hub::HUB_MODEL_NAME => Ok(Box::new(hub::HubModel)),
        other => bail!("Unknown model bundle '{other}'"),
    }
}
