//! The built-in hub MILP: unit sizing, hourly dispatch and network exchange over the reduced
//! time grid.
//!
//! Variables are tracked in an ordered map so the solver's column values can be read back by
//! key. Layer balance rows are added before every other row so their dual values can be read
//! off the front of the dual-row vector by the master problem.
use super::{
    BoundaryPricing, ModelBundle, ModelInputs, ModelSolution, ObjectiveValues, Scope, Sizing,
};
use crate::building::BuildingID;
use crate::error::{FailureKind, kind};
use crate::infrastructure::{Layer, LayerID, Unit, UnitFixing, UnitID};
use crate::scenario::{EmooTarget, Objective};
use anyhow::{Result, anyhow};
use highs::{HighsModelStatus, RowProblem as Problem, Sense};
use indexmap::IndexMap;
use log::debug;

/// The name under which the built-in bundle is registered
pub const HUB_MODEL_NAME: &str = "hub";

/// Exergy efficiency applied to the Carnot COP of heat pumps
const CARNOT_EFFICIENCY: f64 = 0.45;

/// COP bounds guarding the linearization against extreme source temperatures
const COP_RANGE: (f64, f64) = (1.0, 7.0);

/// Minimum sink-source temperature lift in the COP computation, in K
const MIN_TEMPERATURE_LIFT: f64 = 5.0;

/// The named extra-constraint toggles the hub model recognizes
const SPECIFIC_CONSTRAINTS: [&str; 2] = ["no_import", "no_export"];

/// The built-in hub formulation
pub struct HubModel;

impl ModelBundle for HubModel {
    fn name(&self) -> &str {
        HUB_MODEL_NAME
    }

    fn solve(&self, inputs: &ModelInputs) -> Result<ModelSolution> {
        for name in inputs.specific {
            if !SPECIFIC_CONSTRAINTS.contains(&name.as_str()) {
                return Err(anyhow!("Unknown specific constraint '{name}'")
                    .context(kind(FailureKind::InvalidScenario)));
            }
        }

        let mut builder = Builder::new(inputs);
        builder.add_variables();
        builder.add_balance_rows();
        builder.add_sizing_rows();
        builder.add_storage_rows();
        builder.add_emoo_rows()?;
        builder.run()
    }
}

/// A decision variable: a column of the problem, without its value
type Variable = highs::Col;

/// A key identifying one decision variable
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum VarKey {
    /// The binary install decision of a unit
    Install(UnitID),
    /// The continuous capacity of a unit
    Mult(UnitID),
    /// Main activity of a converting unit at one timestep
    Activity(UnitID, usize),
    /// Charging power of a storage unit
    Charge(UnitID, usize),
    /// Discharging power of a storage unit
    Discharge(UnitID, usize),
    /// State of charge of a storage unit
    Soc(UnitID, usize),
    /// Import from the network on one layer
    Import(LayerID, usize),
    /// Export to the network on one layer
    Export(LayerID, usize),
}

/// Assembles and solves one hub problem
struct Builder<'a> {
    inputs: &'a ModelInputs<'a>,
    problem: Problem,
    /// Variables in column order; the parallel `costs` vector mirrors the objective coefficients
    variables: IndexMap<VarKey, Variable>,
    costs: Vec<f64>,
    /// Units in scope, in catalog order
    units: Vec<&'a Unit>,
    /// Timestep weights: the frequency of the owning period, indexed by concatenated timestep
    weights: Vec<f64>,
}

impl<'a> Builder<'a> {
    fn new(inputs: &'a ModelInputs) -> Self {
        let units = inputs
            .catalog
            .units
            .values()
            .filter(|unit| inputs.scope.covers(unit.building.as_ref()))
            .collect();
        let weights = inputs
            .grid
            .iter_timesteps()
            .map(|(p, _)| inputs.grid.weight(p))
            .collect();
        Self {
            inputs,
            problem: Problem::default(),
            variables: IndexMap::new(),
            costs: Vec::new(),
            units,
            weights,
        }
    }

    fn n_steps(&self) -> usize {
        self.weights.len()
    }

    fn add_continuous(&mut self, key: VarKey, cost: f64, upper: f64) {
        let var = self.problem.add_column(cost, 0.0..=upper);
        self.costs.push(cost);
        let clash = self.variables.insert(key, var).is_some();
        assert!(!clash, "Duplicate variable");
    }

    fn add_binary(&mut self, key: VarKey, cost: f64, bounds: (f64, f64)) {
        let var = if self.inputs.relaxed {
            self.problem.add_column(cost, bounds.0..=bounds.1)
        } else {
            self.problem.add_integer_column(cost, bounds.0..=bounds.1)
        };
        self.costs.push(cost);
        let clash = self.variables.insert(key, var).is_some();
        assert!(!clash, "Duplicate variable");
    }

    fn var(&self, key: &VarKey) -> Variable {
        *self.variables.get(key).expect("Variable not created")
    }

    /// Add sizing, dispatch and boundary variables with their objective coefficients.
    fn add_variables(&mut self) {
        let objective = self.inputs.objective;
        let n_steps = self.n_steps();

        for unit in self.units.clone() {
            let fixing = self.inputs.fixing.get(&unit.id).copied();
            let install_bounds = match fixing {
                Some(UnitFixing::Enforced) => (1.0, 1.0),
                Some(UnitFixing::Excluded) => (0.0, 0.0),
                None => (0.0, 1.0),
            };
            let mult_upper = match fixing {
                Some(UnitFixing::Excluded) => 0.0,
                _ => unit.parameters.f_max,
            };

            let (install_cost, mult_cost) = sizing_cost(unit, objective);
            self.add_binary(VarKey::Install(unit.id.clone()), install_cost, install_bounds);
            self.add_continuous(VarKey::Mult(unit.id.clone()), mult_cost, mult_upper);

            if unit.is_storage {
                for step in 0..n_steps {
                    self.add_continuous(VarKey::Charge(unit.id.clone(), step), 0.0, mult_upper);
                    self.add_continuous(VarKey::Discharge(unit.id.clone(), step), 0.0, mult_upper);
                    self.add_continuous(VarKey::Soc(unit.id.clone(), step), 0.0, mult_upper);
                }
            } else {
                for step in 0..n_steps {
                    self.add_continuous(VarKey::Activity(unit.id.clone(), step), 0.0, mult_upper);
                }
            }
        }

        let no_import = self.inputs.specific.iter().any(|name| name == "no_import");
        let no_export = self.inputs.specific.iter().any(|name| name == "no_export");
        for layer in self.inputs.catalog.layers.values().cloned() {
            let capacity = layer.network_capacity + layer.reinforcement_capacity;
            for step in 0..n_steps {
                if layer.supply_allowed && !no_import {
                    let cost = self.import_cost(&layer, step);
                    self.add_continuous(VarKey::Import(layer.id.clone(), step), cost, capacity);
                }
                if layer.demand_allowed && !no_export {
                    let cost = self.export_cost(&layer, step);
                    self.add_continuous(VarKey::Export(layer.id.clone(), step), cost, capacity);
                }
            }
        }
    }

    /// Objective coefficient of one unit of import on `layer` at `step`
    fn import_cost(&self, layer: &Layer, step: usize) -> f64 {
        match &self.inputs.pricing {
            // Pricing mode: the boundary is re-priced by the master; the dual enters with a
            // minus sign because the column's coupling coefficient is the net import
            BoundaryPricing::Duals(duals) => -duals.price(&layer.id, step),
            BoundaryPricing::Tariff => match self.inputs.objective {
                Objective::Opex | Objective::Totex => {
                    self.weights[step] * self.inputs.profiles.supply_tariff(&layer.id, step)
                }
                Objective::Gwp => {
                    self.weights[step] * self.inputs.profiles.emission_factors[&layer.id][step]
                }
                Objective::Capex => 0.0,
            },
        }
    }

    /// Objective coefficient of one unit of export on `layer` at `step`
    fn export_cost(&self, layer: &Layer, step: usize) -> f64 {
        match &self.inputs.pricing {
            BoundaryPricing::Duals(duals) => duals.price(&layer.id, step),
            BoundaryPricing::Tariff => match self.inputs.objective {
                Objective::Opex | Objective::Totex => {
                    -self.weights[step] * self.inputs.profiles.feedin_tariff(&layer.id, step)
                }
                Objective::Gwp | Objective::Capex => 0.0,
            },
        }
    }

    /// The demand served on `layer` at `step`, net of solar gains on the heat layer.
    fn demand(&self, layer: &LayerID, step: usize) -> f64 {
        let buildings: Vec<&BuildingID> = match &self.inputs.scope {
            Scope::Building(building) => vec![building],
            Scope::District => self.inputs.buildings.keys().collect(),
        };
        buildings
            .into_iter()
            .map(|building| {
                let demand = self.inputs.profiles.demand(building, layer, step);
                if layer.as_str() == "Heat" {
                    let gain = self.inputs.profiles.solar_gains[building][step];
                    (demand - gain).max(0.0)
                } else {
                    demand
                }
            })
            .sum()
    }

    /// Per-(layer, timestep) balance rows. Added first: the master reads their duals off the
    /// front of the dual-row vector.
    fn add_balance_rows(&mut self) {
        assert!(
            self.problem.num_rows() == 0,
            "Balance rows must come before every other row"
        );

        let mut terms: Vec<(Variable, f64)> = Vec::new();
        let units = self.units.clone();
        for layer in self.inputs.catalog.layers.values().cloned() {
            for step in 0..self.n_steps() {
                if let Some(&var) = self.variables.get(&VarKey::Import(layer.id.clone(), step)) {
                    terms.push((var, 1.0));
                }
                if let Some(&var) = self.variables.get(&VarKey::Export(layer.id.clone(), step)) {
                    terms.push((var, -1.0));
                }
                for unit in &units {
                    if unit.is_storage {
                        if let Some(&coefficient) = unit.consumes.get(&layer.id) {
                            let var = self.var(&VarKey::Charge(unit.id.clone(), step));
                            terms.push((var, -coefficient));
                        }
                        if let Some(&coefficient) = unit.produces.get(&layer.id) {
                            let var = self.var(&VarKey::Discharge(unit.id.clone(), step));
                            terms.push((var, coefficient));
                        }
                    } else {
                        let net = net_coefficient(self.inputs, unit, &layer.id, step);
                        if net != 0.0 {
                            let var = self.var(&VarKey::Activity(unit.id.clone(), step));
                            terms.push((var, net));
                        }
                    }
                }

                let rhs = self.demand(&layer.id, step);
                self.problem.add_row(rhs..=rhs, terms.drain(0..));
            }
        }
    }

    /// Install/capacity links: `F_min Use <= Mult <= F_max Use`, and activity capped by `Mult`.
    fn add_sizing_rows(&mut self) {
        for unit in self.units.clone() {
            let install = self.var(&VarKey::Install(unit.id.clone()));
            let mult = self.var(&VarKey::Mult(unit.id.clone()));
            self.problem
                .add_row(..=0.0, [(mult, 1.0), (install, -unit.parameters.f_max)]);
            self.problem
                .add_row(0.0.., [(mult, 1.0), (install, -unit.parameters.f_min)]);

            for step in 0..self.n_steps() {
                if unit.is_storage {
                    for key in [
                        VarKey::Charge(unit.id.clone(), step),
                        VarKey::Discharge(unit.id.clone(), step),
                        VarKey::Soc(unit.id.clone(), step),
                    ] {
                        let var = self.var(&key);
                        self.problem.add_row(..=0.0, [(var, 1.0), (mult, -1.0)]);
                    }
                } else {
                    let var = self.var(&VarKey::Activity(unit.id.clone(), step));
                    self.problem.add_row(..=0.0, [(var, 1.0), (mult, -1.0)]);
                }
            }
        }
    }

    /// State-of-charge dynamics: cyclic within each period, or chained across the whole grid
    /// when interperiod storage is enabled.
    fn add_storage_rows(&mut self) {
        let interperiod = self.inputs.options.interperiod_storage;
        let n_steps = self.n_steps();
        for unit in self.units.clone() {
            if !unit.is_storage {
                continue;
            }
            for (step, next) in successor_steps(self.inputs.grid, interperiod, n_steps) {
                let soc = self.var(&VarKey::Soc(unit.id.clone(), step));
                let soc_next = self.var(&VarKey::Soc(unit.id.clone(), next));
                let charge = self.var(&VarKey::Charge(unit.id.clone(), step));
                let discharge = self.var(&VarKey::Discharge(unit.id.clone(), step));
                self.problem.add_row(
                    0.0..=0.0,
                    [(soc_next, 1.0), (soc, -1.0), (charge, -1.0), (discharge, 1.0)],
                );
            }
        }
    }

    /// Epsilon-constraint rows: caps on scalar objectives and on grid exchange.
    fn add_emoo_rows(&mut self) -> Result<()> {
        for (target, cap) in self.inputs.emoo {
            match target {
                EmooTarget::Objective(objective) => {
                    let terms = self.objective_terms(*objective);
                    self.problem.add_row(..=*cap, terms);
                }
                EmooTarget::Grid(layer) => {
                    let layers: Vec<LayerID> = match layer {
                        Some(layer) => {
                            if !self.inputs.catalog.layers.contains_key(layer) {
                                return Err(anyhow!("EMOO grid target on unknown layer {layer}")
                                    .context(kind(FailureKind::InvalidScenario)));
                            }
                            vec![layer.clone()]
                        }
                        // An unqualified grid cap applies to every shared layer
                        None => self.inputs.catalog.layers.keys().cloned().collect(),
                    };
                    for layer in layers {
                        for step in 0..self.n_steps() {
                            let mut terms = Vec::new();
                            if let Some(&var) =
                                self.variables.get(&VarKey::Import(layer.clone(), step))
                            {
                                terms.push((var, 1.0));
                            }
                            if let Some(&var) =
                                self.variables.get(&VarKey::Export(layer.clone(), step))
                            {
                                terms.push((var, 1.0));
                            }
                            if !terms.is_empty() {
                                self.problem.add_row(..=*cap, terms);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// The tariff-valued linear terms of one scalar objective, for epsilon rows.
    fn objective_terms(&self, objective: Objective) -> Vec<(Variable, f64)> {
        let mut terms = Vec::new();
        for unit in &self.units {
            let (install_cost, mult_cost) = sizing_cost(unit, objective);
            if install_cost != 0.0 {
                terms.push((self.var(&VarKey::Install(unit.id.clone())), install_cost));
            }
            if mult_cost != 0.0 {
                terms.push((self.var(&VarKey::Mult(unit.id.clone())), mult_cost));
            }
        }
        for layer in self.inputs.catalog.layers.values() {
            for step in 0..self.n_steps() {
                let import_cost = match objective {
                    Objective::Opex | Objective::Totex => {
                        self.weights[step] * self.inputs.profiles.supply_tariff(&layer.id, step)
                    }
                    Objective::Gwp => {
                        self.weights[step] * self.inputs.profiles.emission_factors[&layer.id][step]
                    }
                    Objective::Capex => 0.0,
                };
                let export_cost = match objective {
                    Objective::Opex | Objective::Totex => {
                        -self.weights[step] * self.inputs.profiles.feedin_tariff(&layer.id, step)
                    }
                    Objective::Gwp | Objective::Capex => 0.0,
                };
                if import_cost != 0.0
                    && let Some(&var) = self.variables.get(&VarKey::Import(layer.id.clone(), step))
                {
                    terms.push((var, import_cost));
                }
                if export_cost != 0.0
                    && let Some(&var) = self.variables.get(&VarKey::Export(layer.id.clone(), step))
                {
                    terms.push((var, export_cost));
                }
            }
        }
        terms
    }

    /// Solve the assembled problem and read the variable values back.
    fn run(self) -> Result<ModelSolution> {
        let Self {
            inputs,
            problem,
            variables,
            costs,
            units,
            weights,
        } = self;

        let mut model = problem.optimise(Sense::Minimise);
        model.set_option("output_flag", false);
        if let Some(limit) = inputs.options.solver_time_limit {
            model.set_option("time_limit", limit);
        }

        let solved = model.solve();
        let timed_out = match solved.status() {
            HighsModelStatus::Optimal => false,
            HighsModelStatus::ReachedTimeLimit => true,
            HighsModelStatus::Infeasible | HighsModelStatus::UnboundedOrInfeasible => {
                return Err(anyhow!("Hub problem is infeasible")
                    .context(kind(FailureKind::Infeasible)));
            }
            HighsModelStatus::Unbounded => {
                return Err(
                    anyhow!("Hub problem is unbounded").context(kind(FailureKind::Unbounded))
                );
            }
            status => {
                return Err(anyhow!("Solver failed with status {status:?}")
                    .context(kind(FailureKind::SolverError)));
            }
        };

        let values = solved.get_solution().columns().to_vec();
        if values.len() != variables.len() {
            let failure = if timed_out {
                FailureKind::SolverTimeout
            } else {
                FailureKind::SolverError
            };
            return Err(anyhow!("Solver returned no usable point").context(kind(failure)));
        }
        debug!(
            "Hub solve finished: {} variables, timed out: {timed_out}",
            variables.len()
        );

        let value_of = |key: &VarKey| -> f64 {
            variables
                .get_index_of(key)
                .map_or(0.0, |index| values[index])
        };
        let solver_objective: f64 = costs.iter().zip(&values).map(|(cost, value)| cost * value).sum();

        let n_steps = weights.len();
        let mut sizing = IndexMap::new();
        let mut unit_flows: IndexMap<(UnitID, LayerID), Vec<f64>> = IndexMap::new();
        let mut soc = IndexMap::new();
        let mut capex = 0.0;
        let mut gwp_construction = 0.0;
        for unit in &units {
            let installed = value_of(&VarKey::Install(unit.id.clone())) > 0.5;
            let mult = value_of(&VarKey::Mult(unit.id.clone()));
            sizing.insert(unit.id.clone(), Sizing { installed, mult });
            if installed {
                capex += unit.parameters.annual_investment(mult);
                gwp_construction += unit.parameters.annual_gwp(mult);
            }

            if unit.is_storage {
                soc.insert(
                    unit.id.clone(),
                    (0..n_steps)
                        .map(|step| value_of(&VarKey::Soc(unit.id.clone(), step)))
                        .collect(),
                );
            }
            for layer in inputs.catalog.layers.keys() {
                let series: Vec<f64> = (0..n_steps)
                    .map(|step| {
                        if unit.is_storage {
                            let charge = value_of(&VarKey::Charge(unit.id.clone(), step));
                            let discharge = value_of(&VarKey::Discharge(unit.id.clone(), step));
                            unit.produces.get(layer).copied().unwrap_or(0.0) * discharge
                                - unit.consumes.get(layer).copied().unwrap_or(0.0) * charge
                        } else {
                            let activity = value_of(&VarKey::Activity(unit.id.clone(), step));
                            net_coefficient(inputs, unit, layer, step) * activity
                        }
                    })
                    .collect();
                if series.iter().any(|&flow| flow != 0.0) {
                    unit_flows.insert((unit.id.clone(), layer.clone()), series);
                }
            }
        }

        let mut imports = IndexMap::new();
        let mut exports = IndexMap::new();
        let mut opex = 0.0;
        let mut gwp_operation = 0.0;
        for layer in inputs.catalog.layers.values() {
            let import_series: Vec<f64> = (0..n_steps)
                .map(|step| value_of(&VarKey::Import(layer.id.clone(), step)))
                .collect();
            let export_series: Vec<f64> = (0..n_steps)
                .map(|step| value_of(&VarKey::Export(layer.id.clone(), step)))
                .collect();
            for step in 0..n_steps {
                opex += weights[step]
                    * (inputs.profiles.supply_tariff(&layer.id, step) * import_series[step]
                        - inputs.profiles.feedin_tariff(&layer.id, step) * export_series[step]);
                gwp_operation += weights[step]
                    * inputs.profiles.emission_factors[&layer.id][step]
                    * import_series[step];
            }
            imports.insert(layer.id.clone(), import_series);
            exports.insert(layer.id.clone(), export_series);
        }

        Ok(ModelSolution {
            sizing,
            unit_flows,
            soc,
            imports,
            exports,
            objectives: ObjectiveValues {
                opex,
                capex,
                gwp_construction,
                gwp_operation,
            },
            solver_objective,
            timed_out,
        })
    }
}

/// Net balance coefficient of a converting unit on `layer` at `step` per unit of activity.
///
/// Heat pumps with a source temperature series get a per-timestep electricity consumption from
/// the Carnot COP; every other coefficient comes straight from the catalog.
fn net_coefficient(inputs: &ModelInputs, unit: &Unit, layer: &LayerID, step: usize) -> f64 {
    let production = unit.produces.get(layer).copied().unwrap_or(0.0);
    let nominal = unit.consumes.get(layer).copied().unwrap_or(0.0);
    if unit.heat_source.is_none() || layer.as_str() != "Electricity" {
        return production - nominal;
    }
    let Some(sources) = inputs.profiles.hp_source_temperatures.get(&unit.id) else {
        return production - nominal;
    };

    let sink = unit
        .stream_temperatures
        .map(|(t_in, _)| t_in)
        .or_else(|| {
            let building = unit.building.as_ref()?;
            Some(inputs.buildings[building].heating_temperatures.0)
        })
        .unwrap_or(55.0);
    let lift = (sink - sources[step]).max(MIN_TEMPERATURE_LIFT);
    let cop = (CARNOT_EFFICIENCY * (sink + 273.15) / lift).clamp(COP_RANGE.0, COP_RANGE.1);
    production - 1.0 / cop
}

/// Annualized objective coefficients of (Install, Mult) for one unit
pub(crate) fn sizing_cost(unit: &Unit, objective: Objective) -> (f64, f64) {
    let parameters = &unit.parameters;
    match objective {
        Objective::Capex | Objective::Totex => (
            (parameters.cost_inv.0 + parameters.cost_rep.0) / parameters.lifetime,
            (parameters.cost_inv.1 + parameters.cost_rep.1) / parameters.lifetime,
        ),
        Objective::Gwp => (
            parameters.gwp.0 / parameters.lifetime,
            parameters.gwp.1 / parameters.lifetime,
        ),
        Objective::Opex => (0.0, 0.0),
    }
}

/// The (step, successor step) pairs of the storage dynamics.
///
/// Cyclic within each period by default; one chain over the whole grid with a year wrap when
/// interperiod storage is enabled.
pub(crate) fn successor_steps(
    grid: &crate::clustering::ReducedGrid,
    interperiod: bool,
    n_steps: usize,
) -> Vec<(usize, usize)> {
    if interperiod {
        return (0..n_steps).map(|step| (step, (step + 1) % n_steps)).collect();
    }
    let mut pairs = Vec::with_capacity(n_steps);
    for (p, period) in grid.periods.iter().enumerate() {
        let offset = grid.offset(p);
        for t in 0..period.time_end {
            pairs.push((offset + t, offset + (t + 1) % period.time_end));
        }
    }
    pairs
}
