//! The restricted master problem of the column-generation loop.
//!
//! The master mixes a convex combination of previously generated building configurations,
//! sizes the district-scope units, and prices the shared layers. Its balance-row duals and
//! convexity duals are the shadow prices handed back to the building subproblems.
use crate::building::BuildingID;
use crate::error::{FailureKind, kind};
use crate::infrastructure::{Layer, LayerID, Unit, UnitFixing, UnitID};
use crate::model::hub::sizing_cost;
use crate::model::{DualPrices, ModelSolution, ObjectiveValues, Sizing};
use crate::scenario::{EmooTarget, Objective};
use crate::subproblem::Campaign;
use anyhow::{Result, anyhow, ensure};
use highs::{HighsModelStatus, RowProblem as Problem, Sense};
use indexmap::IndexMap;
use log::debug;

/// Maximum number of retained columns per building
pub const N_MAX_COLUMNS: usize = 200;

/// A weight this close to one is treated as a binary selection
pub const WEIGHT_ONE: f64 = 0.999;

/// One building configuration: a feasible sizing-plus-dispatch point offered to the master.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// The full labeled subproblem solution, kept for result extraction
    pub solution: ModelSolution,
    /// Net import per shared layer per concatenated timestep
    pub flows: IndexMap<LayerID, Vec<f64>>,
    /// Master cost coefficient: the boundary-independent part of the objective
    pub cost: f64,
    /// Reduced cost at admission, used for eviction
    pub reduced_cost: f64,
}

impl Column {
    /// Package a subproblem solution as a column.
    pub fn new(
        solution: ModelSolution,
        shared_layers: &[LayerID],
        objective: Objective,
        reduced_cost: f64,
    ) -> Self {
        let n_steps = solution
            .imports
            .values()
            .next()
            .map_or(0, Vec::len);
        let flows = shared_layers
            .iter()
            .map(|layer| {
                let series = (0..n_steps)
                    .map(|step| solution.boundary_flow(layer, step))
                    .collect();
                (layer.clone(), series)
            })
            .collect();
        let cost = solution.objectives.internal(objective);
        Self {
            solution,
            flows,
            cost,
            reduced_cost,
        }
    }
}

/// The per-building column pools. Append-only within one decomposition run, except for
/// worst-reduced-cost eviction once a pool is full.
#[derive(Debug, Default)]
pub struct ColumnPool {
    columns: IndexMap<BuildingID, Vec<Column>>,
}

impl ColumnPool {
    /// Offer a column; a full pool accepts it only in place of a worse retained one.
    ///
    /// Returns whether the column was admitted.
    pub fn offer(&mut self, building: BuildingID, column: Column) -> bool {
        let pool = self.columns.entry(building).or_default();
        if pool.len() < N_MAX_COLUMNS {
            pool.push(column);
            return true;
        }

        let (worst, _) = pool
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.reduced_cost.total_cmp(&b.1.reduced_cost))
            .expect("Full pool is non-empty");
        if column.reduced_cost < pool[worst].reduced_cost {
            pool[worst] = column;
            true
        } else {
            false
        }
    }

    /// The columns of one building
    pub fn of_building(&self, building: &BuildingID) -> &[Column] {
        self.columns
            .get(building)
            .map_or(&[], Vec::as_slice)
    }

    /// Iterate over (building, columns) in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&BuildingID, &[Column])> {
        self.columns
            .iter()
            .map(|(building, columns)| (building, columns.as_slice()))
    }

    /// Total number of retained columns
    pub fn len(&self) -> usize {
        self.columns.values().map(Vec::len).sum()
    }

    /// Whether no column has been admitted yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The duals of one relaxed master solve
#[derive(Debug, Clone, PartialEq)]
pub struct MasterDuals {
    /// Dual of the shared-layer balance per (layer, timestep)
    pub pi: IndexMap<LayerID, Vec<f64>>,
    /// Dual of each building's convexity constraint
    pub nu: IndexMap<BuildingID, f64>,
}

impl MasterDuals {
    /// The shadow-price snapshot for one building's pricing solve
    pub fn for_building(&self, building: &BuildingID) -> DualPrices {
        DualPrices {
            pi: self.pi.clone(),
            nu: self.nu.get(building).copied().unwrap_or(0.0),
        }
    }
}

/// The outcome of one master solve
#[derive(Debug, Clone)]
pub struct MasterSolution {
    /// The master objective value
    pub objective: f64,
    /// Column weights per building, aligned with the pool order
    pub weights: IndexMap<BuildingID, Vec<f64>>,
    /// Shadow prices; absent for the binary master
    pub duals: Option<MasterDuals>,
    /// District-unit sizing, dispatch and network exchange
    pub district: ModelSolution,
}

impl MasterSolution {
    /// The selected column per building: the weight at or above [`WEIGHT_ONE`], or the largest
    /// weight as the rounding fallback.
    pub fn selected(&self) -> IndexMap<BuildingID, usize> {
        self.weights
            .iter()
            .map(|(building, weights)| {
                let best = weights
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map_or(0, |(index, _)| index);
                (building.clone(), best)
            })
            .collect()
    }
}

/// A key identifying one master decision variable
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum VarKey {
    /// Weight of one column of one building
    Weight(BuildingID, usize),
    /// District-unit install decision
    Install(UnitID),
    /// District-unit capacity
    Mult(UnitID),
    /// District-unit activity
    Activity(UnitID, usize),
    /// District-storage charge
    Charge(UnitID, usize),
    /// District-storage discharge
    Discharge(UnitID, usize),
    /// District-storage state of charge
    Soc(UnitID, usize),
    /// External import at the network hub
    Import(LayerID, usize),
    /// External export at the network hub
    Export(LayerID, usize),
}

/// Assembles and solves one restricted master problem.
pub struct MasterProblem<'a> {
    campaign: Campaign<'a>,
    objective: Objective,
    emoo: &'a [(EmooTarget, f64)],
    fixing: &'a IndexMap<UnitID, UnitFixing>,
}

impl<'a> MasterProblem<'a> {
    /// Set up a master for one objective and epsilon set.
    pub fn new(
        campaign: Campaign<'a>,
        objective: Objective,
        emoo: &'a [(EmooTarget, f64)],
        fixing: &'a IndexMap<UnitID, UnitFixing>,
    ) -> Self {
        Self {
            campaign,
            objective,
            emoo,
            fixing,
        }
    }

    /// The layers buildings exchange with the network
    pub fn shared_layers(&self) -> Vec<LayerID> {
        self.campaign
            .catalog
            .layers
            .values()
            .filter(|layer| layer.supply_allowed || layer.demand_allowed)
            .map(|layer| layer.id.clone())
            .collect()
    }

    /// Solve the master over the given pool, relaxed or binary.
    pub fn solve(&self, pool: &ColumnPool, binary: bool) -> Result<MasterSolution> {
        for building in self.campaign.buildings.keys() {
            ensure!(
                !pool.of_building(building).is_empty(),
                "No column for building {building} in the master pool"
            );
        }

        let n_steps: usize = self
            .campaign
            .grid
            .periods
            .iter()
            .map(|period| period.time_end)
            .sum();
        let shared = self.shared_layers();
        let district_units: Vec<&Unit> = self.campaign.catalog.units_of_district().collect();

        let mut problem = Problem::default();
        let mut variables: IndexMap<VarKey, highs::Col> = IndexMap::new();
        let mut costs: Vec<f64> = Vec::new();

        // Column weights, costed at the boundary-independent part of their objective
        for (building, columns) in pool.iter() {
            for (index, column) in columns.iter().enumerate() {
                let var = if binary {
                    problem.add_integer_column(column.cost, 0.0..=1.0)
                } else {
                    problem.add_column(column.cost, 0.0..=1.0)
                };
                costs.push(column.cost);
                variables.insert(VarKey::Weight(building.clone(), index), var);
            }
        }

        // District units, relaxed alongside the weights
        for unit in &district_units {
            let fixing = self.fixing.get(&unit.id).copied();
            let install_bounds = match fixing {
                Some(UnitFixing::Enforced) => (1.0, 1.0),
                Some(UnitFixing::Excluded) => (0.0, 0.0),
                None => (0.0, 1.0),
            };
            let mult_upper = match fixing {
                Some(UnitFixing::Excluded) => 0.0,
                _ => unit.parameters.f_max,
            };
            let (install_cost, mult_cost) = sizing_cost(unit, self.objective);

            let install = if binary {
                problem.add_integer_column(install_cost, install_bounds.0..=install_bounds.1)
            } else {
                problem.add_column(install_cost, install_bounds.0..=install_bounds.1)
            };
            costs.push(install_cost);
            variables.insert(VarKey::Install(unit.id.clone()), install);
            let mult = problem.add_column(mult_cost, 0.0..=mult_upper);
            costs.push(mult_cost);
            variables.insert(VarKey::Mult(unit.id.clone()), mult);

            for step in 0..n_steps {
                let keys = if unit.is_storage {
                    vec![
                        VarKey::Charge(unit.id.clone(), step),
                        VarKey::Discharge(unit.id.clone(), step),
                        VarKey::Soc(unit.id.clone(), step),
                    ]
                } else {
                    vec![VarKey::Activity(unit.id.clone(), step)]
                };
                for key in keys {
                    let var = problem.add_column(0.0, 0.0..=mult_upper);
                    costs.push(0.0);
                    variables.insert(key, var);
                }
            }
        }

        // External network exchange
        for layer_id in &shared {
            let layer = &self.campaign.catalog.layers[layer_id];
            let capacity = layer.network_capacity + layer.reinforcement_capacity;
            for step in 0..n_steps {
                if layer.supply_allowed {
                    let cost = self.import_cost(layer, step);
                    let var = problem.add_column(cost, 0.0..=capacity);
                    costs.push(cost);
                    variables.insert(VarKey::Import(layer_id.clone(), step), var);
                }
                if layer.demand_allowed {
                    let cost = self.export_cost(layer, step);
                    let var = problem.add_column(cost, 0.0..=capacity);
                    costs.push(cost);
                    variables.insert(VarKey::Export(layer_id.clone(), step), var);
                }
            }
        }

        // Shared-layer balances come first so their duals sit at the front of the dual rows
        let mut balance_keys: Vec<(LayerID, usize)> = Vec::new();
        let mut terms: Vec<(highs::Col, f64)> = Vec::new();
        for layer_id in &shared {
            for step in 0..n_steps {
                for (building, columns) in pool.iter() {
                    for (index, column) in columns.iter().enumerate() {
                        let flow = column.flows.get(layer_id).map_or(0.0, |series| series[step]);
                        if flow != 0.0 {
                            let var = variables[&VarKey::Weight(building.clone(), index)];
                            terms.push((var, flow));
                        }
                    }
                }
                for unit in &district_units {
                    if unit.is_storage {
                        if let Some(&coefficient) = unit.consumes.get(layer_id) {
                            let var = variables[&VarKey::Charge(unit.id.clone(), step)];
                            terms.push((var, coefficient));
                        }
                        if let Some(&coefficient) = unit.produces.get(layer_id) {
                            let var = variables[&VarKey::Discharge(unit.id.clone(), step)];
                            terms.push((var, -coefficient));
                        }
                    } else {
                        let net = unit.produces.get(layer_id).copied().unwrap_or(0.0)
                            - unit.consumes.get(layer_id).copied().unwrap_or(0.0);
                        if net != 0.0 {
                            let var = variables[&VarKey::Activity(unit.id.clone(), step)];
                            terms.push((var, -net));
                        }
                    }
                }
                if let Some(&var) = variables.get(&VarKey::Import(layer_id.clone(), step)) {
                    terms.push((var, -1.0));
                }
                if let Some(&var) = variables.get(&VarKey::Export(layer_id.clone(), step)) {
                    terms.push((var, 1.0));
                }

                problem.add_row(0.0..=0.0, terms.drain(0..));
                balance_keys.push((layer_id.clone(), step));
            }
        }

        // Convexity: one configuration's worth of weight per building
        let convexity_buildings: Vec<BuildingID> = pool
            .iter()
            .map(|(building, _)| building.clone())
            .collect();
        for building in &convexity_buildings {
            let terms: Vec<(highs::Col, f64)> = pool
                .of_building(building)
                .iter()
                .enumerate()
                .map(|(index, _)| (variables[&VarKey::Weight(building.clone(), index)], 1.0))
                .collect();
            problem.add_row(1.0..=1.0, terms);
        }

        // District-unit structure: install links, capacity, storage dynamics
        for unit in &district_units {
            let install = variables[&VarKey::Install(unit.id.clone())];
            let mult = variables[&VarKey::Mult(unit.id.clone())];
            problem.add_row(..=0.0, [(mult, 1.0), (install, -unit.parameters.f_max)]);
            problem.add_row(0.0.., [(mult, 1.0), (install, -unit.parameters.f_min)]);
            for step in 0..n_steps {
                let keys = if unit.is_storage {
                    vec![
                        VarKey::Charge(unit.id.clone(), step),
                        VarKey::Discharge(unit.id.clone(), step),
                        VarKey::Soc(unit.id.clone(), step),
                    ]
                } else {
                    vec![VarKey::Activity(unit.id.clone(), step)]
                };
                for key in keys {
                    problem.add_row(..=0.0, [(variables[&key], 1.0), (mult, -1.0)]);
                }
            }
            if unit.is_storage {
                for (step, next) in
                    crate::model::hub::successor_steps(self.campaign.grid, self.campaign.options.interperiod_storage, n_steps)
                {
                    let soc = variables[&VarKey::Soc(unit.id.clone(), step)];
                    let soc_next = variables[&VarKey::Soc(unit.id.clone(), next)];
                    let charge = variables[&VarKey::Charge(unit.id.clone(), step)];
                    let discharge = variables[&VarKey::Discharge(unit.id.clone(), step)];
                    problem.add_row(
                        0.0..=0.0,
                        [(soc_next, 1.0), (soc, -1.0), (charge, -1.0), (discharge, 1.0)],
                    );
                }
            }
        }

        // Epsilon constraints at the district accounting level
        self.add_emoo_rows(&mut problem, &variables, pool, &district_units, n_steps);

        let mut model = problem.optimise(Sense::Minimise);
        model.set_option("output_flag", false);
        if let Some(limit) = self.campaign.options.solver_time_limit {
            model.set_option("time_limit", limit);
        }
        let solved = model.solve();
        match solved.status() {
            HighsModelStatus::Optimal => {}
            HighsModelStatus::Infeasible | HighsModelStatus::UnboundedOrInfeasible => {
                return Err(anyhow!("Master problem is infeasible")
                    .context(kind(FailureKind::MasterInfeasible)));
            }
            status => {
                return Err(anyhow!("Master solve failed with status {status:?}")
                    .context(kind(FailureKind::SolverError)));
            }
        }

        let solution = solved.get_solution();
        let values = solution.columns().to_vec();
        let objective: f64 = costs.iter().zip(&values).map(|(cost, value)| cost * value).sum();
        debug!("Master objective {objective:.6} over {} columns", pool.len());

        let value_of = |key: &VarKey| -> f64 {
            variables
                .get_index_of(key)
                .map_or(0.0, |index| values[index])
        };

        let weights: IndexMap<BuildingID, Vec<f64>> = pool
            .iter()
            .map(|(building, columns)| {
                let building_weights = (0..columns.len())
                    .map(|index| value_of(&VarKey::Weight(building.clone(), index)))
                    .collect();
                (building.clone(), building_weights)
            })
            .collect();

        // Duals are only meaningful for the relaxed linear master
        let duals = (!binary).then(|| {
            let dual_rows = solution.dual_rows();
            let mut pi: IndexMap<LayerID, Vec<f64>> = shared
                .iter()
                .map(|layer| (layer.clone(), vec![0.0; n_steps]))
                .collect();
            for (row, (layer, step)) in balance_keys.iter().enumerate() {
                pi[layer][*step] = dual_rows[row];
            }
            let nu = convexity_buildings
                .iter()
                .enumerate()
                .map(|(index, building)| {
                    (building.clone(), dual_rows[balance_keys.len() + index])
                })
                .collect();
            MasterDuals { pi, nu }
        });

        let district =
            self.extract_district(&district_units, &shared, n_steps, &value_of);

        Ok(MasterSolution {
            objective,
            weights,
            duals,
            district,
        })
    }

    /// Objective coefficient of external import on `layer` at `step`
    fn import_cost(&self, layer: &Layer, step: usize) -> f64 {
        let weight = self.step_weight(step);
        match self.objective {
            Objective::Opex | Objective::Totex => {
                weight * self.campaign.profiles.supply_tariff(&layer.id, step)
            }
            Objective::Gwp => weight * self.campaign.profiles.emission_factors[&layer.id][step],
            Objective::Capex => 0.0,
        }
    }

    /// Objective coefficient of external export on `layer` at `step`
    fn export_cost(&self, layer: &Layer, step: usize) -> f64 {
        match self.objective {
            Objective::Opex | Objective::Totex => {
                -self.step_weight(step) * self.campaign.profiles.feedin_tariff(&layer.id, step)
            }
            Objective::Gwp | Objective::Capex => 0.0,
        }
    }

    /// The annual weight (owning period frequency) of a concatenated timestep
    fn step_weight(&self, step: usize) -> f64 {
        let grid = self.campaign.grid;
        let mut offset = 0;
        for period in &grid.periods {
            if step < offset + period.time_end {
                return period.frequency;
            }
            offset += period.time_end;
        }
        unreachable!("Step beyond the reduced grid")
    }

    fn add_emoo_rows(
        &self,
        problem: &mut Problem,
        variables: &IndexMap<VarKey, highs::Col>,
        pool: &ColumnPool,
        district_units: &[&Unit],
        n_steps: usize,
    ) {
        for (target, cap) in self.emoo {
            match target {
                EmooTarget::Objective(objective) => {
                    let mut terms: Vec<(highs::Col, f64)> = Vec::new();
                    for (building, columns) in pool.iter() {
                        for (index, column) in columns.iter().enumerate() {
                            let coefficient = column.solution.objectives.internal(*objective);
                            if coefficient != 0.0 {
                                terms.push((
                                    variables[&VarKey::Weight(building.clone(), index)],
                                    coefficient,
                                ));
                            }
                        }
                    }
                    for unit in district_units {
                        let (install_cost, mult_cost) = sizing_cost(unit, *objective);
                        if install_cost != 0.0 {
                            terms.push((variables[&VarKey::Install(unit.id.clone())], install_cost));
                        }
                        if mult_cost != 0.0 {
                            terms.push((variables[&VarKey::Mult(unit.id.clone())], mult_cost));
                        }
                    }
                    for layer_id in self.shared_layers() {
                        for step in 0..n_steps {
                            let import_cost = match objective {
                                Objective::Opex | Objective::Totex => {
                                    self.step_weight(step)
                                        * self.campaign.profiles.supply_tariff(&layer_id, step)
                                }
                                Objective::Gwp => {
                                    self.step_weight(step)
                                        * self.campaign.profiles.emission_factors[&layer_id][step]
                                }
                                Objective::Capex => 0.0,
                            };
                            let export_cost = match objective {
                                Objective::Opex | Objective::Totex => {
                                    -self.step_weight(step)
                                        * self.campaign.profiles.feedin_tariff(&layer_id, step)
                                }
                                Objective::Gwp | Objective::Capex => 0.0,
                            };
                            if import_cost != 0.0
                                && let Some(&var) =
                                    variables.get(&VarKey::Import(layer_id.clone(), step))
                            {
                                terms.push((var, import_cost));
                            }
                            if export_cost != 0.0
                                && let Some(&var) =
                                    variables.get(&VarKey::Export(layer_id.clone(), step))
                            {
                                terms.push((var, export_cost));
                            }
                        }
                    }
                    problem.add_row(..=*cap, terms);
                }
                EmooTarget::Grid(layer) => {
                    let layers: Vec<LayerID> = match layer {
                        Some(layer) => vec![layer.clone()],
                        None => self.shared_layers(),
                    };
                    for layer in layers {
                        for step in 0..n_steps {
                            let mut terms = Vec::new();
                            if let Some(&var) = variables.get(&VarKey::Import(layer.clone(), step)) {
                                terms.push((var, 1.0));
                            }
                            if let Some(&var) = variables.get(&VarKey::Export(layer.clone(), step)) {
                                terms.push((var, 1.0));
                            }
                            if !terms.is_empty() {
                                problem.add_row(..=*cap, terms);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Read back the district-unit and network-exchange values as a labeled solution.
    fn extract_district(
        &self,
        district_units: &[&Unit],
        shared: &[LayerID],
        n_steps: usize,
        value_of: &dyn Fn(&VarKey) -> f64,
    ) -> ModelSolution {
        let mut sizing = IndexMap::new();
        let mut unit_flows: IndexMap<(UnitID, LayerID), Vec<f64>> = IndexMap::new();
        let mut soc = IndexMap::new();
        let mut capex = 0.0;
        let mut gwp_construction = 0.0;
        for unit in district_units {
            let install = value_of(&VarKey::Install(unit.id.clone()));
            let mult = value_of(&VarKey::Mult(unit.id.clone()));
            sizing.insert(
                unit.id.clone(),
                Sizing {
                    installed: install > 0.5,
                    mult,
                },
            );
            // The rounding fallback can leave install fractional; the sizing terms follow the
            // solved level so they match what the objective charged
            let (install_capex, mult_capex) = sizing_cost(unit, Objective::Capex);
            capex += install_capex * install + mult_capex * mult;
            let (install_gwp, mult_gwp) = sizing_cost(unit, Objective::Gwp);
            gwp_construction += install_gwp * install + mult_gwp * mult;
            if unit.is_storage {
                soc.insert(
                    unit.id.clone(),
                    (0..n_steps)
                        .map(|step| value_of(&VarKey::Soc(unit.id.clone(), step)))
                        .collect(),
                );
            }
            for layer in self.campaign.catalog.layers.keys() {
                let series: Vec<f64> = (0..n_steps)
                    .map(|step| {
                        if unit.is_storage {
                            let charge = value_of(&VarKey::Charge(unit.id.clone(), step));
                            let discharge = value_of(&VarKey::Discharge(unit.id.clone(), step));
                            unit.produces.get(layer).copied().unwrap_or(0.0) * discharge
                                - unit.consumes.get(layer).copied().unwrap_or(0.0) * charge
                        } else {
                            let activity = value_of(&VarKey::Activity(unit.id.clone(), step));
                            (unit.produces.get(layer).copied().unwrap_or(0.0)
                                - unit.consumes.get(layer).copied().unwrap_or(0.0))
                                * activity
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
        for layer_id in shared {
            let import_series: Vec<f64> = (0..n_steps)
                .map(|step| value_of(&VarKey::Import(layer_id.clone(), step)))
                .collect();
            let export_series: Vec<f64> = (0..n_steps)
                .map(|step| value_of(&VarKey::Export(layer_id.clone(), step)))
                .collect();
            for step in 0..n_steps {
                let weight = self.step_weight(step);
                opex += weight
                    * (self.campaign.profiles.supply_tariff(layer_id, step) * import_series[step]
                        - self.campaign.profiles.feedin_tariff(layer_id, step)
                            * export_series[step]);
                gwp_operation += weight
                    * self.campaign.profiles.emission_factors[layer_id][step]
                    * import_series[step];
            }
            imports.insert(layer_id.clone(), import_series);
            exports.insert(layer_id.clone(), export_series);
        }

        ModelSolution {
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
            solver_objective: 0.0,
            timed_out: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::building::BuildingMap;
    use crate::clustering::ReducedGrid;
    use crate::error::failure_kind;
    use crate::fixture::{buildings, catalog, grid};
    use crate::infrastructure::Catalog;
    use crate::model::Scope;
    use crate::model::hub::HubModel;
    use crate::profiles::Profiles;
    use crate::scenario::{ObjectiveSpec, Scenario};
    use crate::settings::MethodOptions;
    use crate::subproblem::{SolveRequest, SubproblemDriver};
    use float_cmp::assert_approx_eq;
    use rstest::rstest;

    struct Setup {
        buildings: BuildingMap,
        catalog: Catalog,
        grid: ReducedGrid,
        profiles: Profiles,
        options: MethodOptions,
    }

    fn setup(buildings: BuildingMap, catalog: Catalog, grid: ReducedGrid) -> Setup {
        let options = MethodOptions::default();
        let profiles = Profiles::assemble(&buildings, &catalog, &grid, &options).unwrap();
        Setup {
            buildings,
            catalog,
            grid,
            profiles,
            options,
        }
    }

    fn campaign(setup: &Setup) -> Campaign<'_> {
        Campaign {
            buildings: &setup.buildings,
            catalog: &setup.catalog,
            grid: &setup.grid,
            profiles: &setup.profiles,
            options: &setup.options,
        }
    }

    fn scenario() -> Scenario {
        Scenario {
            name: "baseline".into(),
            objective: ObjectiveSpec::Single(Objective::Totex),
            emoo: IndexMap::new(),
            specific: Vec::new(),
            exclude_units: Vec::new(),
            enforce_units: Vec::new(),
            n_pareto: 0,
        }
    }

    /// One tariff-priced column per building, as the initiating step produces
    fn initial_pool(setup: &Setup, shared: &[LayerID]) -> ColumnPool {
        let scenario = scenario();
        let driver = SubproblemDriver::new(campaign(setup), &HubModel, &scenario).unwrap();
        let mut pool = ColumnPool::default();
        for building in setup.buildings.keys() {
            let (solution, _) = driver
                .solve(&SolveRequest::new(
                    Scope::Building(building.clone()),
                    Objective::Totex,
                ))
                .unwrap();
            pool.offer(
                building.clone(),
                Column::new(solution, shared, Objective::Totex, 0.0),
            );
        }
        pool
    }

    #[rstest]
    fn test_relaxed_master(buildings: BuildingMap, catalog: Catalog, grid: ReducedGrid) {
        let setup = setup(buildings, catalog, grid);
        let fixing = IndexMap::new();
        let master = MasterProblem::new(campaign(&setup), Objective::Totex, &[], &fixing);
        let pool = initial_pool(&setup, &master.shared_layers());

        let solution = master.solve(&pool, false).unwrap();

        // One column per building: its weight is forced to one by convexity
        for weights in solution.weights.values() {
            assert_eq!(weights.len(), 1);
            assert_approx_eq!(f64, weights[0], 1.0, epsilon = 1e-6);
        }
        let duals = solution.duals.as_ref().unwrap();
        assert_eq!(duals.nu.len(), 2);
        for series in duals.pi.values() {
            assert_eq!(series.len(), 10);
        }
        assert!(solution.objective > 0.0);
    }

    #[rstest]
    fn test_binary_master_selects_one(
        buildings: BuildingMap,
        catalog: Catalog,
        grid: ReducedGrid,
    ) {
        let setup = setup(buildings, catalog, grid);
        let fixing = IndexMap::new();
        let master = MasterProblem::new(campaign(&setup), Objective::Totex, &[], &fixing);
        let pool = initial_pool(&setup, &master.shared_layers());

        let solution = master.solve(&pool, true).unwrap();
        assert!(solution.duals.is_none());
        let selected = solution.selected();
        assert_eq!(selected.len(), 2);
        for (building, index) in &selected {
            assert!(solution.weights[building][*index] >= WEIGHT_ONE);
        }
    }

    #[rstest]
    fn test_master_balances_column_flows(
        buildings: BuildingMap,
        catalog: Catalog,
        grid: ReducedGrid,
    ) {
        let setup = setup(buildings, catalog, grid);
        let fixing = IndexMap::new();
        let master = MasterProblem::new(campaign(&setup), Objective::Totex, &[], &fixing);
        let shared = master.shared_layers();
        let pool = initial_pool(&setup, &shared);

        let solution = master.solve(&pool, false).unwrap();
        // Network exchange covers the sum of selected column flows plus district dispatch
        for layer in &shared {
            for step in 0..10 {
                let columns: f64 = pool
                    .iter()
                    .zip(solution.weights.values())
                    .map(|((_, cols), weights)| {
                        cols.iter()
                            .zip(weights)
                            .map(|(col, &weight)| {
                                weight * col.flows.get(layer).map_or(0.0, |series| series[step])
                            })
                            .sum::<f64>()
                    })
                    .sum();
                let district: f64 = solution
                    .district
                    .unit_flows
                    .iter()
                    .filter(|((_, flow_layer), _)| flow_layer == layer)
                    .map(|(_, series)| series[step])
                    .sum();
                let external = solution.district.boundary_flow(layer, step);
                assert_approx_eq!(f64, columns - district, external, epsilon = 1e-5);
            }
        }
    }

    #[rstest]
    fn test_district_sizing_priced_at_solved_install(
        buildings: BuildingMap,
        catalog: Catalog,
        grid: ReducedGrid,
    ) {
        let setup = setup(buildings, catalog, grid);
        let fixing = IndexMap::new();
        let master = MasterProblem::new(campaign(&setup), Objective::Totex, &[], &fixing);
        let shared = master.shared_layers();
        let district_units: Vec<&Unit> = setup.catalog.units_of_district().collect();

        // A fractional install, as the relaxed fallback produces
        let value_of = |key: &VarKey| match key {
            VarKey::Install(_) => 0.4,
            VarKey::Mult(_) => 30.0,
            _ => 0.0,
        };
        let district = master.extract_district(&district_units, &shared, 10, &value_of);

        let battery_id: UnitID = "DistrictBattery".into();
        let battery = &setup.catalog.units[&battery_id];
        let (install_capex, mult_capex) = sizing_cost(battery, Objective::Capex);
        assert_approx_eq!(
            f64,
            district.objectives.capex,
            0.4 * install_capex + 30.0 * mult_capex
        );
        let (install_gwp, mult_gwp) = sizing_cost(battery, Objective::Gwp);
        assert_approx_eq!(
            f64,
            district.objectives.gwp_construction,
            0.4 * install_gwp + 30.0 * mult_gwp
        );
    }

    #[rstest]
    fn test_master_requires_columns(buildings: BuildingMap, catalog: Catalog, grid: ReducedGrid) {
        let setup = setup(buildings, catalog, grid);
        let fixing = IndexMap::new();
        let master = MasterProblem::new(campaign(&setup), Objective::Totex, &[], &fixing);
        assert!(master.solve(&ColumnPool::default(), false).is_err());
    }

    #[test]
    fn test_pool_eviction() {
        let solution = ModelSolution {
            sizing: IndexMap::new(),
            unit_flows: IndexMap::new(),
            soc: IndexMap::new(),
            imports: IndexMap::new(),
            exports: IndexMap::new(),
            objectives: Default::default(),
            solver_objective: 0.0,
            timed_out: false,
        };
        let mut pool = ColumnPool::default();
        for index in 0..N_MAX_COLUMNS {
            let column = Column {
                solution: solution.clone(),
                flows: IndexMap::new(),
                cost: 0.0,
                reduced_cost: -(index as f64),
            };
            assert!(pool.offer("b1".into(), column));
        }

        // A worse column bounces off a full pool; a better one evicts the worst retained
        let worse = Column {
            solution: solution.clone(),
            flows: IndexMap::new(),
            cost: 0.0,
            reduced_cost: 1.0,
        };
        assert!(!pool.offer("b1".into(), worse));
        let better = Column {
            solution,
            flows: IndexMap::new(),
            cost: 0.0,
            reduced_cost: -1e9,
        };
        assert!(pool.offer("b1".into(), better));
        assert_eq!(pool.of_building(&"b1".into()).len(), N_MAX_COLUMNS);
    }

    #[test]
    fn test_failure_kind_master() {
        let err = anyhow!("boom").context(kind(FailureKind::MasterInfeasible));
        assert_eq!(failure_kind(&err), Some(FailureKind::MasterInfeasible));
    }
}
