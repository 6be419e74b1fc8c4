//! The column-generation loop coupling building subproblems through the restricted master.
//!
//! One run walks the classic phases: initiating columns at grid tariffs, alternating relaxed
//! master solves with dual-priced building solves until the pricing step stops paying off, and
//! closing with a binary master that picks one configuration per building.
use crate::building::BuildingID;
use crate::error::{FailureKind, failure_kind};
use crate::master::{Column, ColumnPool, MasterProblem, MasterSolution};
use crate::model::{ModelSolution, ObjectiveValues, Scope};
use crate::scenario::{EmooTarget, Objective};
use crate::settings::{DwSettings, Settings};
use crate::subproblem::{Campaign, SolveRequest, SolveStatus, SubproblemDriver};
use anyhow::Result;
use indexmap::IndexMap;
use log::{info, warn};
use std::thread;

/// Reduced-cost admission threshold, scaled by the master objective's magnitude
pub const RC_TOLERANCE: f64 = 1e-4;

/// Convergence is never declared before this iteration
const MIN_CONVERGENCE_ITER: u32 = 3;

/// The outcome of one decomposition run
#[derive(Debug)]
pub struct DwOutcome {
    /// The final master solution, binary unless the rounding fallback was taken
    pub master: MasterSolution,
    /// Every column retained over the run
    pub pool: ColumnPool,
    /// Number of pricing iterations performed
    pub iterations: u32,
    /// Whether the loop stopped on the convergence test rather than the iteration cap
    pub converged: bool,
}

impl DwOutcome {
    /// The column the final master selected for each building
    pub fn selected_solutions(&self) -> IndexMap<BuildingID, &ModelSolution> {
        self.master
            .selected()
            .into_iter()
            .map(|(building, index)| {
                let solution = &self.pool.of_building(&building)[index].solution;
                (building, solution)
            })
            .collect()
    }

    /// Objective breakdown of the whole district.
    ///
    /// Operating cost and emissions are the master's, priced at the network meter where
    /// intra-district trades have already netted out; the columns contribute their sizing terms.
    pub fn total_objectives(&self) -> ObjectiveValues {
        let mut total = self.master.district.objectives;
        for solution in self.selected_solutions().values() {
            total.capex += solution.objectives.capex;
            total.gwp_construction += solution.objectives.gwp_construction;
        }
        total
    }
}

/// Stall bookkeeping for the pricing loop.
///
/// Convergence is declared only when neither the master objective nor any building's best
/// reduced cost has improved beyond the threshold for the configured number of consecutive
/// iterations, and never before [`MIN_CONVERGENCE_ITER`].
struct ConvergenceTracker {
    threshold: f64,
    required_stalls: u32,
    stalls: u32,
    previous_objective: Option<f64>,
    best_reduced_costs: IndexMap<BuildingID, f64>,
}

impl ConvergenceTracker {
    fn new(settings: &DwSettings) -> Self {
        Self {
            threshold: settings.threshold_no_improvement,
            required_stalls: settings.termination_iter,
            stalls: 0,
            previous_objective: None,
            best_reduced_costs: IndexMap::new(),
        }
    }

    /// Record one pricing iteration and report whether convergence is declared.
    ///
    /// Objective improvement is relative to the previous objective; reduced-cost improvements
    /// are measured against the objective's magnitude so the test stays scale free.
    fn observe(
        &mut self,
        iteration: u32,
        objective: f64,
        reduced_costs: &IndexMap<BuildingID, f64>,
    ) -> bool {
        let mut improved = self.previous_objective.is_none_or(|previous| {
            (previous - objective) / previous.abs().max(f64::EPSILON) >= self.threshold
        });
        self.previous_objective = Some(objective);

        let scale = objective.abs().max(1.0);
        for (building, &reduced_cost) in reduced_costs {
            let best = self
                .best_reduced_costs
                .entry(building.clone())
                .or_insert(f64::INFINITY);
            if (*best - reduced_cost) / scale >= self.threshold {
                improved = true;
            }
            *best = (*best).min(reduced_cost);
        }

        if improved {
            self.stalls = 0;
        } else {
            self.stalls += 1;
        }
        iteration >= MIN_CONVERGENCE_ITER && self.stalls >= self.required_stalls
    }
}

/// Coordinates one Dantzig-Wolfe run for a single objective and epsilon set.
pub struct Decomposition<'a> {
    campaign: Campaign<'a>,
    driver: &'a SubproblemDriver<'a>,
    settings: &'a Settings,
    objective: Objective,
    emoo: Vec<(EmooTarget, f64)>,
    hints: IndexMap<BuildingID, (EmooTarget, f64)>,
}

impl<'a> Decomposition<'a> {
    /// Set up a run.
    ///
    /// `emoo` holds district-level caps the master enforces on top of the scenario's own; caps
    /// from the scenario additionally reach every building solve through the driver.
    pub fn new(
        campaign: Campaign<'a>,
        driver: &'a SubproblemDriver<'a>,
        settings: &'a Settings,
        objective: Objective,
        emoo: Vec<(EmooTarget, f64)>,
    ) -> Self {
        Self {
            campaign,
            driver,
            settings,
            objective,
            emoo,
            hints: IndexMap::new(),
        }
    }

    /// Attach per-building epsilon caps applied to every building solve, used by the Pareto
    /// driver to warm-start intermediate points in building-scale mode.
    pub fn with_hints(mut self, hints: IndexMap<BuildingID, (EmooTarget, f64)>) -> Self {
        self.hints = hints;
        self
    }

    /// Run the full loop and return the final master solution with its column pool.
    pub fn run(&self) -> Result<DwOutcome> {
        if self.settings.method.building_scale && self.campaign.options.include_all_solutions {
            warn!("include_all_solutions has no effect in building-scale mode");
        }

        let mut master_emoo: Vec<(EmooTarget, f64)> =
            self.driver.scenario().iter_emoo().collect();
        master_emoo.extend(self.emoo.iter().cloned());
        let master = MasterProblem::new(
            self.campaign,
            self.objective,
            &master_emoo,
            self.driver.fixing(),
        );
        let shared = master.shared_layers();

        // Initiating: one tariff-priced configuration per building. A building with no feasible
        // configuration at all makes the whole run pointless, so failures here are fatal.
        let mut pool = ColumnPool::default();
        let requests: Vec<_> = self
            .campaign
            .buildings
            .keys()
            .map(|building| (building.clone(), self.request_for(building)))
            .collect();
        info!(
            "Initiating {} columns for objective {}",
            requests.len(),
            self.objective
        );
        for (building, outcome) in self.solve_buildings(requests) {
            let (solution, _) = outcome?;
            pool.offer(
                building,
                Column::new(solution, &shared, self.objective, 0.0),
            );
        }

        // Pricing loop; the last allowed iteration is reserved for the binary master
        let mut iterations = 0;
        let mut converged = false;
        let mut tracker = ConvergenceTracker::new(&self.settings.decomposition);
        for iteration in 1..self.settings.effective_max_iter() {
            let relaxed = master.solve(&pool, false)?;
            let duals = relaxed
                .duals
                .as_ref()
                .expect("Relaxed master must price its rows");
            iterations = iteration;
            let admission = RC_TOLERANCE * relaxed.objective.abs().max(1.0);

            let requests: Vec<_> = self
                .campaign
                .buildings
                .keys()
                .map(|building| {
                    let mut request = self.request_for(building);
                    request.duals = Some(duals.for_building(building));
                    (building.clone(), request)
                })
                .collect();

            let mut admitted = 0;
            let mut reduced_costs = IndexMap::new();
            for (building, outcome) in self.solve_buildings(requests) {
                let (solution, status) = match outcome {
                    Ok(result) => result,
                    // An infeasible pricing solve only costs us that building's new column
                    Err(err) if failure_kind(&err) == Some(FailureKind::SubproblemInfeasible) => {
                        warn!("Pricing solve for building {building} failed: {err:#}");
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                if status == SolveStatus::TimedOut {
                    warn!("Pricing solve for building {building} hit the time limit");
                }

                let reduced_cost = solution.solver_objective - duals.for_building(&building).nu;
                reduced_costs.insert(building.clone(), reduced_cost);
                if reduced_cost < -admission
                    && pool.offer(
                        building,
                        Column::new(solution, &shared, self.objective, reduced_cost),
                    )
                {
                    admitted += 1;
                }
            }
            info!(
                "Iteration {iteration}: master objective {:.6}, {admitted} new columns",
                relaxed.objective
            );
            if admitted == 0 {
                converged = true;
                break;
            }
            if tracker.observe(iteration, relaxed.objective, &reduced_costs) {
                info!(
                    "Converged after {iteration} iterations at master objective {:.6}",
                    relaxed.objective
                );
                converged = true;
                break;
            }
        }

        let final_master = self.solve_final(&master, &pool)?;
        Ok(DwOutcome {
            master: final_master,
            pool,
            iterations,
            converged,
        })
    }

    /// Solve the binary master, falling back to weight rounding on the relaxed one when the
    /// integer restriction is infeasible.
    fn solve_final(
        &self,
        master: &MasterProblem<'_>,
        pool: &ColumnPool,
    ) -> Result<MasterSolution> {
        match master.solve(pool, true) {
            Ok(solution) => Ok(solution),
            Err(err) if failure_kind(&err) == Some(FailureKind::MasterInfeasible) => {
                warn!("Binary master is infeasible, rounding the relaxed weights instead");
                master.solve(pool, false)
            }
            Err(err) => Err(err),
        }
    }

    /// One building solve request, with its warm-start hint when one is attached
    fn request_for(&self, building: &BuildingID) -> SolveRequest {
        let mut request = SolveRequest::new(Scope::Building(building.clone()), self.objective);
        if let Some(hint) = self.hints.get(building) {
            request.emoo.push(hint.clone());
        }
        request
    }

    /// Fan the given building solves out, in parallel when enabled.
    fn solve_buildings(
        &self,
        requests: Vec<(BuildingID, SolveRequest)>,
    ) -> Vec<(BuildingID, Result<(ModelSolution, SolveStatus)>)> {
        if !self.campaign.options.parallel_computation || requests.len() < 2 {
            return requests
                .into_iter()
                .map(|(building, request)| {
                    let outcome = self.driver.solve(&request);
                    (building, outcome)
                })
                .collect();
        }

        thread::scope(|scope| {
            let handles: Vec<_> = requests
                .into_iter()
                .map(|(building, request)| {
                    scope.spawn(move || (building, self.driver.solve(&request)))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("Subproblem thread panicked"))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::building::BuildingMap;
    use crate::clustering::ReducedGrid;
    use crate::fixture::{buildings, catalog, grid};
    use crate::infrastructure::{Catalog, LayerID};
    use crate::master::WEIGHT_ONE;
    use crate::model::hub::HubModel;
    use crate::profiles::Profiles;
    use crate::scenario::{ObjectiveSpec, Scenario};
    use crate::settings::MethodOptions;
    use indexmap::IndexMap;
    use rstest::rstest;

    struct Setup {
        buildings: BuildingMap,
        catalog: Catalog,
        grid: ReducedGrid,
        profiles: Profiles,
        options: MethodOptions,
        settings: Settings,
        scenario: Scenario,
    }

    fn setup(buildings: BuildingMap, catalog: Catalog, grid: ReducedGrid) -> Setup {
        let settings = Settings::default();
        let options = settings.method.clone();
        let profiles = Profiles::assemble(&buildings, &catalog, &grid, &options).unwrap();
        Setup {
            buildings,
            catalog,
            grid,
            profiles,
            options,
            settings,
            scenario: Scenario {
                name: "baseline".into(),
                objective: ObjectiveSpec::Single(Objective::Totex),
                emoo: IndexMap::new(),
                specific: Vec::new(),
                exclude_units: Vec::new(),
                enforce_units: Vec::new(),
                n_pareto: 0,
            },
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

    #[rstest]
    fn test_run_selects_one_column_per_building(
        buildings: BuildingMap,
        catalog: Catalog,
        grid: ReducedGrid,
    ) {
        let setup = setup(buildings, catalog, grid);
        let driver = SubproblemDriver::new(campaign(&setup), &HubModel, &setup.scenario).unwrap();
        let run = Decomposition::new(
            campaign(&setup),
            &driver,
            &setup.settings,
            Objective::Totex,
            Vec::new(),
        );

        let outcome = run.run().unwrap();
        assert!(outcome.pool.len() >= 2);
        let selected = outcome.master.selected();
        assert_eq!(selected.len(), 2);
        for (building, index) in &selected {
            assert!(outcome.master.weights[building][*index] >= WEIGHT_ONE);
        }
        // Either the loop settled or it ran the pricing budget out
        assert!(outcome.converged || outcome.iterations == 4);
    }

    #[rstest]
    fn test_building_scale_skips_pricing(
        buildings: BuildingMap,
        catalog: Catalog,
        grid: ReducedGrid,
    ) {
        let mut setup = setup(buildings, catalog, grid);
        setup.settings.method.building_scale = true;
        setup.options.building_scale = true;
        let driver = SubproblemDriver::new(campaign(&setup), &HubModel, &setup.scenario).unwrap();
        let run = Decomposition::new(
            campaign(&setup),
            &driver,
            &setup.settings,
            Objective::Totex,
            Vec::new(),
        );

        let outcome = run.run().unwrap();
        assert_eq!(outcome.iterations, 0);
        // Exactly the initiating column per building
        for (_, columns) in outcome.pool.iter() {
            assert_eq!(columns.len(), 1);
        }
    }

    #[rstest]
    fn test_initiating_infeasibility_is_fatal(
        buildings: BuildingMap,
        catalog: Catalog,
        grid: ReducedGrid,
    ) {
        let mut setup = setup(buildings, catalog, grid);
        setup.scenario.exclude_units = vec!["Boiler".into(), "HeatPump_Air".into()];
        let driver = SubproblemDriver::new(campaign(&setup), &HubModel, &setup.scenario).unwrap();
        let run = Decomposition::new(
            campaign(&setup),
            &driver,
            &setup.settings,
            Objective::Totex,
            Vec::new(),
        );

        let err = run.run().unwrap_err();
        assert_eq!(
            failure_kind(&err),
            Some(FailureKind::SubproblemInfeasible)
        );
    }

    #[rstest]
    fn test_sequential_matches_parallel(
        buildings: BuildingMap,
        catalog: Catalog,
        grid: ReducedGrid,
    ) {
        let setup = setup(buildings, catalog, grid);
        let driver = SubproblemDriver::new(campaign(&setup), &HubModel, &setup.scenario).unwrap();
        let parallel = Decomposition::new(
            campaign(&setup),
            &driver,
            &setup.settings,
            Objective::Totex,
            Vec::new(),
        )
        .run()
        .unwrap();

        let mut sequential_setup = setup;
        sequential_setup.options.parallel_computation = false;
        let driver =
            SubproblemDriver::new(campaign(&sequential_setup), &HubModel, &sequential_setup.scenario)
                .unwrap();
        let sequential = Decomposition::new(
            campaign(&sequential_setup),
            &driver,
            &sequential_setup.settings,
            Objective::Totex,
            Vec::new(),
        )
        .run()
        .unwrap();

        assert_eq!(parallel.pool.len(), sequential.pool.len());
        assert!((parallel.master.objective - sequential.master.objective).abs() < 1e-6);
    }

    fn priced(reduced_cost: f64) -> IndexMap<BuildingID, f64> {
        IndexMap::from([("b1".into(), reduced_cost)])
    }

    #[test]
    fn test_convergence_requires_reduced_cost_stall() {
        let settings = DwSettings {
            max_iter: 10,
            threshold_no_improvement: 0.1,
            termination_iter: 2,
        };
        let mut tracker = ConvergenceTracker::new(&settings);

        // A flat master objective alone is not convergence while pricing keeps improving
        assert!(!tracker.observe(3, 100.0, &priced(-50.0)));
        assert!(!tracker.observe(4, 100.0, &priced(-80.0)));
        assert!(!tracker.observe(5, 100.0, &priced(-110.0)));
        // Two quiet iterations on both counts close the loop
        assert!(!tracker.observe(6, 100.0, &priced(-110.0)));
        assert!(tracker.observe(7, 100.0, &priced(-110.0)));
    }

    #[test]
    fn test_convergence_improvement_is_relative() {
        let settings = DwSettings {
            max_iter: 10,
            threshold_no_improvement: 0.1,
            termination_iter: 1,
        };
        let mut tracker = ConvergenceTracker::new(&settings);

        assert!(!tracker.observe(3, 1e6, &priced(-5.0)));
        // An absolute reduced-cost gain of one is noise at this objective scale
        assert!(tracker.observe(4, 1e6, &priced(-6.0)));
    }

    /// A column with a constant net import on one shared layer and no other structure
    fn flow_column(layer: &LayerID, flow: f64) -> Column {
        Column {
            solution: ModelSolution {
                sizing: IndexMap::new(),
                unit_flows: IndexMap::new(),
                soc: IndexMap::new(),
                imports: IndexMap::new(),
                exports: IndexMap::new(),
                objectives: Default::default(),
                solver_objective: 0.0,
                timed_out: false,
            },
            flows: IndexMap::from([(layer.clone(), vec![flow; 10])]),
            cost: 0.0,
            reduced_cost: 0.0,
        }
    }

    #[rstest]
    fn test_binary_infeasibility_rounds_relaxed_weights(
        buildings: BuildingMap,
        catalog: Catalog,
        grid: ReducedGrid,
    ) {
        let mut setup = setup(buildings, catalog, grid);
        // A tight electricity connection: at most 5 kW in or out per step
        let electricity: LayerID = "Electricity".into();
        {
            let layer = setup.catalog.layers.get_mut(&electricity).unwrap();
            layer.network_capacity = 5.0;
            layer.reinforcement_capacity = 0.0;
        }
        setup.scenario.exclude_units = vec!["DistrictBattery".into()];
        let driver = SubproblemDriver::new(campaign(&setup), &HubModel, &setup.scenario).unwrap();
        let run = Decomposition::new(
            campaign(&setup),
            &driver,
            &setup.settings,
            Objective::Totex,
            Vec::new(),
        );
        let master =
            MasterProblem::new(campaign(&setup), Objective::Totex, &[], driver.fixing());

        // b1 always imports 10; b2 imports 10 or exports 30. No whole column pair fits through
        // the connection, but a convex mix of b2's columns does.
        let mut pool = ColumnPool::default();
        pool.offer("b1".into(), flow_column(&electricity, 10.0));
        pool.offer("b2".into(), flow_column(&electricity, 10.0));
        pool.offer("b2".into(), flow_column(&electricity, -30.0));
        assert_eq!(
            failure_kind(&master.solve(&pool, true).unwrap_err()),
            Some(FailureKind::MasterInfeasible)
        );

        let solution = run.solve_final(&master, &pool).unwrap();
        // The fallback is the relaxed master, with the largest weight selecting the design
        assert!(solution.duals.is_some());
        let b2: BuildingID = "b2".into();
        let weights = &solution.weights[&b2];
        assert!(weights.iter().all(|&weight| weight < WEIGHT_ONE));
        assert_eq!(solution.selected()[&b2], 1);
    }
}
