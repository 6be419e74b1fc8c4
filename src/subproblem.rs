//! The innermost solve: assemble inputs for one scope, invoke the model bundle, classify the
//! outcome.
//!
//! The decomposition loop calls this once per building per iteration; the monolithic and
//! building-scale modes call it directly.
use crate::building::BuildingMap;
use crate::clustering::ReducedGrid;
use crate::error::{FailureKind, failure_kind, kind};
use crate::infrastructure::{Catalog, UnitFixing, UnitID};
use crate::model::{BoundaryPricing, DualPrices, ModelBundle, ModelInputs, ModelSolution, Scope};
use crate::profiles::Profiles;
use crate::scenario::{EmooTarget, Objective, Scenario};
use crate::settings::MethodOptions;
use anyhow::{Context, Result, anyhow};
use indexmap::IndexMap;
use log::warn;

/// The shared read-only inputs of one optimization campaign.
///
/// Built once; the decomposition loop shares it across subproblem tasks.
#[derive(Clone, Copy)]
pub struct Campaign<'a> {
    /// The building catalog
    pub buildings: &'a BuildingMap,
    /// The infrastructure catalog
    pub catalog: &'a Catalog,
    /// The reduced time grid
    pub grid: &'a ReducedGrid,
    /// Demand and environmental series on the grid
    pub profiles: &'a Profiles,
    /// Method options
    pub options: &'a MethodOptions,
}

/// How one solve finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// The solver proved optimality
    Optimal,
    /// The solver hit its time limit; the result is the best feasible point found
    TimedOut,
}

/// One fully specified solve request
#[derive(Debug, Clone)]
pub struct SolveRequest {
    /// What the solve covers
    pub scope: Scope,
    /// The objective to minimize
    pub objective: Objective,
    /// Epsilon caps, on top of the scenario's own
    pub emoo: Vec<(EmooTarget, f64)>,
    /// Master duals for column-generation pricing solves
    pub duals: Option<DualPrices>,
    /// Relax the install binaries
    pub relaxed: bool,
}

impl SolveRequest {
    /// A plain tariff-priced MILP solve for the given scope and objective
    pub fn new(scope: Scope, objective: Objective) -> Self {
        Self {
            scope,
            objective,
            emoo: Vec::new(),
            duals: None,
            relaxed: false,
        }
    }
}

/// Drives model-bundle solves for one scenario.
pub struct SubproblemDriver<'a> {
    campaign: Campaign<'a>,
    bundle: &'a dyn ModelBundle,
    scenario: &'a Scenario,
    fixing: IndexMap<UnitID, UnitFixing>,
}

impl std::fmt::Debug for SubproblemDriver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubproblemDriver").finish_non_exhaustive()
    }
}

impl<'a> SubproblemDriver<'a> {
    /// Validate the scenario against the catalog and set up a driver.
    pub fn new(
        campaign: Campaign<'a>,
        bundle: &'a dyn ModelBundle,
        scenario: &'a Scenario,
    ) -> Result<Self> {
        scenario.validate()?;
        let fixing = campaign
            .catalog
            .resolve_fixing(&scenario.enforce_units, &scenario.exclude_units)
            .with_context(|| format!("Invalid fixing lists in scenario {}", scenario.name))?;
        Ok(Self {
            campaign,
            bundle,
            scenario,
            fixing,
        })
    }

    /// The resolved unit fixing of the scenario
    pub fn fixing(&self) -> &IndexMap<UnitID, UnitFixing> {
        &self.fixing
    }

    /// The validated scenario this driver serves
    pub fn scenario(&self) -> &Scenario {
        self.scenario
    }

    /// Assemble and run one solve.
    ///
    /// Scenario epsilon caps always apply; the request adds its own on top. An infeasible or
    /// timed-out-without-a-point solve surfaces as [`FailureKind::SubproblemInfeasible`].
    pub fn solve(&self, request: &SolveRequest) -> Result<(ModelSolution, SolveStatus)> {
        let mut emoo: Vec<(EmooTarget, f64)> = self.scenario.iter_emoo().collect();
        emoo.extend(request.emoo.iter().cloned());

        let pricing = match &request.duals {
            Some(duals) => BoundaryPricing::Duals(duals.clone()),
            None => BoundaryPricing::Tariff,
        };
        let inputs = ModelInputs {
            scope: request.scope.clone(),
            buildings: self.campaign.buildings,
            catalog: self.campaign.catalog,
            grid: self.campaign.grid,
            profiles: self.campaign.profiles,
            objective: request.objective,
            emoo: &emoo,
            specific: &self.scenario.specific,
            fixing: &self.fixing,
            pricing,
            options: self.campaign.options,
            relaxed: request.relaxed,
        };

        match self.bundle.solve(&inputs) {
            Ok(solution) if solution.timed_out => {
                warn!(
                    "Solver timed out for {:?}; keeping the best feasible point",
                    request.scope
                );
                Ok((solution, SolveStatus::TimedOut))
            }
            Ok(solution) => Ok((solution, SolveStatus::Optimal)),
            Err(error) => Err(self.classify(error, &request.scope)),
        }
    }

    /// Map bundle failures to the subproblem error vocabulary.
    fn classify(&self, error: anyhow::Error, scope: &Scope) -> anyhow::Error {
        match failure_kind(&error) {
            Some(FailureKind::Infeasible | FailureKind::SolverTimeout) => {
                anyhow!("Subproblem for {scope:?} in scenario {} has no feasible point", self.scenario.name)
                    .context(kind(FailureKind::SubproblemInfeasible))
            }
            _ => error,
        }
    }
}
