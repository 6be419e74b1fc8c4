//! The Pareto driver: trade-off fronts between two scalar objectives.
//!
//! The front is built the epsilon-constraint way: optimize each objective alone to find the
//! anchors, then cap one objective at values between its bounds while the other is minimized.
use crate::building::BuildingID;
use crate::decomposition::{Decomposition, DwOutcome};
use crate::error::{FailureKind, failure_kind};
use crate::model::ObjectiveValues;
use crate::scenario::{EmooTarget, Objective};
use crate::settings::Settings;
use crate::subproblem::{Campaign, SubproblemDriver};
use anyhow::Result;
use indexmap::IndexMap;
use log::{info, warn};

/// One point of the front
#[derive(Debug)]
pub struct ParetoPoint {
    /// Position on the sorted front, starting at 1
    pub id: u32,
    /// The objective minimized at this point
    pub objective: Objective,
    /// The epsilon cap applied, absent for the two anchors
    pub epsilon: Option<(Objective, f64)>,
    /// The run outcome; absent when the point turned out unreachable
    pub outcome: Option<DwOutcome>,
}

impl ParetoPoint {
    /// District objective breakdown, when the point was reached
    pub fn objectives(&self) -> Option<ObjectiveValues> {
        self.outcome.as_ref().map(DwOutcome::total_objectives)
    }
}

/// Drives one front for a pair of objectives.
pub struct ParetoDriver<'a> {
    campaign: Campaign<'a>,
    driver: &'a SubproblemDriver<'a>,
    settings: &'a Settings,
}

impl<'a> ParetoDriver<'a> {
    /// Set up a driver over the given campaign.
    pub fn new(
        campaign: Campaign<'a>,
        driver: &'a SubproblemDriver<'a>,
        settings: &'a Settings,
    ) -> Self {
        Self {
            campaign,
            driver,
            settings,
        }
    }

    /// Build the front: both anchors plus `n_pareto` capped points per swept objective.
    ///
    /// An unreachable intermediate point is kept on the front without an outcome; the sweep
    /// continues past it.
    pub fn run(
        &self,
        first: Objective,
        second: Objective,
        n_pareto: u32,
    ) -> Result<Vec<ParetoPoint>> {
        info!("Anchor solve for {first}");
        let anchor_first = self.solve_point(first, None)?;
        info!("Anchor solve for {second}");
        let anchor_second = self.solve_point(second, None)?;

        let first_bounds = (
            anchor_first.total_objectives().value(first),
            anchor_second.total_objectives().value(first),
        );
        let second_bounds = (
            anchor_second.total_objectives().value(second),
            anchor_first.total_objectives().value(second),
        );

        let mut points = vec![
            ParetoPoint {
                id: 0,
                objective: first,
                epsilon: None,
                outcome: Some(anchor_first),
            },
            ParetoPoint {
                id: 0,
                objective: second,
                epsilon: None,
                outcome: Some(anchor_second),
            },
        ];

        // Cap the first objective between its bounds while the second is minimized
        for epsilon in intermediate_values(first_bounds.0, first_bounds.1, n_pareto) {
            points.push(self.capped_point(second, first, epsilon)?);
        }
        // The symmetric sweep, unless switched off
        if !self.settings.method.switch_off_second_objective {
            for epsilon in intermediate_values(second_bounds.0, second_bounds.1, n_pareto) {
                points.push(self.capped_point(first, second, epsilon)?);
            }
        }

        // Sort along the front and hand out positions; unreachable points close the list
        points.sort_by(|a, b| {
            let key = |point: &ParetoPoint| {
                point
                    .objectives()
                    .map_or(f64::INFINITY, |values| values.value(first))
            };
            key(a).total_cmp(&key(b))
        });
        for (index, point) in points.iter_mut().enumerate() {
            point.id = index as u32 + 1;
        }
        Ok(points)
    }

    /// One capped run; infeasibility marks the point unreachable instead of failing the front.
    fn capped_point(
        &self,
        objective: Objective,
        capped: Objective,
        epsilon: f64,
    ) -> Result<ParetoPoint> {
        info!("Pareto point: min {objective} subject to {capped} <= {epsilon:.4}");
        let outcome = match self.solve_point(objective, Some((capped, epsilon))) {
            Ok(outcome) => Some(outcome),
            Err(err)
                if matches!(
                    failure_kind(&err),
                    Some(
                        FailureKind::SubproblemInfeasible
                            | FailureKind::MasterInfeasible
                            | FailureKind::Infeasible
                    )
                ) =>
            {
                warn!("Pareto point {capped} <= {epsilon:.4} is unreachable: {err:#}");
                None
            }
            Err(err) => return Err(err),
        };
        Ok(ParetoPoint {
            id: 0,
            objective,
            epsilon: Some((capped, epsilon)),
            outcome,
        })
    }

    /// One full decomposition run for an objective with an optional district-level cap.
    fn solve_point(
        &self,
        objective: Objective,
        epsilon: Option<(Objective, f64)>,
    ) -> Result<DwOutcome> {
        let emoo: Vec<(EmooTarget, f64)> = epsilon
            .iter()
            .map(|(capped, cap)| (EmooTarget::Objective(*capped), *cap))
            .collect();
        let mut run = Decomposition::new(
            self.campaign,
            self.driver,
            self.settings,
            objective,
            emoo,
        );
        if self.settings.method.building_scale
            && let Some((capped, cap)) = epsilon
        {
            run = run.with_hints(self.building_hints(capped, cap)?);
        }
        run.run()
    }

    /// Per-building caps for building-scale intermediate runs: the district cap split in
    /// proportion to each building's share of the capped objective at its own anchor.
    fn building_hints(
        &self,
        capped: Objective,
        cap: f64,
    ) -> Result<IndexMap<BuildingID, (EmooTarget, f64)>> {
        let anchor = self.solve_point(capped, None)?;
        let per_building: IndexMap<BuildingID, f64> = anchor
            .selected_solutions()
            .into_iter()
            .map(|(building, solution)| (building, solution.objectives.value(capped)))
            .collect();
        let total: f64 = per_building.values().sum();
        if total <= 0.0 {
            return Ok(IndexMap::new());
        }
        Ok(per_building
            .into_iter()
            .map(|(building, value)| {
                let share = value / total;
                (building, (EmooTarget::Objective(capped), cap * share))
            })
            .collect())
    }
}

/// `n` values linearly spaced strictly between `low` and `high`
fn intermediate_values(low: f64, high: f64, n: u32) -> Vec<f64> {
    let (low, high) = (low.min(high), low.max(high));
    (1..=n)
        .map(|i| low + f64::from(i) * (high - low) / f64::from(n + 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::building::BuildingMap;
    use crate::clustering::ReducedGrid;
    use crate::fixture::{buildings, catalog, grid};
    use crate::infrastructure::Catalog;
    use crate::model::hub::HubModel;
    use crate::profiles::Profiles;
    use crate::scenario::{ObjectiveSpec, Scenario};
    use crate::settings::MethodOptions;
    use float_cmp::assert_approx_eq;
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
        let mut settings = Settings::default();
        // One pricing round keeps the front cheap to compute
        settings.decomposition.max_iter = 2;
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
                name: "pareto".into(),
                objective: ObjectiveSpec::Pair(Objective::Opex, Objective::Capex),
                emoo: IndexMap::new(),
                specific: Vec::new(),
                exclude_units: Vec::new(),
                enforce_units: Vec::new(),
                n_pareto: 1,
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

    #[test]
    fn test_intermediate_values() {
        let values = intermediate_values(0.0, 4.0, 3);
        assert_eq!(values.len(), 3);
        assert_approx_eq!(f64, values[0], 1.0);
        assert_approx_eq!(f64, values[2], 3.0);
        // Reversed bounds span the same interval
        assert_eq!(intermediate_values(4.0, 0.0, 3), values);
        assert!(intermediate_values(0.0, 4.0, 0).is_empty());
    }

    #[rstest]
    fn test_front_is_sorted_with_anchors(
        buildings: BuildingMap,
        catalog: Catalog,
        grid: ReducedGrid,
    ) {
        let mut setup = setup(buildings, catalog, grid);
        setup.settings.method.switch_off_second_objective = true;
        setup.options.switch_off_second_objective = true;
        let driver = SubproblemDriver::new(campaign(&setup), &HubModel, &setup.scenario).unwrap();
        let pareto = ParetoDriver::new(campaign(&setup), &driver, &setup.settings);

        let points = pareto.run(Objective::Opex, Objective::Capex, 1).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(
            points.iter().map(|point| point.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        // Ascending in the first objective along the front
        let opex: Vec<f64> = points
            .iter()
            .map(|point| point.objectives().unwrap().opex)
            .collect();
        assert!(opex[0] <= opex[1] + 1e-6 && opex[1] <= opex[2] + 1e-6);

        // The OPEX anchor sits first, the CAPEX anchor last
        assert_eq!(points[0].objective, Objective::Opex);
        assert!(points[0].epsilon.is_none());
        assert_eq!(points[2].objective, Objective::Capex);
        assert!(points[2].epsilon.is_none());

        // The capped point honors its cap
        let (capped, cap) = points[1].epsilon.unwrap();
        assert_eq!(capped, Objective::Opex);
        assert!(points[1].objectives().unwrap().value(capped) <= cap + 1e-6);
    }

    #[rstest]
    fn test_symmetric_sweep_doubles_intermediates(
        buildings: BuildingMap,
        catalog: Catalog,
        grid: ReducedGrid,
    ) {
        let setup = setup(buildings, catalog, grid);
        let driver = SubproblemDriver::new(campaign(&setup), &HubModel, &setup.scenario).unwrap();
        let pareto = ParetoDriver::new(campaign(&setup), &driver, &setup.settings);

        let points = pareto.run(Objective::Opex, Objective::Capex, 1).unwrap();
        assert_eq!(points.len(), 4);
        let capped_on_second = points
            .iter()
            .filter(|point| matches!(point.epsilon, Some((Objective::Capex, _))))
            .count();
        assert_eq!(capped_on_second, 1);
    }
}
