//! Fusing master and subproblem outputs into the canonical result tables.
//!
//! One [`ResultBundle`] holds every table for one scenario and Pareto point. Aggregation picks
//! the building columns the final master selected, overlays the district-unit dispatch, and
//! checks that building-level and network-level flows agree before anything is reported.
use crate::building::BuildingID;
use crate::decomposition::DwOutcome;
use crate::infrastructure::{LayerID, UnitID};
use crate::kpi::{self, KpiRow, annualize, step_weights};
use crate::model::ModelSolution;
use crate::subproblem::Campaign;
use anyhow::{Result, ensure};
use serde::Serialize;

/// Largest tolerated mismatch between building-level and network-level flows, in kW
pub const CONSERVATION_TOLERANCE: f64 = 1e-6;

/// The hub label of network-level rows
pub const NETWORK_HUB: &str = "Network";

/// Cost and emission breakdown of one hub
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceRow {
    /// Building identifier, or [`NETWORK_HUB`] for the district total
    pub hub: String,
    /// Annual operating expenditure
    pub costs_op: f64,
    /// Annualized investment expenditure
    pub costs_inv: f64,
    /// Total expenditure
    pub totex: f64,
    /// Construction emissions
    pub gwp_constr: f64,
    /// Operational emissions
    pub gwp_op: f64,
}

/// Annual exchange of one hub on one layer, in MWh/y
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnualRow {
    /// The layer
    pub layer: LayerID,
    /// The hub
    pub hub: String,
    /// Annual supply drawn from the network
    pub supply_mwh: f64,
    /// Annual feed-in to the network
    pub demand_mwh: f64,
}

/// Sizing of one unit instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitRow {
    /// The unit instance
    pub unit: UnitID,
    /// The hub the unit belongs to
    pub hub: String,
    /// Whether the unit is installed
    pub installed: bool,
    /// Installed capacity
    pub mult: f64,
    /// Technical lifetime in years
    pub lifetime: f64,
}

/// Network exchange of one hub on one layer at one timestep
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridRow {
    /// The layer
    pub layer: LayerID,
    /// The hub
    pub hub: String,
    /// Typical period, 1-based
    pub period: usize,
    /// Timestep within the period, 1-based
    pub time: usize,
    /// Supply drawn from the network, in kW
    pub supply: f64,
    /// Feed-in to the network, in kW
    pub demand: f64,
    /// Supply tariff
    pub cost_supply: f64,
    /// Feed-in tariff
    pub cost_demand: f64,
    /// Emission factor of supply at this timestep
    pub gwp_supply: f64,
}

/// Flow of one unit on one layer at one timestep
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFlowRow {
    /// The unit instance
    pub unit: UnitID,
    /// The layer
    pub layer: LayerID,
    /// Typical period, 1-based
    pub period: usize,
    /// Timestep within the period, 1-based
    pub time: usize,
    /// Signed flow: positive production, negative consumption, in kW
    pub flow: f64,
}

/// One typical period of the reduced grid
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeRow {
    /// Typical period, 1-based
    pub period: usize,
    /// Days per year the period stands for
    pub frequency: f64,
    /// Number of timesteps in the period
    pub time_end: usize,
}

/// Descriptive row of one building
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildingRow {
    /// The building
    pub building: BuildingID,
    /// Energy reference area in m2
    pub era: f64,
    /// Annual space-heating demand in kWh/y
    pub heating_kwh: f64,
    /// Annual hot-water demand in kWh/y
    pub dhw_kwh: f64,
    /// Annual electricity demand in kWh/y
    pub electricity_kwh: f64,
}

/// Demand of one building on one layer at one timestep
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildingFlowRow {
    /// The building
    pub building: BuildingID,
    /// The layer
    pub layer: LayerID,
    /// Typical period, 1-based
    pub period: usize,
    /// Timestep within the period, 1-based
    pub time: usize,
    /// End-use demand in kW
    pub demand: f64,
}

/// Every canonical table for one scenario and Pareto point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultBundle {
    /// The scenario label
    pub scenario: String,
    /// Position on the Pareto front, 1 for single-objective runs
    pub pareto_id: u32,
    /// Cost/emission breakdown per hub
    #[serde(rename = "Performance")]
    pub performance: Vec<PerformanceRow>,
    /// Annual per-layer exchange per hub
    #[serde(rename = "Annuals")]
    pub annuals: Vec<AnnualRow>,
    /// Sizing per unit instance
    #[serde(rename = "Unit")]
    pub units: Vec<UnitRow>,
    /// Per-timestep network exchange
    #[serde(rename = "Grid_t")]
    pub grid_t: Vec<GridRow>,
    /// Per-timestep unit flows
    #[serde(rename = "Unit_t")]
    pub unit_t: Vec<UnitFlowRow>,
    /// The reduced time grid
    #[serde(rename = "Time")]
    pub time: Vec<TimeRow>,
    /// Building descriptions
    #[serde(rename = "Buildings")]
    pub buildings: Vec<BuildingRow>,
    /// Per-timestep building demands
    #[serde(rename = "Buildings_t")]
    pub buildings_t: Vec<BuildingFlowRow>,
    /// Summary indicators
    #[serde(rename = "KPI")]
    pub kpis: Vec<KpiRow>,
}

/// Fuse one finished outcome into its result bundle.
///
/// Fails when building-level and network-level flows disagree beyond
/// [`CONSERVATION_TOLERANCE`] on any shared layer.
pub fn aggregate(
    campaign: &Campaign,
    outcome: &DwOutcome,
    scenario: &str,
    pareto_id: u32,
) -> Result<ResultBundle> {
    let selected = outcome.selected_solutions();
    check_conservation(campaign, outcome, &selected)?;

    let weights = step_weights(campaign);
    let steps: Vec<(usize, usize)> = campaign.grid.iter_timesteps().collect();
    let district = &outcome.master.district;

    // Performance
    let mut performance: Vec<PerformanceRow> = selected
        .iter()
        .map(|(building, solution)| performance_row(building.to_string(), solution.objectives))
        .collect();
    performance.push(performance_row(
        NETWORK_HUB.to_string(),
        outcome.total_objectives(),
    ));

    // Annuals and Grid_t, buildings first and the network meter last
    let mut annuals = Vec::new();
    let mut grid_t = Vec::new();
    for layer in campaign.catalog.layers.values() {
        for (hub, solution) in selected
            .iter()
            .map(|(building, solution)| (building.to_string(), *solution))
            .chain(std::iter::once((NETWORK_HUB.to_string(), district)))
        {
            let imports = solution.imports.get(&layer.id);
            let exports = solution.exports.get(&layer.id);
            if imports.is_none() && exports.is_none() {
                continue;
            }
            annuals.push(AnnualRow {
                layer: layer.id.clone(),
                hub: hub.clone(),
                supply_mwh: imports.map_or(0.0, |series| annualize(series, &weights)) / 1000.0,
                demand_mwh: exports.map_or(0.0, |series| annualize(series, &weights)) / 1000.0,
            });
            for (step, &(p, t)) in steps.iter().enumerate() {
                grid_t.push(GridRow {
                    layer: layer.id.clone(),
                    hub: hub.clone(),
                    period: p + 1,
                    time: t + 1,
                    supply: imports.map_or(0.0, |series| series[step]),
                    demand: exports.map_or(0.0, |series| series[step]),
                    cost_supply: campaign.profiles.supply_tariff(&layer.id, step),
                    cost_demand: campaign.profiles.feedin_tariff(&layer.id, step),
                    gwp_supply: campaign.profiles.emission_factors[&layer.id][step],
                });
            }
        }
    }

    // Unit and Unit_t
    let mut units = Vec::new();
    let mut unit_t = Vec::new();
    for (hub, solution) in selected
        .iter()
        .map(|(building, solution)| (building.to_string(), *solution))
        .chain(std::iter::once((NETWORK_HUB.to_string(), district)))
    {
        for (unit, sizing) in &solution.sizing {
            units.push(UnitRow {
                unit: unit.clone(),
                hub: hub.clone(),
                installed: sizing.installed,
                mult: sizing.mult,
                lifetime: campaign.catalog.units[unit].parameters.lifetime,
            });
        }
        for ((unit, layer), series) in &solution.unit_flows {
            for (step, &(p, t)) in steps.iter().enumerate() {
                unit_t.push(UnitFlowRow {
                    unit: unit.clone(),
                    layer: layer.clone(),
                    period: p + 1,
                    time: t + 1,
                    flow: series[step],
                });
            }
        }
    }

    let time = campaign
        .grid
        .periods
        .iter()
        .enumerate()
        .map(|(p, period)| TimeRow {
            period: p + 1,
            frequency: period.frequency,
            time_end: period.time_end,
        })
        .collect();

    let buildings = campaign
        .buildings
        .values()
        .map(|building| BuildingRow {
            building: building.id.clone(),
            era: building.era,
            heating_kwh: building.annual_demands.heating,
            dhw_kwh: building.annual_demands.dhw,
            electricity_kwh: building.annual_demands.electricity,
        })
        .collect();

    let buildings_t = campaign
        .profiles
        .demands
        .iter()
        .flat_map(|((building, layer), series)| {
            steps.iter().enumerate().map(move |(step, &(p, t))| {
                BuildingFlowRow {
                    building: building.clone(),
                    layer: layer.clone(),
                    period: p + 1,
                    time: t + 1,
                    demand: series[step],
                }
            })
        })
        .collect();

    let kpis = kpi::compute(campaign, outcome);

    Ok(ResultBundle {
        scenario: scenario.to_string(),
        pareto_id,
        performance,
        annuals,
        units,
        grid_t,
        unit_t,
        time,
        buildings,
        buildings_t,
        kpis,
    })
}

fn performance_row(hub: String, objectives: crate::model::ObjectiveValues) -> PerformanceRow {
    PerformanceRow {
        hub,
        costs_op: objectives.opex,
        costs_inv: objectives.capex,
        totex: objectives.totex(),
        gwp_constr: objectives.gwp_construction,
        gwp_op: objectives.gwp_operation,
    }
}

/// Building draws plus district dispatch must meet the network meter at every (layer, timestep).
fn check_conservation(
    campaign: &Campaign,
    outcome: &DwOutcome,
    selected: &indexmap::IndexMap<BuildingID, &ModelSolution>,
) -> Result<()> {
    let district = &outcome.master.district;
    let n_steps: usize = campaign
        .grid
        .periods
        .iter()
        .map(|period| period.time_end)
        .sum();
    for layer in campaign.catalog.layers.values() {
        if !layer.supply_allowed && !layer.demand_allowed {
            continue;
        }
        for step in 0..n_steps {
            let buildings: f64 = selected
                .values()
                .map(|solution| solution.boundary_flow(&layer.id, step))
                .sum();
            let district_net: f64 = district
                .unit_flows
                .iter()
                .filter(|((_, flow_layer), _)| *flow_layer == layer.id)
                .map(|(_, series)| series[step])
                .sum();
            let residual =
                buildings - district_net - district.boundary_flow(&layer.id, step);
            ensure!(
                residual.abs() <= CONSERVATION_TOLERANCE,
                "Conservation violated on layer {} at step {step}: residual {residual:.3e}",
                layer.id
            );
        }
    }
    Ok(())
}
