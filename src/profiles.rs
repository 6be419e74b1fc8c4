//! Materializing demand and environmental time series onto the clustered grid.
//!
//! Everything here is a pure function of the building catalog, the infrastructure catalog and the
//! reduced time grid; the resulting parameter bundle is what the model bundle consumes.
use crate::building::{Building, BuildingID, BuildingMap};
use crate::clustering::ReducedGrid;
use crate::infrastructure::{Catalog, HeatSource, Layer, LayerID, StreamID, UnitID};
use crate::settings::MethodOptions;
use crate::weather::Attribute;
use anyhow::{Context, Result, ensure};
use indexmap::IndexMap;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

/// Mean of the district-heating-network supply and return temperatures, used as the DHN heat-pump
/// source temperature
pub const DHN_MEAN_TEMPERATURE: f64 = 16.0;

/// Lake-source heat-pump source temperature
pub const LAKE_SOURCE_TEMPERATURE: f64 = 7.5;

/// Geothermal heat-pump source temperature
pub const GEOTHERMAL_SOURCE_TEMPERATURE: f64 = 8.0;

/// Window fraction of the facade area when class data is missing
pub const DEFAULT_WINDOW_FRACTION: f64 = 0.25;

/// RNG seed for the stochastic profile perturbation, fixed so reruns are identical
const STOCHASTICITY_SEED: u64 = 42;

/// Normalized weekday daily shape for space heating (fraction of daily demand per hour)
const HEAT_SHAPE_WEEKDAY: [f64; 24] = [
    0.030, 0.028, 0.027, 0.027, 0.030, 0.042, 0.056, 0.060, 0.052, 0.045, 0.040, 0.038, 0.037,
    0.037, 0.038, 0.040, 0.045, 0.052, 0.056, 0.054, 0.050, 0.044, 0.038, 0.034,
];
/// Normalized weekend daily shape for space heating
const HEAT_SHAPE_WEEKEND: [f64; 24] = [
    0.032, 0.030, 0.029, 0.029, 0.031, 0.036, 0.044, 0.052, 0.054, 0.050, 0.045, 0.042, 0.041,
    0.041, 0.042, 0.044, 0.047, 0.050, 0.052, 0.050, 0.047, 0.042, 0.037, 0.033,
];
/// Normalized weekday daily shape for domestic hot water
const DHW_SHAPE_WEEKDAY: [f64; 24] = [
    0.010, 0.005, 0.005, 0.005, 0.010, 0.040, 0.080, 0.090, 0.060, 0.040, 0.035, 0.040, 0.045,
    0.040, 0.035, 0.035, 0.040, 0.055, 0.075, 0.090, 0.080, 0.050, 0.025, 0.010,
];
/// Normalized weekend daily shape for domestic hot water
const DHW_SHAPE_WEEKEND: [f64; 24] = [
    0.010, 0.005, 0.005, 0.005, 0.008, 0.020, 0.050, 0.080, 0.090, 0.070, 0.050, 0.045, 0.050,
    0.045, 0.040, 0.040, 0.045, 0.055, 0.070, 0.080, 0.070, 0.040, 0.017, 0.010,
];
/// Normalized weekday daily shape for electricity
const ELEC_SHAPE_WEEKDAY: [f64; 24] = [
    0.025, 0.022, 0.021, 0.021, 0.023, 0.032, 0.045, 0.052, 0.048, 0.044, 0.043, 0.045, 0.047,
    0.044, 0.042, 0.043, 0.048, 0.058, 0.068, 0.070, 0.062, 0.052, 0.040, 0.030,
];
/// Normalized weekend daily shape for electricity
const ELEC_SHAPE_WEEKEND: [f64; 24] = [
    0.028, 0.024, 0.022, 0.022, 0.024, 0.028, 0.036, 0.046, 0.052, 0.052, 0.050, 0.050, 0.050,
    0.048, 0.045, 0.045, 0.048, 0.055, 0.062, 0.064, 0.058, 0.050, 0.042, 0.033,
];

/// The end uses with their carrier layer names
const END_USES: [(&str, EndUse); 3] = [
    ("Heat", EndUse::Heating),
    ("DHW", EndUse::Dhw),
    ("Electricity", EndUse::Electricity),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndUse {
    Heating,
    Dhw,
    Electricity,
}

/// All per-building and environmental series on the reduced grid.
///
/// Vectors are indexed by the concatenated timestep index of [`ReducedGrid`].
#[derive(Debug, Clone, PartialEq)]
pub struct Profiles {
    /// Demand per building and end-use layer, in kW
    pub demands: IndexMap<(BuildingID, LayerID), Vec<f64>>,
    /// Heat-pump source temperature per unit instance, in degrees C
    pub hp_source_temperatures: IndexMap<UnitID, Vec<f64>>,
    /// Inlet/outlet temperatures per stream
    pub stream_temperatures: IndexMap<StreamID, Vec<(f64, f64)>>,
    /// Emission factor per layer, in kgCO2/kWh
    pub emission_factors: IndexMap<LayerID, Vec<f64>>,
    /// Import price per layer, in CHF/kWh
    pub supply_tariffs: IndexMap<LayerID, Vec<f64>>,
    /// Feed-in remuneration per layer, in CHF/kWh
    pub feedin_tariffs: IndexMap<LayerID, Vec<f64>>,
    /// Solar gain per building, in kW
    pub solar_gains: IndexMap<BuildingID, Vec<f64>>,
}

impl Profiles {
    /// Assemble all series for the given buildings and catalog on the reduced grid.
    pub fn assemble(
        buildings: &BuildingMap,
        catalog: &Catalog,
        grid: &ReducedGrid,
        options: &MethodOptions,
    ) -> Result<Self> {
        let n_steps: usize = grid.periods.iter().map(|period| period.time_end).sum();
        ensure!(n_steps > 0, "Reduced grid has no timesteps");

        let mut rng = StdRng::seed_from_u64(STOCHASTICITY_SEED);

        let mut demands = IndexMap::new();
        for building in buildings.values() {
            for (layer_name, end_use) in END_USES {
                let layer_id: LayerID = layer_name.into();
                if !catalog.layers.contains_key(&layer_id) && end_use != EndUse::Heating {
                    continue;
                }
                let profile = demand_profile(building, end_use, grid, options, &mut rng)
                    .with_context(|| {
                        format!("Failed to build {layer_name} demand for {}", building.id)
                    })?;
                demands.insert((building.id.clone(), layer_id), profile);
            }
        }

        let hp_source_temperatures = hp_source_temperatures(catalog, grid);
        let stream_temperatures = stream_temperatures(catalog, n_steps);
        let emission_factors = emission_factors(catalog, grid, options);
        let supply_tariffs = tariffs(catalog, n_steps, |layer| layer.cost_supply);
        let feedin_tariffs = tariffs(catalog, n_steps, |layer| layer.cost_demand);
        let solar_gains = solar_gains(buildings, grid, options);

        Ok(Self {
            demands,
            hp_source_temperatures,
            stream_temperatures,
            emission_factors,
            supply_tariffs,
            feedin_tariffs,
            solar_gains,
        })
    }

    /// Demand in kW of one building on one layer at a concatenated timestep, zero when absent
    pub fn demand(&self, building: &BuildingID, layer: &LayerID, step: usize) -> f64 {
        self.demands
            .get(&(building.clone(), layer.clone()))
            .map_or(0.0, |profile| profile[step])
    }

    /// Import price of one layer at a concatenated timestep, in CHF/kWh
    pub fn supply_tariff(&self, layer: &LayerID, step: usize) -> f64 {
        self.supply_tariffs[layer][step]
    }

    /// Feed-in remuneration of one layer at a concatenated timestep, in CHF/kWh
    pub fn feedin_tariff(&self, layer: &LayerID, step: usize) -> f64 {
        self.feedin_tariffs[layer][step]
    }
}

/// Apportion a building's annual end-use demand over the reduced grid.
///
/// The hourly weight is the weekday/weekend daily shape for the end use, scaled for heating by
/// the heating signature (degree difference to the comfort set point). Weights are normalized so
/// that the frequency-weighted sum over the grid reproduces the annual demand.
fn demand_profile(
    building: &Building,
    end_use: EndUse,
    grid: &ReducedGrid,
    options: &MethodOptions,
    rng: &mut StdRng,
) -> Result<Vec<f64>> {
    let annual = match end_use {
        EndUse::Heating => building.annual_demands.heating,
        EndUse::Dhw => building.annual_demands.dhw,
        EndUse::Electricity => building.annual_demands.electricity,
    };

    let mut weights = Vec::new();
    let mut offset = 0;
    for (p, period) in grid.periods.iter().enumerate() {
        let weekday = grid
            .attributes
            .contains_key(&Attribute::Weekday)
            .then(|| grid.value(Attribute::Weekday, p, 0) >= 0.5)
            .unwrap_or(true);

        // Daily perturbation, applied per period so every represented day moves together
        let (amplitude, shift) = if options.include_stochasticity {
            let (sd_amplitude, sd_shift) = options.sd_stochasticity;
            let amplitude = Normal::new(1.0, sd_amplitude)
                .context("Invalid amplitude deviation")?
                .sample(rng)
                .max(0.0);
            let shift = Normal::new(0.0, sd_shift)
                .context("Invalid shift deviation")?
                .sample(rng);
            (amplitude, shift)
        } else {
            (1.0, 0.0)
        };

        for t in 0..period.time_end {
            let shape = shape_value(end_use, weekday, t, period.time_end, shift);
            let seasonal = match end_use {
                EndUse::Heating => {
                    let t_ext = grid.value(Attribute::Temperature, p, t);
                    (building.t_comfort - t_ext).max(0.0)
                }
                _ => 1.0,
            };
            weights.push(shape * seasonal * amplitude);
        }
        offset += period.time_end;
    }
    debug_assert_eq!(offset, weights.len());

    // Normalize to the annual demand under the period frequencies
    let mut total = 0.0;
    let mut index = 0;
    for period in &grid.periods {
        for _ in 0..period.time_end {
            total += period.frequency * weights[index];
            index += 1;
        }
    }
    if total > 0.0 {
        let scale = annual / total;
        for weight in &mut weights {
            *weight *= scale;
        }
    }

    Ok(weights)
}

/// Sample a daily shape at timestep `t` of a period of length `len`, with a continuous time shift
/// applied by linear interpolation.
fn shape_value(end_use: EndUse, weekday: bool, t: usize, len: usize, shift: f64) -> f64 {
    let shape: &[f64; 24] = match (end_use, weekday) {
        (EndUse::Heating, true) => &HEAT_SHAPE_WEEKDAY,
        (EndUse::Heating, false) => &HEAT_SHAPE_WEEKEND,
        (EndUse::Dhw, true) => &DHW_SHAPE_WEEKDAY,
        (EndUse::Dhw, false) => &DHW_SHAPE_WEEKEND,
        (EndUse::Electricity, true) => &ELEC_SHAPE_WEEKDAY,
        (EndUse::Electricity, false) => &ELEC_SHAPE_WEEKEND,
    };

    // Map the period timestep onto the 24-hour shape and shift continuously
    let hour = (t as f64) * 24.0 / (len.max(1) as f64) - shift;
    let hour = hour.rem_euclid(24.0);
    let below = hour.floor() as usize % 24;
    let above = (below + 1) % 24;
    let fraction = hour - hour.floor();
    shape[below] * (1.0 - fraction) + shape[above] * fraction
}

/// Source temperature series per heat-pump instance
fn hp_source_temperatures(
    catalog: &Catalog,
    grid: &ReducedGrid,
) -> IndexMap<UnitID, Vec<f64>> {
    let mut map = IndexMap::new();
    for unit in catalog.units.values() {
        let Some(source) = unit.heat_source else {
            continue;
        };
        let series = grid
            .iter_timesteps()
            .map(|(p, t)| match source {
                HeatSource::Air => grid.value(Attribute::Temperature, p, t),
                HeatSource::Lake => LAKE_SOURCE_TEMPERATURE,
                HeatSource::Geothermal => GEOTHERMAL_SOURCE_TEMPERATURE,
                HeatSource::Dhn => DHN_MEAN_TEMPERATURE,
                HeatSource::User(value) => value,
            })
            .collect();
        map.insert(unit.id.clone(), series);
    }
    map
}

/// Constant inlet/outlet temperatures per stream, expanded over the grid
fn stream_temperatures(catalog: &Catalog, n_steps: usize) -> IndexMap<StreamID, Vec<(f64, f64)>> {
    catalog
        .streams
        .values()
        .map(|stream| {
            (
                stream.id.clone(),
                vec![(stream.t_in, stream.t_out); n_steps],
            )
        })
        .collect()
}

/// Emission factor series per layer: dynamic grid intensity for electricity when enabled,
/// constant factors otherwise
fn emission_factors(
    catalog: &Catalog,
    grid: &ReducedGrid,
    options: &MethodOptions,
) -> IndexMap<LayerID, Vec<f64>> {
    catalog
        .layers
        .values()
        .map(|layer| {
            let dynamic = options.use_dynamic_emission_profiles
                && layer.id.as_str() == "Electricity"
                && grid.attributes.contains_key(&Attribute::Emissions);
            let series = grid
                .iter_timesteps()
                .map(|(p, t)| {
                    if dynamic {
                        grid.value(Attribute::Emissions, p, t)
                    } else {
                        layer.emissions
                    }
                })
                .collect();
            (layer.id.clone(), series)
        })
        .collect()
}

/// Resolve a layer price onto the reduced grid.
///
/// Prices in the catalog are constants, so the series is flat; keeping a per-timestep vector lets
/// the pricing sites stay agnostic to where the tariff came from.
fn tariffs(
    catalog: &Catalog,
    n_steps: usize,
    price: impl Fn(&Layer) -> f64,
) -> IndexMap<LayerID, Vec<f64>> {
    catalog
        .layers
        .values()
        .map(|layer| (layer.id.clone(), vec![price(layer); n_steps]))
        .collect()
}

/// Solar gain per building from the irradiance attribute, window fraction and facade area
fn solar_gains(
    buildings: &BuildingMap,
    grid: &ReducedGrid,
    options: &MethodOptions,
) -> IndexMap<BuildingID, Vec<f64>> {
    buildings
        .values()
        .map(|building| {
            let area = if options.use_facades {
                building.facade_area
            } else {
                building.solar_roof_area
            };
            let series = grid
                .iter_timesteps()
                .map(|(p, t)| {
                    // Irradiance in W/m2, gains in kW
                    grid.value(Attribute::Irradiance, p, t) * DEFAULT_WINDOW_FRACTION * area
                        / 1000.0
                })
                .collect();
            (building.id.clone(), series)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{buildings, catalog, grid};
    use float_cmp::assert_approx_eq;
    use rstest::rstest;

    #[rstest]
    fn test_demand_reproduces_annual(buildings: BuildingMap, catalog: Catalog, grid: ReducedGrid) {
        let options = MethodOptions::default();
        let profiles = Profiles::assemble(&buildings, &catalog, &grid, &options).unwrap();

        let b1 = &buildings["b1"];
        let profile = &profiles.demands[&(b1.id.clone(), "Electricity".into())];

        // Frequency-weighted sum over the grid equals the annual demand
        let mut total = 0.0;
        let mut index = 0;
        for period in &grid.periods {
            for _ in 0..period.time_end {
                total += period.frequency * profile[index];
                index += 1;
            }
        }
        assert_approx_eq!(
            f64,
            total,
            b1.annual_demands.electricity,
            epsilon = 1e-6
        );
    }

    #[rstest]
    fn test_heating_follows_temperature(
        buildings: BuildingMap,
        catalog: Catalog,
        grid: ReducedGrid,
    ) {
        let options = MethodOptions::default();
        let profiles = Profiles::assemble(&buildings, &catalog, &grid, &options).unwrap();
        let profile = &profiles.demands[&("b1".into(), "Heat".into())];

        // The cold extreme period carries more heating demand per hour than the warmest period
        let cold_step = grid.offset(grid.n_periods() - 2);
        let hot_step = grid.offset(grid.n_periods() - 1);
        assert!(profile[cold_step] > profile[hot_step]);
    }

    #[rstest]
    fn test_hp_source_rules(catalog: Catalog, grid: ReducedGrid, buildings: BuildingMap) {
        let options = MethodOptions::default();
        let profiles = Profiles::assemble(&buildings, &catalog, &grid, &options).unwrap();

        // Air-source heat pumps track the external temperature
        let series = &profiles.hp_source_temperatures[&UnitID::from("HeatPump_Air_b1")];
        let (p, t) = grid.iter_timesteps().next().unwrap();
        assert_approx_eq!(f64, series[0], grid.value(Attribute::Temperature, p, t));
    }

    #[rstest]
    fn test_stochasticity_changes_profile_deterministically(
        buildings: BuildingMap,
        catalog: Catalog,
        grid: ReducedGrid,
    ) {
        let mut options = MethodOptions::default();
        options.include_stochasticity = true;
        let first = Profiles::assemble(&buildings, &catalog, &grid, &options).unwrap();
        let second = Profiles::assemble(&buildings, &catalog, &grid, &options).unwrap();
        // Seeded: reruns are identical
        assert_eq!(first, second);

        let plain =
            Profiles::assemble(&buildings, &catalog, &grid, &MethodOptions::default()).unwrap();
        assert_ne!(first.demands, plain.demands);
    }

    #[rstest]
    fn test_dynamic_emission_factors(buildings: BuildingMap, catalog: Catalog, grid: ReducedGrid) {
        let mut options = MethodOptions::default();
        options.use_dynamic_emission_profiles = true;
        let profiles = Profiles::assemble(&buildings, &catalog, &grid, &options).unwrap();

        let factors = &profiles.emission_factors[&LayerID::from("Electricity")];
        let (p, t) = grid.iter_timesteps().next().unwrap();
        assert_approx_eq!(f64, factors[0], grid.value(Attribute::Emissions, p, t));

        // Other layers keep their constant factor
        let gas = &profiles.emission_factors[&LayerID::from("NaturalGas")];
        assert_approx_eq!(f64, gas[0], catalog.layers[&LayerID::from("NaturalGas")].emissions);
    }

    #[rstest]
    fn test_tariff_series(buildings: BuildingMap, catalog: Catalog, grid: ReducedGrid) {
        let options = MethodOptions::default();
        let profiles = Profiles::assemble(&buildings, &catalog, &grid, &options).unwrap();

        let electricity = LayerID::from("Electricity");
        let layer = &catalog.layers[&electricity];
        let n_steps = grid.iter_timesteps().count();
        assert_eq!(profiles.supply_tariffs[&electricity].len(), n_steps);
        for step in 0..n_steps {
            assert_approx_eq!(f64, profiles.supply_tariff(&electricity, step), layer.cost_supply);
            assert_approx_eq!(f64, profiles.feedin_tariff(&electricity, step), layer.cost_demand);
        }
    }
}
