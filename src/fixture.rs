//! Shared fixtures for tests: a two-building district with a small unit catalog and a reduced
//! time grid of two typical periods plus the extreme singletons.
#![allow(missing_docs)]
use crate::building::{AnnualDemands, Building, BuildingMap};
use crate::clustering::{Period, ReducedGrid};
use crate::infrastructure::{Catalog, Layer, LayerMap, Stream, Unit, UnitParameters, UnitScope};
use crate::infrastructure::{HeatSource, LayerID, StreamID, UnitID};
use crate::weather::Attribute;
use indexmap::IndexMap;
use rstest::fixture;

fn building(id: &str, heating: f64, electricity: f64) -> Building {
    Building {
        id: id.into(),
        class: "I".into(),
        ratio: 1.0,
        status: String::new(),
        era: 200.0,
        solar_roof_area: 50.0,
        facade_area: 120.0,
        height: 9.0,
        u_value: 0.002,
        heat_capacity: 120.0,
        t_comfort: 20.0,
        heating_temperatures: (55.0, 45.0),
        cooling_temperatures: (12.0, 17.0),
        coordinates: (0.0, 0.0, 0.0),
        transformer: String::new(),
        egid: String::new(),
        period: "1971-1980".into(),
        capita: 4.0,
        annual_demands: AnnualDemands {
            heating,
            cooling: 0.0,
            dhw: 2500.0,
            electricity,
        },
    }
}

#[fixture]
pub fn buildings() -> BuildingMap {
    [
        building("b1", 12000.0, 3500.0),
        building("b2", 18000.0, 4200.0),
    ]
    .into_iter()
    .map(|building| (building.id.clone(), building))
    .collect()
}

fn layer(id: &str, cost_supply: f64, cost_demand: f64, emissions: f64) -> Layer {
    Layer {
        id: id.into(),
        cost_supply,
        cost_demand,
        emissions,
        network_capacity: 1000.0,
        reinforcement_capacity: 200.0,
        supply_allowed: id != "Heat",
        demand_allowed: id == "Electricity",
    }
}

#[fixture]
pub fn layers() -> LayerMap {
    [
        layer("Electricity", 0.25, 0.08, 0.1),
        layer("NaturalGas", 0.11, 0.0, 0.2),
        layer("Heat", 0.0, 0.0, 0.0),
    ]
    .into_iter()
    .map(|layer| (layer.id.clone(), layer))
    .collect()
}

fn parameters(f_min: f64, f_max: f64, cost_inv2: f64) -> UnitParameters {
    UnitParameters {
        f_min,
        f_max,
        cost_inv: (100.0, cost_inv2),
        cost_rep: (0.0, 0.0),
        gwp: (50.0, 10.0),
        lifetime: 20.0,
    }
}

fn flows(entries: &[(&str, f64)]) -> IndexMap<LayerID, f64> {
    entries
        .iter()
        .map(|&(layer, coefficient)| (layer.into(), coefficient))
        .collect()
}

/// Two building-scope families (Boiler, HeatPump_Air) instantiated per building and one
/// district-scope battery.
#[fixture]
pub fn catalog(buildings: BuildingMap, layers: LayerMap) -> Catalog {
    let mut units: IndexMap<UnitID, Unit> = IndexMap::new();
    for building_id in buildings.keys() {
        let boiler = Unit {
            id: format!("Boiler_{building_id}").into(),
            family: "Boiler".into(),
            scope: UnitScope::Building,
            building: Some(building_id.clone()),
            parameters: parameters(2.0, 20.0, 60.0),
            consumes: flows(&[("NaturalGas", 1.05)]),
            produces: flows(&[("Heat", 1.0)]),
            is_storage: false,
            heat_source: None,
            stream_temperatures: None,
        };
        let heat_pump = Unit {
            id: format!("HeatPump_Air_{building_id}").into(),
            family: "HeatPump_Air".into(),
            scope: UnitScope::Building,
            building: Some(building_id.clone()),
            parameters: parameters(1.0, 15.0, 180.0),
            consumes: flows(&[("Electricity", 0.3)]),
            produces: flows(&[("Heat", 1.0)]),
            is_storage: false,
            heat_source: Some(HeatSource::Air),
            stream_temperatures: Some((55.0, 45.0)),
        };
        units.insert(boiler.id.clone(), boiler);
        units.insert(heat_pump.id.clone(), heat_pump);
    }
    let battery = Unit {
        id: "DistrictBattery".into(),
        family: "DistrictBattery".into(),
        scope: UnitScope::District,
        building: None,
        parameters: parameters(0.0, 100.0, 300.0),
        consumes: flows(&[("Electricity", 1.0)]),
        produces: flows(&[("Electricity", 0.95)]),
        is_storage: true,
        heat_source: None,
        stream_temperatures: None,
    };
    units.insert(battery.id.clone(), battery);

    let streams: IndexMap<StreamID, Stream> = units
        .values()
        .filter_map(|unit| {
            let (t_in, t_out) = unit.stream_temperatures?;
            let id: StreamID = format!("{}_stream", unit.id).into();
            Some((
                id.clone(),
                Stream {
                    id,
                    building: unit.building.clone()?,
                    unit: unit.id.clone(),
                    t_in,
                    t_out,
                },
            ))
        })
        .collect();

    Catalog {
        layers,
        units,
        streams,
    }
}

/// A reduced grid with a winter weekday period, a summer weekend period and the two extreme
/// singletons. The annual hour mapping is left empty; model-level tests never walk it.
#[fixture]
pub fn grid() -> ReducedGrid {
    let periods = vec![
        Period {
            frequency: 200.0,
            time_end: 4,
        },
        Period {
            frequency: 165.0,
            time_end: 4,
        },
        Period {
            frequency: 1.0,
            time_end: 1,
        },
        Period {
            frequency: 1.0,
            time_end: 1,
        },
    ];

    let mut attributes = IndexMap::new();
    attributes.insert(
        Attribute::Temperature,
        vec![0.0, 2.0, 4.0, 2.0, 18.0, 22.0, 26.0, 22.0, -8.8, 28.6],
    );
    attributes.insert(
        Attribute::Irradiance,
        vec![0.0, 100.0, 300.0, 100.0, 0.0, 400.0, 800.0, 400.0, 0.0, 900.0],
    );
    attributes.insert(
        Attribute::Weekday,
        vec![1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0],
    );
    attributes.insert(
        Attribute::Emissions,
        vec![0.08, 0.10, 0.12, 0.10, 0.06, 0.09, 0.14, 0.09, 0.12, 0.05],
    );

    ReducedGrid {
        periods,
        period_of_year: Vec::new(),
        time_of_year: Vec::new(),
        attributes,
    }
}
