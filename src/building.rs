//! The building catalog: geometry, thermal envelope, occupancy class and annual end-use demands.
use crate::error::{FailureKind, kind};
use crate::id::{define_id_getter, define_id_type};
use crate::input::{deserialise_proportion, read_vec_from_csv};
use anyhow::{Context, Result, ensure};
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::Path;

define_id_type! {BuildingID}

/// A map of [`Building`]s, keyed by building ID
pub type BuildingMap = IndexMap<BuildingID, Building>;

const BUILDINGS_FILE_NAME: &str = "buildings.csv";

/// A raw row of the building catalog CSV.
///
/// Optional columns default to the per-class mean over buildings that do declare them; mandatory
/// columns (ERA, U-value, set points) make the row invalid when absent.
#[derive(Debug, Clone, Deserialize)]
struct BuildingRecord {
    id: BuildingID,
    /// SIA occupancy class code, "I" to "XIII"
    class: String,
    /// Share of the ERA attributed to the class
    #[serde(default = "default_ratio", deserialize_with = "deserialise_proportion")]
    ratio: f64,
    /// Free-form status field, carried through to the results
    #[serde(default)]
    status: String,
    /// Energy reference area in m2
    era: Option<f64>,
    /// Solar roof area in m2
    solar_roof_area: Option<f64>,
    /// Facade area in m2
    facade_area: Option<f64>,
    /// Height in m
    height: Option<f64>,
    /// Heat-loss coefficient in kW/m2K
    u_value: Option<f64>,
    /// Heat capacity in Wh/m2K
    heat_capacity: Option<f64>,
    /// Comfort set point in degrees C
    t_comfort: Option<f64>,
    /// Heating supply temperature in degrees C
    t_supply_heat: Option<f64>,
    /// Heating return temperature in degrees C
    t_return_heat: Option<f64>,
    /// Cooling supply temperature in degrees C
    t_supply_cool: Option<f64>,
    /// Cooling return temperature in degrees C
    t_return_cool: Option<f64>,
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
    /// Identifier of the transformer the building hangs off
    #[serde(default)]
    transformer: String,
    /// Federal building identifier
    #[serde(default)]
    egid: String,
    /// Period of construction, free-form string
    #[serde(default)]
    period: String,
    /// Occupancy in capita
    capita: Option<f64>,
    /// Annual space-heating demand in kWh/y
    annual_heating_demand: Option<f64>,
    /// Annual cooling demand in kWh/y
    annual_cooling_demand: Option<f64>,
    /// Annual domestic-hot-water demand in kWh/y
    annual_dhw_demand: Option<f64>,
    /// Annual electricity demand in kWh/y
    annual_electricity_demand: Option<f64>,
}
define_id_getter! {BuildingRecord, BuildingID}

fn default_ratio() -> f64 {
    1.0
}

/// A validated building
#[derive(Debug, Clone, PartialEq)]
pub struct Building {
    /// A unique identifier for the building
    pub id: BuildingID,
    /// SIA occupancy class code, "I" to "XIII"
    pub class: String,
    /// Share of the ERA attributed to the class
    pub ratio: f64,
    /// Free-form status field
    pub status: String,
    /// Energy reference area in m2
    pub era: f64,
    /// Solar roof area in m2
    pub solar_roof_area: f64,
    /// Facade area in m2
    pub facade_area: f64,
    /// Height in m
    pub height: f64,
    /// Heat-loss coefficient in kW/m2K
    pub u_value: f64,
    /// Heat capacity in Wh/m2K
    pub heat_capacity: f64,
    /// Comfort set point in degrees C
    pub t_comfort: f64,
    /// Heating supply/return temperatures in degrees C
    pub heating_temperatures: (f64, f64),
    /// Cooling supply/return temperatures in degrees C
    pub cooling_temperatures: (f64, f64),
    /// Coordinates, zero when absent
    pub coordinates: (f64, f64, f64),
    /// Identifier of the transformer the building hangs off
    pub transformer: String,
    /// Federal building identifier
    pub egid: String,
    /// Period of construction
    pub period: String,
    /// Occupancy in capita
    pub capita: f64,
    /// Annual end-use demands in kWh/y
    pub annual_demands: AnnualDemands,
}
define_id_getter! {Building, BuildingID}

/// Annual end-use demands of a building in kWh/y
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AnnualDemands {
    /// Space heating
    pub heating: f64,
    /// Space cooling
    pub cooling: f64,
    /// Domestic hot water
    pub dhw: f64,
    /// Electricity
    pub electricity: f64,
}

/// The recognized SIA class codes
const CLASS_CODES: [&str; 13] = [
    "I", "II", "III", "IV", "V", "VI", "VII", "VIII", "IX", "X", "XI", "XII", "XIII",
];

/// Read the building catalog from the specified model directory.
pub fn read_buildings(model_dir: &Path) -> Result<BuildingMap> {
    let file_path = model_dir.join(BUILDINGS_FILE_NAME);
    let records: Vec<BuildingRecord> = read_vec_from_csv(&file_path)?;
    buildings_from_records(records)
        .with_context(|| format!("Invalid building catalog {}", file_path.display()))
}

/// Validate the raw rows and fill optional columns from per-class means.
fn buildings_from_records(records: Vec<BuildingRecord>) -> Result<BuildingMap> {
    let mut map = BuildingMap::new();
    for record in &records {
        ensure!(
            CLASS_CODES.contains(&record.class.as_str()),
            "Building {}: unknown class code {}",
            record.id,
            record.class
        );
        let building = validate_building(record, &records)?;
        ensure!(
            map.insert(building.id.clone(), building).is_none(),
            "Duplicate building ID {}",
            record.id
        );
    }

    Ok(map)
}

/// Check mandatory fields and default the optional ones.
fn validate_building(record: &BuildingRecord, all: &[BuildingRecord]) -> Result<Building> {
    let mandatory = |value: Option<f64>, field: &str| {
        value
            .with_context(|| format!("Building {}: missing mandatory field {field}", record.id))
            .context(kind(FailureKind::MissingBuildingField))
    };

    let era = mandatory(record.era, "era")?;
    let u_value = mandatory(record.u_value, "u_value")?;
    let t_comfort = mandatory(record.t_comfort, "t_comfort")?;
    let t_supply_heat = mandatory(record.t_supply_heat, "t_supply_heat")?;
    let t_return_heat = mandatory(record.t_return_heat, "t_return_heat")?;
    ensure!(era > 0.0, "Building {}: ERA must be positive", record.id);

    Ok(Building {
        id: record.id.clone(),
        class: record.class.clone(),
        ratio: record.ratio,
        status: record.status.clone(),
        era,
        solar_roof_area: optional(record, all, |r| r.solar_roof_area),
        facade_area: optional(record, all, |r| r.facade_area),
        height: optional(record, all, |r| r.height),
        u_value,
        heat_capacity: optional(record, all, |r| r.heat_capacity),
        t_comfort,
        heating_temperatures: (t_supply_heat, t_return_heat),
        cooling_temperatures: (
            record.t_supply_cool.unwrap_or(12.0),
            record.t_return_cool.unwrap_or(17.0),
        ),
        coordinates: (
            record.x.unwrap_or(0.0),
            record.y.unwrap_or(0.0),
            record.z.unwrap_or(0.0),
        ),
        transformer: record.transformer.clone(),
        egid: record.egid.clone(),
        period: record.period.clone(),
        capita: optional(record, all, |r| r.capita),
        annual_demands: AnnualDemands {
            heating: optional(record, all, |r| r.annual_heating_demand),
            cooling: optional(record, all, |r| r.annual_cooling_demand),
            dhw: optional(record, all, |r| r.annual_dhw_demand),
            electricity: optional(record, all, |r| r.annual_electricity_demand),
        },
    })
}

/// The value of an optional column, defaulting to the mean over same-class buildings that declare
/// it, and zero when none do.
fn optional<F>(record: &BuildingRecord, all: &[BuildingRecord], field: F) -> f64
where
    F: Fn(&BuildingRecord) -> Option<f64>,
{
    if let Some(value) = field(record) {
        return value;
    }

    let class_values: Vec<f64> = all
        .iter()
        .filter(|other| other.class == record.class)
        .filter_map(&field)
        .collect();
    if class_values.is_empty() {
        0.0
    } else {
        class_values.iter().sum::<f64>() / class_values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::failure_kind;

    fn record(id: &str) -> BuildingRecord {
        BuildingRecord {
            id: id.into(),
            class: "I".into(),
            ratio: 1.0,
            status: String::new(),
            era: Some(200.0),
            solar_roof_area: Some(50.0),
            facade_area: Some(120.0),
            height: Some(9.0),
            u_value: Some(0.002),
            heat_capacity: Some(120.0),
            t_comfort: Some(20.0),
            t_supply_heat: Some(55.0),
            t_return_heat: Some(45.0),
            t_supply_cool: None,
            t_return_cool: None,
            x: None,
            y: None,
            z: None,
            transformer: String::new(),
            egid: String::new(),
            period: "1971-1980".into(),
            capita: Some(4.0),
            annual_heating_demand: Some(12000.0),
            annual_cooling_demand: None,
            annual_dhw_demand: Some(2500.0),
            annual_electricity_demand: Some(3500.0),
        }
    }

    #[test]
    fn test_valid_building() {
        let map = buildings_from_records(vec![record("b1")]).unwrap();
        let b1 = &map["b1"];
        assert_eq!(b1.era, 200.0);
        assert_eq!(b1.heating_temperatures, (55.0, 45.0));
        assert_eq!(b1.annual_demands.heating, 12000.0);
    }

    #[test]
    fn test_missing_mandatory_field() {
        let mut bad = record("b1");
        bad.era = None;
        let err = buildings_from_records(vec![bad]).unwrap_err();
        assert_eq!(failure_kind(&err), Some(FailureKind::MissingBuildingField));
    }

    #[test]
    fn test_optional_field_class_mean() {
        let mut partial = record("b2");
        partial.capita = None;
        let map = buildings_from_records(vec![record("b1"), partial]).unwrap();
        // b2 inherits the class-I mean over buildings that declare capita
        assert_eq!(map["b2"].capita, 4.0);
    }

    #[test]
    fn test_unknown_class_rejected() {
        let mut bad = record("b1");
        bad.class = "XIV".into();
        assert!(buildings_from_records(vec![bad]).is_err());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        assert!(buildings_from_records(vec![record("b1"), record("b1")]).is_err());
    }

    #[test]
    fn test_ratio_out_of_range_rejected() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join(BUILDINGS_FILE_NAME)).unwrap();
        writeln!(
            file,
            "id,class,ratio,era,u_value,t_comfort,t_supply_heat,t_return_heat,period"
        )
        .unwrap();
        writeln!(file, "b1,I,1.5,200,0.002,20,55,45,1971-1980").unwrap();
        drop(file);

        assert!(read_buildings(dir.path()).is_err());
    }
}
