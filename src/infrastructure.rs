//! The infrastructure model: energy carriers (layers), conversion and storage units, and the
//! typed sets the optimization model consumes.
use crate::building::{BuildingID, BuildingMap};
use crate::error::{FailureKind, kind};
use crate::id::{define_id_getter, define_id_type};
use crate::input::{read_csv_id_file, read_vec_from_csv};
use anyhow::{Context, Result, bail, ensure};
use indexmap::IndexMap;
use log::debug;
use serde::Deserialize;
use serde_string_enum::DeserializeLabeledStringEnum;
use std::path::Path;

define_id_type! {LayerID}
define_id_type! {UnitID}
define_id_type! {StreamID}

const LAYERS_FILE_NAME: &str = "layers.csv";
const UNITS_FILE_NAME: &str = "units.csv";

/// A named energy carrier with prices, emissions and network limits at the hub boundary.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Layer {
    /// A unique identifier for the layer (e.g. Electricity)
    pub id: LayerID,
    /// Cost of supply from the network in currency per kWh
    pub cost_supply: f64,
    /// Remuneration of demand fed back to the network in currency per kWh
    pub cost_demand: f64,
    /// Constant emission factor in kgCO2 per kWh
    pub emissions: f64,
    /// Existing network capacity at the building boundary in kW
    pub network_capacity: f64,
    /// Additional capacity the network may be reinforced by, in kW
    pub reinforcement_capacity: f64,
    /// Whether the network may supply this layer to buildings
    pub supply_allowed: bool,
    /// Whether buildings may feed this layer back to the network
    pub demand_allowed: bool,
}
define_id_getter! {Layer, LayerID}

/// A map of [`Layer`]s, keyed by layer ID
pub type LayerMap = IndexMap<LayerID, Layer>;

/// The scale a unit instance lives at
#[derive(Debug, Clone, Copy, PartialEq, Eq, DeserializeLabeledStringEnum)]
pub enum UnitScope {
    /// One instance per building
    #[string = "building"]
    Building,
    /// One shared instance for the whole district
    #[string = "district"]
    District,
}

/// Direction of a unit's relation to a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The unit consumes the layer
    In,
    /// The unit produces the layer
    Out,
}

/// The heat source rule of a heat-pump family
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeatSource {
    /// Source temperature follows the external temperature
    Air,
    /// Constant lake temperature
    Lake,
    /// Constant ground temperature
    Geothermal,
    /// Mean of the district-heating-network supply and return temperatures
    Dhn,
    /// User-supplied constant
    User(f64),
}

/// A raw row of the unit catalog CSV, describing one unit family.
#[derive(Debug, Clone, Deserialize)]
struct UnitFamilyRecord {
    /// Family name, e.g. HeatPump_Geothermal
    family: String,
    /// Scale the family applies at
    scope: UnitScope,
    /// Minimum installable capacity in kW (or kWh for storage)
    f_min: f64,
    /// Maximum installable capacity
    f_max: f64,
    /// Fixed investment cost in currency
    cost_inv1: f64,
    /// Investment cost per unit capacity in currency/kW
    cost_inv2: f64,
    /// Fixed replacement cost
    #[serde(default)]
    cost_rep1: f64,
    /// Replacement cost per unit capacity
    #[serde(default)]
    cost_rep2: f64,
    /// Fixed embedded emissions in kgCO2
    #[serde(default)]
    gwp_unit1: f64,
    /// Embedded emissions per unit capacity in kgCO2/kW
    #[serde(default)]
    gwp_unit2: f64,
    /// Lifetime in years
    lifetime: f64,
    /// Consumed layers with flow coefficients, e.g. `Electricity=0.25`
    #[serde(default)]
    consumes: String,
    /// Produced layers with flow coefficients, e.g. `Heat=1.0`
    #[serde(default)]
    produces: String,
    /// Whether the family is a storage (capacity bounds state of charge, not flow)
    #[serde(default)]
    storage: bool,
    /// Heat source rule for heat pumps: air, lake, geothermal, dhn or a number
    #[serde(default)]
    heat_source: String,
    /// Stream inlet temperature in degrees C, for heat-exchanging units
    #[serde(default)]
    t_stream_in: Option<f64>,
    /// Stream outlet temperature in degrees C
    #[serde(default)]
    t_stream_out: Option<f64>,
}

/// Sizing and cost parameters of a unit instance
#[derive(Debug, Clone, PartialEq)]
pub struct UnitParameters {
    /// Minimum installable capacity, binding when the unit is used
    pub f_min: f64,
    /// Maximum installable capacity
    pub f_max: f64,
    /// Fixed and per-capacity investment cost
    pub cost_inv: (f64, f64),
    /// Fixed and per-capacity replacement cost
    pub cost_rep: (f64, f64),
    /// Fixed and per-capacity embedded emissions
    pub gwp: (f64, f64),
    /// Lifetime in years
    pub lifetime: f64,
}

impl UnitParameters {
    /// Annualized investment cost of an installed unit of capacity `mult`.
    ///
    /// Straight-line annualization over the lifetime, replacement folded in.
    pub fn annual_investment(&self, mult: f64) -> f64 {
        let (c1, c2) = self.cost_inv;
        let (r1, r2) = self.cost_rep;
        (c1 + r1 + (c2 + r2) * mult) / self.lifetime
    }

    /// Annualized embedded emissions of an installed unit of capacity `mult`
    pub fn annual_gwp(&self, mult: f64) -> f64 {
        let (g1, g2) = self.gwp;
        (g1 + g2 * mult) / self.lifetime
    }
}

/// A unit instance: one installable device at one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    /// Instance identifier: `family` for district units, `family_building` otherwise
    pub id: UnitID,
    /// The family this instance belongs to
    pub family: String,
    /// The scale this instance lives at
    pub scope: UnitScope,
    /// Owning building for building-scope instances
    pub building: Option<BuildingID>,
    /// Sizing and cost parameters
    pub parameters: UnitParameters,
    /// Consumed layers with flow per unit of main output
    pub consumes: IndexMap<LayerID, f64>,
    /// Produced layers with flow per unit of main output
    pub produces: IndexMap<LayerID, f64>,
    /// Whether capacity bounds state of charge rather than flow
    pub is_storage: bool,
    /// Heat source rule, for heat-pump families
    pub heat_source: Option<HeatSource>,
    /// Stream inlet/outlet temperatures, for heat-exchanging units
    pub stream_temperatures: Option<(f64, f64)>,
}
define_id_getter! {Unit, UnitID}

impl Unit {
    /// The flow coefficient of this unit on `layer` in `direction`, zero when unrelated
    pub fn flowrate(&self, layer: &LayerID, direction: Direction) -> f64 {
        let map = match direction {
            Direction::In => &self.consumes,
            Direction::Out => &self.produces,
        };
        map.get(layer).copied().unwrap_or(0.0)
    }
}

/// A labeled heat-carrying flow at fixed inlet/outlet temperatures
#[derive(Debug, Clone, PartialEq)]
pub struct Stream {
    /// A unique identifier for the stream
    pub id: StreamID,
    /// Owning building
    pub building: BuildingID,
    /// The unit the stream belongs to
    pub unit: UnitID,
    /// Inlet temperature in degrees C
    pub t_in: f64,
    /// Outlet temperature in degrees C
    pub t_out: f64,
}

/// How a unit's install decision is fixed by the scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitFixing {
    /// `Use = 1`
    Enforced,
    /// `Use = 0`, `Mult = 0`
    Excluded,
}

/// The typed catalog of layers, unit instances and streams for one campaign.
///
/// Built once and read-only thereafter; the decomposition loop shares it across tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    /// Active layers
    pub layers: LayerMap,
    /// Unit instances, building-scope and district-scope
    pub units: IndexMap<UnitID, Unit>,
    /// Heat streams of heat-exchanging units
    pub streams: IndexMap<StreamID, Stream>,
}

impl Catalog {
    /// Read the layer and unit catalogs from the model directory and instantiate units.
    pub fn from_path(model_dir: &Path, buildings: &BuildingMap) -> Result<Self> {
        let layers: LayerMap = read_csv_id_file(&model_dir.join(LAYERS_FILE_NAME))?;
        let families: Vec<UnitFamilyRecord> = read_vec_from_csv(&model_dir.join(UNITS_FILE_NAME))?;
        Self::build(layers, families, buildings)
    }

    /// Instantiate unit families against the building set and check catalog invariants.
    fn build(
        layers: LayerMap,
        families: Vec<UnitFamilyRecord>,
        buildings: &BuildingMap,
    ) -> Result<Self> {
        let mut units = IndexMap::new();
        for family in &families {
            validate_family(family)?;
            let consumes = parse_flowrates(&family.consumes, &layers)
                .with_context(|| format!("Invalid consumes list for {}", family.family))?;
            let produces = parse_flowrates(&family.produces, &layers)
                .with_context(|| format!("Invalid produces list for {}", family.family))?;

            // A unit producing only onto inactive layers can never dispatch
            if produces.is_empty() && !family.storage {
                debug!("Dropping {}: no active produced layer", family.family);
                continue;
            }

            let parameters = UnitParameters {
                f_min: family.f_min,
                f_max: family.f_max,
                cost_inv: (family.cost_inv1, family.cost_inv2),
                cost_rep: (family.cost_rep1, family.cost_rep2),
                gwp: (family.gwp_unit1, family.gwp_unit2),
                lifetime: family.lifetime,
            };
            let heat_source = parse_heat_source(&family.heat_source)?;
            let template = Unit {
                id: family.family.as_str().into(),
                family: family.family.clone(),
                scope: family.scope,
                building: None,
                parameters,
                consumes,
                produces,
                is_storage: family.storage,
                heat_source,
                stream_temperatures: family.t_stream_in.zip(family.t_stream_out),
            };

            match family.scope {
                UnitScope::District => {
                    insert_unit(&mut units, template)?;
                }
                UnitScope::Building => {
                    // Exactly one instance per building
                    for building_id in buildings.keys() {
                        let mut unit = template.clone();
                        unit.id = format!("{}_{building_id}", family.family).into();
                        unit.building = Some(building_id.clone());
                        insert_unit(&mut units, unit)?;
                    }
                }
            }
        }

        let streams = build_streams(&units);
        Ok(Self {
            layers,
            units,
            streams,
        })
    }

    /// Iterate over the unit instances owned by one building
    pub fn units_of_house<'a>(
        &'a self,
        building: &'a BuildingID,
    ) -> impl Iterator<Item = &'a Unit> {
        self.units
            .values()
            .filter(move |unit| unit.building.as_ref() == Some(building))
    }

    /// Iterate over the district-scope unit instances
    pub fn units_of_district(&self) -> impl Iterator<Item = &Unit> {
        self.units
            .values()
            .filter(|unit| unit.scope == UnitScope::District)
    }

    /// Iterate over the instances of one family
    pub fn units_of_type<'a>(&'a self, family: &'a str) -> impl Iterator<Item = &'a Unit> {
        self.units.values().filter(move |unit| unit.family == family)
    }

    /// Iterate over units related to `layer` in `direction`
    pub fn units_of_layer<'a>(
        &'a self,
        layer: &'a LayerID,
        direction: Direction,
    ) -> impl Iterator<Item = &'a Unit> {
        self.units
            .values()
            .filter(move |unit| unit.flowrate(layer, direction) != 0.0)
    }

    /// Iterate over the streams of one building
    pub fn streams_of_building<'a>(
        &'a self,
        building: &'a BuildingID,
    ) -> impl Iterator<Item = &'a Stream> {
        self.streams
            .values()
            .filter(move |stream| &stream.building == building)
    }

    /// Resolve the scenario's enforce/exclude lists against the catalog.
    ///
    /// A name matches either a family (fixing every instance) or a specific instance ID. Unknown
    /// names are a [`FailureKind::MissingCatalogEntry`].
    pub fn resolve_fixing(
        &self,
        enforce_units: &[String],
        exclude_units: &[String],
    ) -> Result<IndexMap<UnitID, UnitFixing>> {
        let mut fixing = IndexMap::new();
        for (names, state) in [
            (enforce_units, UnitFixing::Enforced),
            (exclude_units, UnitFixing::Excluded),
        ] {
            for name in names {
                let matched: Vec<UnitID> = self
                    .units
                    .values()
                    .filter(|unit| unit.family == *name || unit.id.as_str() == name.as_str())
                    .map(|unit| unit.id.clone())
                    .collect();
                if matched.is_empty() {
                    return Err(anyhow::anyhow!("Unknown unit {name} in fixing list")
                        .context(kind(FailureKind::MissingCatalogEntry)));
                }
                for id in matched {
                    fixing.insert(id, state);
                }
            }
        }
        Ok(fixing)
    }
}

fn insert_unit(units: &mut IndexMap<UnitID, Unit>, unit: Unit) -> Result<()> {
    let id = unit.id.clone();
    ensure!(
        units.insert(id.clone(), unit).is_none(),
        "Duplicate unit instance {id}"
    );
    Ok(())
}

/// Check the per-family invariants
fn validate_family(family: &UnitFamilyRecord) -> Result<()> {
    ensure!(
        family.f_min <= family.f_max,
        "Unit family {}: F_min exceeds F_max",
        family.family
    );
    ensure!(
        family.lifetime > 0.0,
        "Unit family {}: lifetime must be positive",
        family.family
    );
    ensure!(
        !family.consumes.is_empty() || !family.produces.is_empty(),
        "Unit family {}: belongs to no layer",
        family.family
    );
    Ok(())
}

/// Parse a `Layer=coeff;Layer=coeff` list, dropping entries whose layer is inactive.
fn parse_flowrates(list: &str, layers: &LayerMap) -> Result<IndexMap<LayerID, f64>> {
    let mut map = IndexMap::new();
    for item in list.split(';').filter(|item| !item.is_empty()) {
        let Some((layer, coefficient)) = item.split_once('=') else {
            bail!("Malformed flow entry '{item}'");
        };
        let coefficient: f64 = coefficient
            .trim()
            .parse()
            .with_context(|| format!("Invalid coefficient in '{item}'"))?;
        ensure!(coefficient > 0.0, "Flow coefficient must be positive");
        let layer_id: LayerID = layer.trim().into();
        if layers.contains_key(&layer_id) {
            map.insert(layer_id, coefficient);
        }
    }
    Ok(map)
}

/// Parse the heat source column
fn parse_heat_source(value: &str) -> Result<Option<HeatSource>> {
    let source = match value.trim() {
        "" => return Ok(None),
        "air" => HeatSource::Air,
        "lake" => HeatSource::Lake,
        "geothermal" => HeatSource::Geothermal,
        "dhn" => HeatSource::Dhn,
        other => HeatSource::User(
            other
                .parse()
                .with_context(|| format!("Invalid heat source '{other}'"))?,
        ),
    };
    Ok(Some(source))
}

/// Derive one stream per heat-exchanging unit with declared temperatures
fn build_streams(units: &IndexMap<UnitID, Unit>) -> IndexMap<StreamID, Stream> {
    let mut streams = IndexMap::new();
    for unit in units.values() {
        let (Some(building), Some((t_in, t_out))) = (&unit.building, unit.stream_temperatures)
        else {
            continue;
        };
        let id: StreamID = format!("{}_stream", unit.id).into();
        streams.insert(
            id.clone(),
            Stream {
                id,
                building: building.clone(),
                unit: unit.id.clone(),
                t_in,
                t_out,
            },
        );
    }
    streams
}
