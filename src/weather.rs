//! Reading and validating the annual meteorological series.
//!
//! The core only requires an 8760-row table with external temperature, global horizontal
//! irradiance, a weekday indicator and grid carbon intensity; where those values come from
//! (CSV file or an external service) is a data-provider concern.
use crate::input::read_vec_from_csv;
use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::path::Path;
use strum::{Display, EnumString};

/// The number of hours in the nominal year
pub const HOURS_PER_YEAR: usize = 8760;

/// An attribute of the annual series, identified by a single-letter code in cluster file IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString)]
pub enum Attribute {
    /// External temperature (code T)
    #[strum(serialize = "T")]
    Temperature,
    /// Global horizontal irradiance (code I)
    #[strum(serialize = "I")]
    Irradiance,
    /// Weekday indicator (code W)
    #[strum(serialize = "W")]
    Weekday,
    /// Grid carbon intensity (code E)
    #[strum(serialize = "E")]
    Emissions,
}

impl Attribute {
    /// All attributes in the fixed file-ID order
    pub const ALL: [Attribute; 4] = [
        Attribute::Temperature,
        Attribute::Irradiance,
        Attribute::Weekday,
        Attribute::Emissions,
    ];
}

/// One hour of the annual meteorological series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    /// External temperature in degrees Celsius
    #[serde(rename = "Text")]
    pub temperature: f64,
    /// Global horizontal irradiance in W/m2
    #[serde(rename = "Irr")]
    pub irradiance: f64,
    /// 1.0 on weekdays, 0.0 on weekends
    #[serde(rename = "Weekday")]
    pub weekday: f64,
    /// Grid carbon intensity in kgCO2/kWh
    #[serde(rename = "Emissions")]
    pub emissions: f64,
}

/// The full annual series, column per attribute
#[derive(Debug, Clone, PartialEq)]
pub struct AnnualSeries {
    /// The records, one per hour of the year
    pub records: Vec<WeatherRecord>,
}

impl AnnualSeries {
    /// Read the series from a CSV file, checking its length.
    pub fn from_path(file_path: &Path) -> Result<Self> {
        let records: Vec<WeatherRecord> =
            read_vec_from_csv(file_path).context("Failed to read weather file")?;
        Self::new(records)
    }

    /// Wrap a record vector, checking its length.
    pub fn new(records: Vec<WeatherRecord>) -> Result<Self> {
        ensure!(
            records.len() == HOURS_PER_YEAR,
            "Weather table must have {HOURS_PER_YEAR} rows, found {}",
            records.len()
        );
        Ok(Self { records })
    }

    /// The column for one attribute
    pub fn column(&self, attribute: Attribute) -> Vec<f64> {
        self.records
            .iter()
            .map(|record| match attribute {
                Attribute::Temperature => record.temperature,
                Attribute::Irradiance => record.irradiance,
                Attribute::Weekday => record.weekday,
                Attribute::Emissions => record.emissions,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant_series(temperature: f64) -> AnnualSeries {
        let record = WeatherRecord {
            temperature,
            irradiance: 100.0,
            weekday: 1.0,
            emissions: 0.1,
        };
        AnnualSeries::new(vec![record; HOURS_PER_YEAR]).unwrap()
    }

    #[test]
    fn test_wrong_length_rejected() {
        let record = WeatherRecord {
            temperature: 10.0,
            irradiance: 0.0,
            weekday: 1.0,
            emissions: 0.1,
        };
        assert!(AnnualSeries::new(vec![record; 100]).is_err());
    }

    #[test]
    fn test_column_extraction() {
        let series = constant_series(12.5);
        let column = series.column(Attribute::Temperature);
        assert_eq!(column.len(), HOURS_PER_YEAR);
        assert_eq!(column[0], 12.5);
    }

    #[test]
    fn test_attribute_codes() {
        let codes: String = Attribute::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(codes, "TIWE");
    }
}
