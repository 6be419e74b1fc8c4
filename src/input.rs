//! Common routines for handling input data.
use crate::id::{HasID, IDLike};
use anyhow::{Context, Result, ensure};
use indexmap::IndexMap;
use serde::de::{Deserialize, DeserializeOwned, Deserializer};
use std::fs;
use std::path::Path;

/// Read a series of type `T`s from a CSV file into a `Vec<T>`.
///
/// # Arguments
///
/// * `csv_file_path`: Path to the CSV file
pub fn read_vec_from_csv<T: DeserializeOwned>(csv_file_path: &Path) -> Result<Vec<T>> {
    let reader = csv::Reader::from_path(csv_file_path)
        .with_context(|| format!("Could not open {}", csv_file_path.display()))?;
    let vec: Vec<T> = reader
        .into_deserialize()
        .collect::<Result<_, _>>()
        .with_context(|| format!("Error reading {}", csv_file_path.display()))?;
    ensure!(
        !vec.is_empty(),
        "CSV file {} cannot be empty",
        csv_file_path.display()
    );

    Ok(vec)
}

/// Read a CSV file of records with an ID field into an ordered map keyed by that ID.
///
/// Duplicate IDs are an error.
pub fn read_csv_id_file<T, ID>(csv_file_path: &Path) -> Result<IndexMap<ID, T>>
where
    T: DeserializeOwned + HasID<ID>,
    ID: IDLike,
{
    let mut map = IndexMap::new();
    for record in read_vec_from_csv::<T>(csv_file_path)? {
        let id = record.get_id().clone();
        ensure!(
            map.insert(id.clone(), record).is_none(),
            "Duplicate ID {id} in {}",
            csv_file_path.display()
        );
    }

    Ok(map)
}

/// Parse a TOML file at the specified path.
pub fn read_toml<T: DeserializeOwned>(file_path: &Path) -> Result<T> {
    let toml_str = fs::read_to_string(file_path)
        .with_context(|| format!("Could not read {}", file_path.display()))?;
    toml::from_str(&toml_str).with_context(|| format!("Could not parse {}", file_path.display()))
}

/// Read an f64, checking that it is between 0 and 1
pub fn deserialise_proportion<'de, D>(deserialiser: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value: f64 = Deserialize::deserialize(deserialiser)?;
    if !(0.0..=1.0).contains(&value) {
        Err(serde::de::Error::custom("Value is not between 0 and 1"))?;
    }

    Ok(value)
}
