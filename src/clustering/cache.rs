//! On-disk cache of typical-period files, keyed by the deterministic cluster file ID.
//!
//! Files are regenerated only when the file ID changes; a run with the same location, period
//! count, period duration and attribute set reuses the stored grid.
use super::{Clustering, ClusterOptions, Period, ReducedGrid, cluster_annual_series, cluster_for_k};
use super::FeatureMatrix;
use crate::error::{FailureKind, kind};
use crate::weather::{AnnualSeries, Attribute};
use anyhow::{Context, Result};
use indexmap::IndexMap;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A row of `frequency_<ID>.dat`
#[derive(Debug, Serialize, Deserialize)]
struct FrequencyRow {
    #[serde(rename = "Period")]
    period: usize,
    #[serde(rename = "dp")]
    frequency: f64,
    #[serde(rename = "TimeEnd")]
    time_end: usize,
}

/// A row of `index_<ID>.dat`
#[derive(Debug, Serialize, Deserialize)]
struct IndexRow {
    #[serde(rename = "Hour")]
    hour: usize,
    #[serde(rename = "PeriodOfYear")]
    period_of_year: usize,
    #[serde(rename = "TimeOfYear")]
    time_of_year: usize,
}

/// A row of `timestamp_<ID>.dat`
#[derive(Debug, Serialize, Deserialize)]
struct TimestampRow {
    #[serde(rename = "Period")]
    period: usize,
    #[serde(rename = "Frequency")]
    frequency: f64,
    #[serde(rename = "Weekday")]
    weekday: f64,
}

/// A row of a per-attribute `.dat` file
#[derive(Debug, Serialize, Deserialize)]
struct AttributeRow {
    #[serde(rename = "Period")]
    period: usize,
    #[serde(rename = "Time")]
    time: usize,
    #[serde(rename = "Value")]
    value: f64,
}

fn file_path(dir: &Path, prefix: &str, file_id: &str) -> PathBuf {
    dir.join(format!("{prefix}_{file_id}.dat"))
}

/// Write the typical-period files for a clustering.
pub fn store(dir: &Path, clustering: &Clustering) -> Result<()> {
    let id = &clustering.file_id;
    let grid = &clustering.grid;

    let mut writer = csv::Writer::from_path(file_path(dir, "frequency", id))
        .context(kind(FailureKind::IoError))?;
    for (p, period) in grid.periods.iter().enumerate() {
        writer.serialize(FrequencyRow {
            period: p + 1,
            frequency: period.frequency,
            time_end: period.time_end,
        })?;
    }
    writer.flush()?;

    let mut writer =
        csv::Writer::from_path(file_path(dir, "index", id)).context(kind(FailureKind::IoError))?;
    for (hour, (&p, &t)) in grid
        .period_of_year
        .iter()
        .zip(&grid.time_of_year)
        .enumerate()
    {
        writer.serialize(IndexRow {
            hour: hour + 1,
            period_of_year: p + 1,
            time_of_year: t + 1,
        })?;
    }
    writer.flush()?;

    let mut writer = csv::Writer::from_path(file_path(dir, "timestamp", id))
        .context(kind(FailureKind::IoError))?;
    for (p, period) in grid.periods.iter().enumerate() {
        let weekday = grid
            .attributes
            .contains_key(&Attribute::Weekday)
            .then(|| grid.value(Attribute::Weekday, p, 0))
            .unwrap_or(0.0);
        writer.serialize(TimestampRow {
            period: p + 1,
            frequency: period.frequency,
            weekday,
        })?;
    }
    writer.flush()?;

    for (&attribute, values) in &grid.attributes {
        let mut writer = csv::Writer::from_path(file_path(dir, &attribute.to_string(), id))
            .context(kind(FailureKind::IoError))?;
        let mut index = 0;
        for (p, period) in grid.periods.iter().enumerate() {
            for t in 0..period.time_end {
                writer.serialize(AttributeRow {
                    period: p + 1,
                    time: t + 1,
                    value: values[index],
                })?;
                index += 1;
            }
        }
        writer.flush()?;
    }

    Ok(())
}

/// Load a stored grid by file ID, or `None` when the frequency file is absent.
pub fn load(dir: &Path, file_id: &str, attributes: &[Attribute]) -> Result<Option<ReducedGrid>> {
    let frequency_path = file_path(dir, "frequency", file_id);
    if !frequency_path.is_file() {
        return Ok(None);
    }

    let mut periods = Vec::new();
    for row in csv::Reader::from_path(&frequency_path)?.into_deserialize() {
        let row: FrequencyRow = row?;
        periods.push(Period {
            frequency: row.frequency,
            time_end: row.time_end,
        });
    }

    let mut period_of_year = Vec::new();
    let mut time_of_year = Vec::new();
    for row in csv::Reader::from_path(file_path(dir, "index", file_id))?.into_deserialize() {
        let row: IndexRow = row?;
        period_of_year.push(row.period_of_year - 1);
        time_of_year.push(row.time_of_year - 1);
    }

    let mut attribute_values = IndexMap::new();
    for &attribute in attributes {
        let mut values = Vec::new();
        let path = file_path(dir, &attribute.to_string(), file_id);
        for row in csv::Reader::from_path(&path)?.into_deserialize() {
            let row: AttributeRow = row?;
            values.push(row.value);
        }
        attribute_values.insert(attribute, values);
    }

    Ok(Some(ReducedGrid {
        periods,
        period_of_year,
        time_of_year,
        attributes: attribute_values,
    }))
}

/// Cluster the annual series, reusing stored typical-period files when the file ID matches.
///
/// The cache applies when a single cluster count is requested; the optimal-k walk always
/// recomputes, since its outcome depends on the full candidate set.
pub fn cluster_or_load(
    series: &AnnualSeries,
    options: &ClusterOptions,
    dir: &Path,
) -> Result<Clustering> {
    std::fs::create_dir_all(dir).context(kind(FailureKind::IoError))?;
    if let [k] = options.candidates[..] {
        let file_id = options.file_id(k);
        if let Some(grid) = load(dir, &file_id, &options.attributes)? {
            info!("Reusing typical periods {file_id}");
            return Ok(Clustering {
                file_id,
                k,
                grid,
                quality: IndexMap::new(),
            });
        }

        let matrix = FeatureMatrix::build(series, options)?;
        let clustering = cluster_for_k(series, options, &matrix, k)?;
        store(dir, &clustering)?;
        return Ok(clustering);
    }

    let clustering = cluster_annual_series(series, options)?;
    store(dir, &clustering)?;
    Ok(clustering)
}

#[cfg(test)]
mod tests {
    use super::super::tests::seasonal_series;
    use super::*;
    use rstest::rstest;
    use tempfile::tempdir;

    #[rstest]
    fn test_store_load_roundtrip(seasonal_series: AnnualSeries) {
        let dir = tempdir().unwrap();
        let options = ClusterOptions {
            candidates: vec![4],
            ..ClusterOptions::new("Geneva")
        };
        let clustering = cluster_or_load(&seasonal_series, &options, dir.path()).unwrap();

        let loaded = load(dir.path(), &clustering.file_id, &options.attributes)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.periods, clustering.grid.periods);
        assert_eq!(loaded.period_of_year, clustering.grid.period_of_year);
        assert_eq!(loaded.attributes, clustering.grid.attributes);
    }

    #[rstest]
    fn test_cache_hit_skips_clustering(seasonal_series: AnnualSeries) {
        let dir = tempdir().unwrap();
        let options = ClusterOptions {
            candidates: vec![4],
            ..ClusterOptions::new("Geneva")
        };
        let first = cluster_or_load(&seasonal_series, &options, dir.path()).unwrap();
        let second = cluster_or_load(&seasonal_series, &options, dir.path()).unwrap();
        assert_eq!(first.grid, second.grid);
        // The cached run carries no quality table
        assert!(second.quality.is_empty());
    }

    #[rstest]
    fn test_missing_cache_returns_none() {
        let dir = tempdir().unwrap();
        assert!(
            load(dir.path(), "Nowhere_4_24_TIWE", &Attribute::ALL)
                .unwrap()
                .is_none()
        );
    }
}
