//! Typical-period clustering: reduce the annual hourly series to a few representative periods
//! plus explicit extreme periods, with a total mapping from annual hours back to the reduced grid.
use crate::error::{FailureKind, kind};
use crate::weather::{AnnualSeries, Attribute};
use anyhow::{Context, Result, ensure};
use indexmap::IndexMap;
use itertools::Itertools;
use log::{debug, info};

pub mod cache;
pub mod kmedoids;
pub mod metrics;

use kmedoids::{Medoids, k_medoids};
use metrics::{AttributeQuality, attribute_quality};

/// Safety margin applied to the designated attribute of the extreme singletons
const EXTREME_MARGIN: f64 = 1.1;

/// Stopping rule of the optimal-k walk: improvement in MAPE below this many percentage points on
/// every attribute means the smaller k is good enough
const MAPE_IMPROVEMENT_THRESHOLD: f64 = 1.0;

/// How typical periods are selected
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterOptions {
    /// Location label, used in the cluster file ID
    pub location: String,
    /// Length of a standard period in hours (typically 24)
    pub period_length: usize,
    /// Candidate cluster counts, walked in increasing order
    pub candidates: Vec<usize>,
    /// The attributes to cluster on, in the fixed file-ID order
    pub attributes: Vec<Attribute>,
    /// The attribute whose minimum designates the cold extreme
    pub cold_attribute: Attribute,
    /// The attribute whose maximum designates the hot extreme
    pub hot_attribute: Attribute,
    /// Optional outlier handling
    pub outliers: Option<OutlierSpec>,
}

impl ClusterOptions {
    /// Default options for the given location
    pub fn new(location: &str) -> Self {
        Self {
            location: location.to_string(),
            period_length: 24,
            candidates: vec![2, 4, 6, 8, 10, 12, 14, 16],
            attributes: Attribute::ALL.to_vec(),
            cold_attribute: Attribute::Temperature,
            hot_attribute: Attribute::Temperature,
            outliers: None,
        }
    }

    /// The deterministic file ID for this option set and cluster count.
    ///
    /// Composition: `Location_Periods_PeriodDuration_<attrs>` with single-letter attribute codes
    /// in fixed order. This string keys the on-disk cache of typical-period files.
    pub fn file_id(&self, k: usize) -> String {
        let codes: String = Attribute::ALL
            .iter()
            .filter(|attribute| self.attributes.contains(attribute))
            .map(ToString::to_string)
            .collect();
        format!("{}_{}_{}_{}", self.location, k, self.period_length, codes)
    }
}

/// Which days count as outliers
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutlierSpec {
    /// The given number of days farthest from their medoid
    Count(usize),
    /// Every day farther from its medoid than the given squared distance
    MaxDistance(f64),
}

/// One period of the reduced time grid
#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    /// The number of days (or, for extreme singletons, hours) this period represents
    pub frequency: f64,
    /// The number of timesteps in this period
    pub time_end: usize,
}

/// The reduced time grid: periods, the annual-hour mapping and the per-period attribute values.
///
/// Attribute vectors are the concatenation of the per-period vectors in period order, with the
/// two extreme singletons at the end. `period_of_year` and `time_of_year` are total on the annual
/// hours and use zero-based indices; the persisted files are one-based.
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedGrid {
    /// The periods, extremes last
    pub periods: Vec<Period>,
    /// Annual hour to period index
    pub period_of_year: Vec<usize>,
    /// Annual hour to timestep within its period
    pub time_of_year: Vec<usize>,
    /// Concatenated per-period attribute values
    pub attributes: IndexMap<Attribute, Vec<f64>>,
}

impl ReducedGrid {
    /// The number of periods, extremes included
    pub fn n_periods(&self) -> usize {
        self.periods.len()
    }

    /// The offset of period `p` into the concatenated attribute vectors
    pub fn offset(&self, p: usize) -> usize {
        self.periods[..p].iter().map(|period| period.time_end).sum()
    }

    /// The value of `attribute` at period `p`, timestep `t`
    pub fn value(&self, attribute: Attribute, p: usize, t: usize) -> f64 {
        self.attributes[&attribute][self.offset(p) + t]
    }

    /// Iterate over all (period, timestep) pairs in order
    pub fn iter_timesteps(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.periods
            .iter()
            .enumerate()
            .flat_map(|(p, period)| (0..period.time_end).map(move |t| (p, t)))
    }

    /// The annual weight of (period, timestep): the period frequency
    pub fn weight(&self, p: usize) -> f64 {
        self.periods[p].frequency
    }

    /// Total hours represented: sum of frequency times length over all periods
    pub fn total_hours(&self) -> f64 {
        self.periods
            .iter()
            .map(|period| period.frequency * period.time_end as f64)
            .sum()
    }

    /// Reconstruct the annual series of one attribute through the hour mapping
    pub fn reconstruct(&self, attribute: Attribute) -> Vec<f64> {
        self.period_of_year
            .iter()
            .zip(&self.time_of_year)
            .map(|(&p, &t)| self.value(attribute, p, t))
            .collect()
    }
}

/// The outcome of the clustering step
#[derive(Debug, Clone, PartialEq)]
pub struct Clustering {
    /// The file ID keying the on-disk cache
    pub file_id: String,
    /// The selected cluster count
    pub k: usize,
    /// The reduced time grid
    pub grid: ReducedGrid,
    /// Reconstruction quality per attribute at the selected k
    pub quality: IndexMap<Attribute, AttributeQuality>,
}

/// Cluster the annual series, selecting the cluster count by the MAPE stopping rule.
pub fn cluster_annual_series(
    series: &AnnualSeries,
    options: &ClusterOptions,
) -> Result<Clustering> {
    let candidates = options.candidates.iter().copied().sorted().collect_vec();
    ensure!(!candidates.is_empty(), "No candidate cluster counts given");

    let matrix = FeatureMatrix::build(series, options)?;

    // Quality of every candidate, walked in increasing order
    let mut runs = Vec::with_capacity(candidates.len());
    for &k in &candidates {
        let clustering = cluster_for_k(series, options, &matrix, k)?;
        debug!(
            "k = {k}: MAPE per attribute {:?}",
            clustering
                .quality
                .iter()
                .map(|(attribute, quality)| (attribute.to_string(), quality.mape))
                .collect_vec()
        );
        runs.push(clustering);
    }

    // Smallest k whose refinement no longer pays: going to the next candidate improves MAPE by
    // less than the threshold on every attribute
    let selected = runs
        .iter()
        .tuple_windows()
        .position(|(current, next)| {
            current.quality.iter().all(|(attribute, quality)| {
                quality.mape - next.quality[attribute].mape < MAPE_IMPROVEMENT_THRESHOLD
            })
        })
        .unwrap_or(runs.len() - 1);

    let clustering = runs.swap_remove(selected);
    info!(
        "Selected {} typical periods (file ID {})",
        clustering.k, clustering.file_id
    );
    Ok(clustering)
}

/// Cluster the annual series for one fixed cluster count.
pub fn cluster_for_k(
    series: &AnnualSeries,
    options: &ClusterOptions,
    matrix: &FeatureMatrix,
    k: usize,
) -> Result<Clustering> {
    let result = k_medoids(&matrix.rows, k).context(kind(FailureKind::BadClusterCount))?;

    // Optional outlier removal: drop the farthest days, re-cluster, re-attach them as singletons
    let (result, outliers) = match options.outliers {
        None => (result, Vec::new()),
        Some(spec) => remove_outliers(matrix, k, &result, spec)?,
    };

    let grid = build_grid(series, options, matrix, &result, &outliers);

    let quality = options
        .attributes
        .iter()
        .map(|&attribute| {
            let original = series.column(attribute);
            let reconstructed = grid.reconstruct(attribute);
            (attribute, attribute_quality(&original, &reconstructed))
        })
        .collect();

    Ok(Clustering {
        file_id: options.file_id(k),
        k,
        grid,
        quality,
    })
}

/// The normalized daily feature matrix
pub struct FeatureMatrix {
    /// One row per candidate day: per-attribute normalized hours, concatenated
    pub rows: Vec<Vec<f64>>,
    /// Number of whole days folded from the year
    pub n_days: usize,
    /// Annual hours not covered by a whole day, kept aside as a residual period
    pub tail_hours: usize,
}

impl FeatureMatrix {
    /// Fold the year into days of normalized attribute values.
    pub fn build(series: &AnnualSeries, options: &ClusterOptions) -> Result<Self> {
        let period_length = options.period_length;
        ensure!(period_length >= 1, "Period length must be at least 1");
        let n_hours = series.records.len();
        let n_days = n_hours / period_length;
        let tail_hours = n_hours % period_length;

        let mut normalized = Vec::with_capacity(options.attributes.len());
        let mut all_constant = true;
        for &attribute in &options.attributes {
            let column = series.column(attribute);
            let (normalized_column, constant) = normalize(&column);
            all_constant &= constant;
            normalized.push(normalized_column);
        }
        // A single constant column is kept at zero; a fully constant matrix has no structure left
        if all_constant {
            return Err(anyhow::anyhow!("Every attribute column is constant")
                .context(kind(FailureKind::ClusteringDegenerate)));
        }

        let rows = (0..n_days)
            .map(|day| {
                let start = day * period_length;
                normalized
                    .iter()
                    .flat_map(|column| column[start..start + period_length].iter().copied())
                    .collect()
            })
            .collect();

        Ok(Self {
            rows,
            n_days,
            tail_hours,
        })
    }
}

/// Normalize a column to [0, 1]; a constant column is left at zero.
///
/// Returns the normalized column and whether it was constant.
fn normalize(column: &[f64]) -> (Vec<f64>, bool) {
    let min = column.iter().copied().fold(f64::INFINITY, f64::min);
    let max = column.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == min {
        return (vec![0.0; column.len()], true);
    }
    let normalized = column.iter().map(|v| (v - min) / (max - min)).collect();
    (normalized, false)
}

/// Identify and strip outlier days, re-cluster, and report the removed day indices.
fn remove_outliers(
    matrix: &FeatureMatrix,
    k: usize,
    result: &Medoids,
    spec: OutlierSpec,
) -> Result<(Medoids, Vec<usize>)> {
    let distances = result.distances_to_medoid(&matrix.rows);
    let outliers: Vec<usize> = match spec {
        OutlierSpec::Count(count) => distances
            .iter()
            .enumerate()
            .sorted_by(|a, b| b.1.total_cmp(a.1))
            .take(count)
            .map(|(day, _)| day)
            .sorted_unstable()
            .collect(),
        OutlierSpec::MaxDistance(threshold) => distances
            .iter()
            .enumerate()
            .filter(|&(_, &distance)| distance > threshold)
            .map(|(day, _)| day)
            .collect(),
    };
    if outliers.is_empty() {
        return Ok((result.clone(), outliers));
    }

    let kept_rows: Vec<Vec<f64>> = matrix
        .rows
        .iter()
        .enumerate()
        .filter(|(day, _)| !outliers.contains(day))
        .map(|(_, row)| row.clone())
        .collect();
    let reduced = k_medoids(&kept_rows, k).context(kind(FailureKind::BadClusterCount))?;

    // Medoid/assignment indices refer to the reduced matrix; translate back to day indices
    let kept_days: Vec<usize> = (0..matrix.n_days)
        .filter(|day| !outliers.contains(day))
        .collect();
    let medoids = reduced
        .medoids
        .iter()
        .map(|&row| kept_days[row])
        .collect_vec();
    let mut assignment = vec![usize::MAX; matrix.n_days];
    for (row, &cluster) in reduced.assignment.iter().enumerate() {
        assignment[kept_days[row]] = cluster;
    }
    // Outlier days become their own singleton clusters, appended after the k regular ones
    for (position, &day) in outliers.iter().enumerate() {
        assignment[day] = k + position;
    }

    Ok((
        Medoids {
            medoids,
            assignment,
        },
        outliers,
    ))
}

/// Assemble the reduced grid: cluster periods, outlier singletons, the residual tail period and
/// the two extreme singletons.
fn build_grid(
    series: &AnnualSeries,
    options: &ClusterOptions,
    matrix: &FeatureMatrix,
    result: &Medoids,
    outliers: &[usize],
) -> ReducedGrid {
    let period_length = options.period_length;
    let n_hours = series.records.len();
    let representative_days: Vec<usize> = result
        .medoids
        .iter()
        .copied()
        .chain(outliers.iter().copied())
        .collect();

    let mut sizes = vec![0_usize; representative_days.len()];
    for &cluster in &result.assignment {
        sizes[cluster] += 1;
    }

    let mut periods: Vec<Period> = sizes
        .iter()
        .map(|&size| Period {
            frequency: size as f64,
            time_end: period_length,
        })
        .collect();

    // Residual period for tail hours not divisible by the period length
    let residual_period = (matrix.tail_hours > 0).then(|| {
        periods.push(Period {
            frequency: 1.0,
            time_end: matrix.tail_hours,
        });
        periods.len() - 1
    });

    // Extreme singletons: the hours realizing the cold minimum and hot maximum
    let cold_column = series.column(options.cold_attribute);
    let hot_column = series.column(options.hot_attribute);
    let cold_hour = position_of_min(&cold_column);
    let hot_hour = position_of_max(&hot_column);
    let cold_period = periods.len();
    let hot_period = periods.len() + 1;
    periods.push(Period {
        frequency: 1.0,
        time_end: 1,
    });
    periods.push(Period {
        frequency: 1.0,
        time_end: 1,
    });

    // Attribute vectors: representative days, then the tail, then the two extremes
    let mut attributes = IndexMap::new();
    for &attribute in &options.attributes {
        let column = series.column(attribute);
        let mut values = Vec::new();
        for &day in &representative_days {
            let start = day * period_length;
            values.extend_from_slice(&column[start..start + period_length]);
        }
        if matrix.tail_hours > 0 {
            values.extend_from_slice(&column[matrix.n_days * period_length..]);
        }

        // Extremes carry the observed worst hour with a safety margin on the designated attribute
        let cold_value = if attribute == options.cold_attribute {
            column[cold_hour] * EXTREME_MARGIN
        } else {
            column[cold_hour]
        };
        let hot_value = if attribute == options.hot_attribute {
            column[hot_hour] * EXTREME_MARGIN
        } else {
            column[hot_hour]
        };
        values.push(cold_value);
        values.push(hot_value);

        attributes.insert(attribute, values);
    }

    // Total hour mapping: day hours to their cluster period, tail to the residual period, and the
    // two extreme hours to their singletons
    let mut period_of_year = Vec::with_capacity(n_hours);
    let mut time_of_year = Vec::with_capacity(n_hours);
    for hour in 0..n_hours {
        let day = hour / period_length;
        if day < matrix.n_days {
            period_of_year.push(result.assignment[day]);
            time_of_year.push(hour % period_length);
        } else {
            period_of_year.push(residual_period.expect("Tail hours imply a residual period"));
            time_of_year.push(hour - matrix.n_days * period_length);
        }
    }
    period_of_year[cold_hour] = cold_period;
    time_of_year[cold_hour] = 0;
    period_of_year[hot_hour] = hot_period;
    time_of_year[hot_hour] = 0;

    ReducedGrid {
        periods,
        period_of_year,
        time_of_year,
        attributes,
    }
}

fn position_of_min(column: &[f64]) -> usize {
    column
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .expect("Non-empty column")
        .0
}

fn position_of_max(column: &[f64]) -> usize {
    column
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .expect("Non-empty column")
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weather::{HOURS_PER_YEAR, WeatherRecord};
    use float_cmp::assert_approx_eq;
    use rstest::{fixture, rstest};

    /// A year with a sinusoidal temperature and alternating weekday flag
    #[fixture]
    pub fn seasonal_series() -> AnnualSeries {
        let records = (0..HOURS_PER_YEAR)
            .map(|hour| {
                let day = hour / 24;
                let seasonal = -10.0 * (2.0 * std::f64::consts::PI * day as f64 / 365.0).cos();
                let diurnal = 5.0 * (2.0 * std::f64::consts::PI * (hour % 24) as f64 / 24.0).sin();
                WeatherRecord {
                    temperature: 10.0 + seasonal + diurnal,
                    irradiance: (500.0 * diurnal / 5.0).max(0.0),
                    weekday: if day % 7 < 5 { 1.0 } else { 0.0 },
                    emissions: 0.1,
                }
            })
            .collect();
        AnnualSeries::new(records).unwrap()
    }

    #[fixture]
    fn options() -> ClusterOptions {
        ClusterOptions {
            candidates: vec![2, 4],
            ..ClusterOptions::new("Geneva")
        }
    }

    #[rstest]
    fn test_file_id(options: ClusterOptions) {
        assert_eq!(options.file_id(10), "Geneva_10_24_TIWE");
    }

    #[rstest]
    fn test_grid_invariants(seasonal_series: AnnualSeries, options: ClusterOptions) {
        let clustering = cluster_annual_series(&seasonal_series, &options).unwrap();
        let grid = &clustering.grid;

        // The mapping is total on [0, 8760)
        assert_eq!(grid.period_of_year.len(), HOURS_PER_YEAR);
        assert_eq!(grid.time_of_year.len(), HOURS_PER_YEAR);
        for (&p, &t) in grid.period_of_year.iter().zip(&grid.time_of_year) {
            assert!(p < grid.n_periods());
            assert!(t < grid.periods[p].time_end);
        }

        // Frequencies sum to the number of days; total hours are the year plus the two singleton
        // sizing hours
        assert_approx_eq!(f64, grid.total_hours(), (HOURS_PER_YEAR + 2) as f64);

        // Extreme periods are singletons at the end
        for period in &grid.periods[grid.n_periods() - 2..] {
            assert_approx_eq!(f64, period.frequency, 1.0);
            assert_eq!(period.time_end, 1);
        }
    }

    #[rstest]
    fn test_extreme_margin(seasonal_series: AnnualSeries, options: ClusterOptions) {
        let clustering = cluster_annual_series(&seasonal_series, &options).unwrap();
        let grid = &clustering.grid;
        let column = seasonal_series.column(Attribute::Temperature);
        let observed_min = column.iter().copied().fold(f64::INFINITY, f64::min);
        let observed_max = column.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let cold_period = grid.n_periods() - 2;
        let hot_period = grid.n_periods() - 1;
        assert_approx_eq!(
            f64,
            grid.value(Attribute::Temperature, cold_period, 0),
            observed_min * EXTREME_MARGIN
        );
        assert_approx_eq!(
            f64,
            grid.value(Attribute::Temperature, hot_period, 0),
            observed_max * EXTREME_MARGIN
        );
    }

    #[rstest]
    fn test_constant_attribute_kept_at_zero(options: ClusterOptions) {
        // All-constant emissions must not block clustering
        let records = (0..HOURS_PER_YEAR)
            .map(|hour| WeatherRecord {
                temperature: (hour % 24) as f64,
                irradiance: 0.0,
                weekday: 1.0,
                emissions: 0.0,
            })
            .collect();
        let series = AnnualSeries::new(records).unwrap();

        let clustering = cluster_annual_series(&series, &options).unwrap();
        // Identical days: no MAPE improvement from more clusters, so the walk stops at min(K)
        assert_eq!(clustering.k, 2);
    }

    #[rstest]
    fn test_fully_constant_series_degenerate(options: ClusterOptions) {
        let records = vec![
            WeatherRecord {
                temperature: 1.0,
                irradiance: 2.0,
                weekday: 1.0,
                emissions: 0.1,
            };
            HOURS_PER_YEAR
        ];
        let series = AnnualSeries::new(records).unwrap();
        let err = cluster_annual_series(&series, &options).unwrap_err();
        assert_eq!(
            crate::error::failure_kind(&err),
            Some(FailureKind::ClusteringDegenerate)
        );
    }

    #[rstest]
    fn test_bad_cluster_count(seasonal_series: AnnualSeries, mut options: ClusterOptions) {
        options.candidates = vec![1000];
        let err = cluster_annual_series(&seasonal_series, &options).unwrap_err();
        assert_eq!(
            crate::error::failure_kind(&err),
            Some(FailureKind::BadClusterCount)
        );
    }

    #[rstest]
    fn test_outlier_singletons(seasonal_series: AnnualSeries, mut options: ClusterOptions) {
        options.candidates = vec![4];
        options.outliers = Some(OutlierSpec::Count(3));
        let clustering = cluster_annual_series(&seasonal_series, &options).unwrap();

        // 4 clusters + 3 outlier singletons + 2 extremes
        assert_eq!(clustering.grid.n_periods(), 9);
        for period in &clustering.grid.periods[4..7] {
            assert_approx_eq!(f64, period.frequency, 1.0);
            assert_eq!(period.time_end, 24);
        }
    }

    #[rstest]
    fn test_reconstruction_quality(seasonal_series: AnnualSeries, options: ClusterOptions) {
        let clustering = cluster_annual_series(&seasonal_series, &options).unwrap();
        // The seasonal signal is smooth; a handful of typical days reconstructs it closely
        let quality = &clustering.quality[&Attribute::Temperature];
        assert!(quality.mape < 50.0);
        assert!(quality.ldc_error < 0.5);
    }
}
