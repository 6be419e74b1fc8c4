//! Quality metrics comparing an annual series with its clustered reconstruction.
use serde::Serialize;

/// Reconstruction quality of one attribute for one cluster count
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeQuality {
    /// Load-duration-curve absolute error normalized by the series sum
    pub ldc_error: f64,
    /// Mean absolute error
    pub mae: f64,
    /// Root-mean-square deviation
    pub rmsd: f64,
    /// Mean absolute percentage error, in percent
    pub mape: f64,
}

/// Compute all metrics for one attribute.
///
/// `original` and `reconstructed` must have equal length.
pub fn attribute_quality(original: &[f64], reconstructed: &[f64]) -> AttributeQuality {
    assert_eq!(original.len(), reconstructed.len());
    AttributeQuality {
        ldc_error: ldc_error(original, reconstructed),
        mae: mae(original, reconstructed),
        rmsd: rmsd(original, reconstructed),
        mape: mape(original, reconstructed),
    }
}

/// Load-duration-curve error: absolute difference of the descending-sorted series, normalized by
/// the sum of the original.
pub fn ldc_error(original: &[f64], reconstructed: &[f64]) -> f64 {
    let mut original_sorted = original.to_vec();
    let mut reconstructed_sorted = reconstructed.to_vec();
    original_sorted.sort_by(|a, b| b.total_cmp(a));
    reconstructed_sorted.sort_by(|a, b| b.total_cmp(a));

    let total: f64 = original.iter().map(|v| v.abs()).sum();
    let error: f64 = original_sorted
        .iter()
        .zip(&reconstructed_sorted)
        .map(|(o, r)| (o - r).abs())
        .sum();
    if total == 0.0 { 0.0 } else { error / total }
}

/// Mean absolute error
pub fn mae(original: &[f64], reconstructed: &[f64]) -> f64 {
    let sum: f64 = original
        .iter()
        .zip(reconstructed)
        .map(|(o, r)| (o - r).abs())
        .sum();
    sum / original.len() as f64
}

/// Root-mean-square deviation
pub fn rmsd(original: &[f64], reconstructed: &[f64]) -> f64 {
    let sum: f64 = original
        .iter()
        .zip(reconstructed)
        .map(|(o, r)| (o - r) * (o - r))
        .sum();
    (sum / original.len() as f64).sqrt()
}

/// Mean absolute percentage error in percent, over the hours where the original is nonzero.
///
/// An all-zero attribute yields 0, so a degenerate column never blocks the optimal-k walk.
pub fn mape(original: &[f64], reconstructed: &[f64]) -> f64 {
    let mut total = 0.0;
    let mut count = 0_usize;
    for (o, r) in original.iter().zip(reconstructed) {
        if *o != 0.0 {
            total += ((o - r) / o).abs();
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        100.0 * total / count as f64
    }
}
