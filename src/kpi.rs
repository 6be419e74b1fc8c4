//! Summary indicators computed on a finished district solution.
use crate::decomposition::DwOutcome;
use crate::infrastructure::LayerID;
use crate::subproblem::Campaign;
use indexmap::IndexMap;
use serde::Serialize;

/// One key performance indicator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KpiRow {
    /// Indicator name
    pub name: String,
    /// The layer the indicator refers to, empty for district-wide ones
    #[serde(serialize_with = "serialize_layer")]
    pub layer: Option<LayerID>,
    /// Indicator value
    pub value: f64,
}

fn serialize_layer<S: serde::Serializer>(
    layer: &Option<LayerID>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match layer {
        Some(layer) => serializer.serialize_str(layer.as_str()),
        None => serializer.serialize_str(""),
    }
}

/// Annualized exchange totals of one layer, in kWh/y
#[derive(Debug, Default, Clone, Copy)]
struct LayerTotals {
    production: f64,
    consumption: f64,
    import: f64,
    export: f64,
}

/// Compute the indicator table for one outcome.
///
/// Levelized cost relates total expenditure to the delivered end-use energy; self-consumption
/// and self-sufficiency relate local production to grid exchange per shared layer.
pub fn compute(campaign: &Campaign, outcome: &DwOutcome) -> Vec<KpiRow> {
    let objectives = outcome.total_objectives();
    let weights = step_weights(campaign);

    // Annual end-use demand over every building and layer
    let demand_kwh: f64 = campaign
        .profiles
        .demands
        .values()
        .map(|series| annualize(series, &weights))
        .sum();

    let mut rows = vec![
        KpiRow {
            name: "TOTEX".into(),
            layer: None,
            value: objectives.totex(),
        },
        KpiRow {
            name: "GWP_total".into(),
            layer: None,
            value: objectives.gwp(),
        },
    ];
    if demand_kwh > 0.0 {
        rows.push(KpiRow {
            name: "LCOE".into(),
            layer: None,
            value: objectives.totex() / (demand_kwh / 1000.0),
        });
    }

    for (layer, totals) in layer_totals(campaign, outcome, &weights) {
        if totals.production > 0.0 {
            rows.push(KpiRow {
                name: "SelfConsumption".into(),
                layer: Some(layer.clone()),
                value: (1.0 - totals.export / totals.production).clamp(0.0, 1.0),
            });
        }
        if totals.consumption > 0.0 {
            rows.push(KpiRow {
                name: "SelfSufficiency".into(),
                layer: Some(layer),
                value: (1.0 - totals.import / totals.consumption).clamp(0.0, 1.0),
            });
        }
    }

    rows
}

/// Annual hours represented by each concatenated timestep
pub(crate) fn step_weights(campaign: &Campaign) -> Vec<f64> {
    campaign
        .grid
        .periods
        .iter()
        .flat_map(|period| std::iter::repeat_n(period.frequency, period.time_end))
        .collect()
}

/// Frequency-weighted annual total of one timestep series
pub(crate) fn annualize(series: &[f64], weights: &[f64]) -> f64 {
    series
        .iter()
        .zip(weights)
        .map(|(value, weight)| value * weight)
        .sum()
}

/// Per-layer production, consumption and network exchange, annualized
fn layer_totals(
    campaign: &Campaign,
    outcome: &DwOutcome,
    weights: &[f64],
) -> IndexMap<LayerID, LayerTotals> {
    let mut totals: IndexMap<LayerID, LayerTotals> = campaign
        .catalog
        .layers
        .keys()
        .map(|layer| (layer.clone(), LayerTotals::default()))
        .collect();

    let mut tally_flows = |flows: &IndexMap<(crate::infrastructure::UnitID, LayerID), Vec<f64>>| {
        for ((_, layer), series) in flows {
            let entry = &mut totals[layer];
            for (&flow, &weight) in series.iter().zip(weights) {
                if flow > 0.0 {
                    entry.production += flow * weight;
                } else {
                    entry.consumption -= flow * weight;
                }
            }
        }
    };
    for solution in outcome.selected_solutions().values() {
        tally_flows(&solution.unit_flows);
    }
    tally_flows(&outcome.master.district.unit_flows);

    // End-use demand also counts as consumption
    for ((_, layer), series) in &campaign.profiles.demands {
        if let Some(entry) = totals.get_mut(layer) {
            entry.consumption += annualize(series, weights);
        }
    }

    let district = &outcome.master.district;
    for (layer, entry) in &mut totals {
        if let Some(series) = district.imports.get(layer) {
            entry.import = annualize(series, weights);
        }
        if let Some(series) = district.exports.get(layer) {
            entry.export = annualize(series, weights);
        }
    }

    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn test_annualize() {
        let weights = [200.0, 165.0];
        assert_approx_eq!(f64, annualize(&[2.0, 4.0], &weights), 1060.0);
        assert_approx_eq!(f64, annualize(&[], &weights), 0.0);
    }
}
