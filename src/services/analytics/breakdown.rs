use std::collections::BTreeMap;

use serde::Serialize;

use super::metrics::stable_sum;
use super::record::{coerce_numeric, AnalyticsRecord, MetricField};

pub const UNASSIGNED_CATEGORY: &str = "Unassigned";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaintenanceBreakdownEntry {
    pub category: String,
    pub amount: f64,
    pub percentage: i64,
}

/// Maintenance spend per property with each property's share of the total.
///
/// Shares are rounded to whole percents one category at a time, so they do
/// not always add up to 100 (three equal categories give 33 each). Entries
/// come back in category order.
pub fn compute_maintenance_breakdown(records: &[AnalyticsRecord]) -> Vec<MaintenanceBreakdownEntry> {
    let mut amounts: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for record in records {
        let category = record.category().unwrap_or(UNASSIGNED_CATEGORY);
        amounts
            .entry(category)
            .or_default()
            .push(coerce_numeric(record.value(MetricField::MaintenanceCosts), 0.0));
    }

    let totals = amounts
        .into_iter()
        .map(|(category, mut values)| (category, stable_sum(&mut values)))
        .collect::<Vec<_>>();
    let mut grand = totals.iter().map(|(_, amount)| *amount).collect::<Vec<_>>();
    let grand_total = stable_sum(&mut grand);

    totals
        .into_iter()
        .map(|(category, amount)| MaintenanceBreakdownEntry {
            category: category.to_string(),
            amount,
            percentage: share_percent(amount, grand_total),
        })
        .collect()
}

fn share_percent(amount: f64, grand_total: f64) -> i64 {
    if grand_total <= 0.0 {
        return 0;
    }
    (amount / grand_total * 100.0).round() as i64
}
