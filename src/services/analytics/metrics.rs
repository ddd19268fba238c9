use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use super::period::{PeriodKey, TimeFrame};
use super::record::{coerce_numeric, Aggregation, AnalyticsRecord, MetricField};

/// Placeholder shown when no comparison dataset exists.
pub const NO_CHANGE: &str = "n/a";

/// Aggregated value of every metric field.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricValues {
    pub gross_income: f64,
    pub total_expenses: f64,
    pub net_profit: f64,
    pub maintenance_costs: f64,
    pub occupancy_rate: f64,
    pub tenant_satisfaction: f64,
    pub yield_rate: f64,
    pub vacancy_rate: f64,
    pub property_value: f64,
    pub avg_tenancy_length: f64,
}

impl MetricValues {
    pub fn get(&self, field: MetricField) -> f64 {
        match field {
            MetricField::GrossIncome => self.gross_income,
            MetricField::TotalExpenses => self.total_expenses,
            MetricField::NetProfit => self.net_profit,
            MetricField::MaintenanceCosts => self.maintenance_costs,
            MetricField::OccupancyRate => self.occupancy_rate,
            MetricField::TenantSatisfaction => self.tenant_satisfaction,
            MetricField::YieldRate => self.yield_rate,
            MetricField::VacancyRate => self.vacancy_rate,
            MetricField::PropertyValue => self.property_value,
            MetricField::AvgTenancyLength => self.avg_tenancy_length,
        }
    }

    fn slot(&mut self, field: MetricField) -> &mut f64 {
        match field {
            MetricField::GrossIncome => &mut self.gross_income,
            MetricField::TotalExpenses => &mut self.total_expenses,
            MetricField::NetProfit => &mut self.net_profit,
            MetricField::MaintenanceCosts => &mut self.maintenance_costs,
            MetricField::OccupancyRate => &mut self.occupancy_rate,
            MetricField::TenantSatisfaction => &mut self.tenant_satisfaction,
            MetricField::YieldRate => &mut self.yield_rate,
            MetricField::VacancyRate => &mut self.vacancy_rate,
            MetricField::PropertyValue => &mut self.property_value,
            MetricField::AvgTenancyLength => &mut self.avg_tenancy_length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodGroup {
    pub period: String,
    pub period_start: Option<NaiveDate>,
    pub record_count: usize,
    #[serde(flatten)]
    pub values: MetricValues,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyMetrics {
    pub property_id: String,
    pub property_name: Option<String>,
    pub record_count: usize,
    #[serde(flatten)]
    pub values: MetricValues,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub value: f64,
    pub change: String,
}

pub type OverviewMetrics = BTreeMap<MetricField, MetricSummary>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodValue {
    pub period: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSummary {
    pub field: MetricField,
    pub total: f64,
    pub average: f64,
    pub min: Option<PeriodValue>,
    pub max: Option<PeriodValue>,
}

/// Sums in sorted order so the result is independent of input order.
pub(crate) fn stable_sum(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    values.iter().sum()
}

#[derive(Debug, Clone, Default)]
struct FieldAccumulator {
    present: Vec<f64>,
}

impl FieldAccumulator {
    fn push(&mut self, value: Option<f64>) {
        if value.is_some_and(f64::is_finite) {
            self.present.push(coerce_numeric(value, 0.0));
        }
    }

    /// Missing values add nothing to a sum and are left out of a mean's
    /// denominator. A mean with no present values is zero.
    fn finish(mut self, aggregation: Aggregation) -> f64 {
        let count = self.present.len();
        let total = stable_sum(&mut self.present);
        match aggregation {
            Aggregation::Sum => total,
            Aggregation::Mean if count == 0 => 0.0,
            Aggregation::Mean => total / count as f64,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RecordAccumulator {
    records: usize,
    fields: [FieldAccumulator; 10],
}

impl RecordAccumulator {
    fn push(&mut self, record: &AnalyticsRecord) {
        self.records += 1;
        for (slot, field) in self.fields.iter_mut().zip(MetricField::ALL) {
            slot.push(record.value(field));
        }
    }

    fn finish(self) -> (usize, MetricValues) {
        let mut values = MetricValues::default();
        for (slot, field) in self.fields.into_iter().zip(MetricField::ALL) {
            *values.slot(field) = slot.finish(field.aggregation());
        }
        (self.records, values)
    }
}

/// Groups records into chronologically ordered periods.
///
/// Only periods that have at least one record appear. Records with no
/// resolvable year/month are skipped.
pub fn group_by_period(records: &[AnalyticsRecord], time_frame: TimeFrame) -> Vec<PeriodGroup> {
    let mut groups: BTreeMap<PeriodKey, RecordAccumulator> = BTreeMap::new();
    for record in records {
        let Some((year, month)) = record.year_month() else {
            tracing::debug!(
                property_id = %record.property_id,
                "Skipping analytics record without a resolvable period"
            );
            continue;
        };
        groups
            .entry(PeriodKey::new(time_frame, year, month))
            .or_default()
            .push(record);
    }

    groups
        .into_iter()
        .map(|(key, accumulator)| {
            let (record_count, values) = accumulator.finish();
            PeriodGroup {
                period: key.label(),
                period_start: key.start_date(),
                record_count,
                values,
            }
        })
        .collect()
}

/// Aggregates every field across the whole input. `change` carries the
/// `"n/a"` placeholder; use [`compare_overview_metrics`] for real deltas.
pub fn compute_overview_metrics(records: &[AnalyticsRecord]) -> OverviewMetrics {
    let (_, values) = aggregate(records);
    MetricField::ALL
        .into_iter()
        .map(|field| {
            (
                field,
                MetricSummary {
                    value: values.get(field),
                    change: NO_CHANGE.to_string(),
                },
            )
        })
        .collect()
}

/// Overview of `current` with each metric's change relative to `prior`.
pub fn compare_overview_metrics(
    current: &[AnalyticsRecord],
    prior: &[AnalyticsRecord],
) -> OverviewMetrics {
    let (_, current_values) = aggregate(current);
    let (_, prior_values) = aggregate(prior);
    MetricField::ALL
        .into_iter()
        .map(|field| {
            let value = current_values.get(field);
            (
                field,
                MetricSummary {
                    value,
                    change: format_change(value, prior_values.get(field)),
                },
            )
        })
        .collect()
}

/// Per-property aggregate, ordered by property id.
pub fn compute_property_metrics(records: &[AnalyticsRecord]) -> Vec<PropertyMetrics> {
    let mut by_property: BTreeMap<&str, (Option<&str>, RecordAccumulator)> = BTreeMap::new();
    for record in records {
        let entry = by_property
            .entry(record.property_id.as_str())
            .or_insert_with(|| (None, RecordAccumulator::default()));
        if entry.0.is_none() {
            entry.0 = record
                .property_name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty());
        }
        entry.1.push(record);
    }

    by_property
        .into_iter()
        .map(|(property_id, (property_name, accumulator))| {
            let (record_count, values) = accumulator.finish();
            PropertyMetrics {
                property_id: property_id.to_string(),
                property_name: property_name.map(ToOwned::to_owned),
                record_count,
                values,
            }
        })
        .collect()
}

/// Total, mean and extremes of one field across a grouped series. Ties
/// keep the earliest period.
pub fn summarize_trend(groups: &[PeriodGroup], field: MetricField) -> TrendSummary {
    let mut series = groups
        .iter()
        .map(|group| group.values.get(field))
        .collect::<Vec<_>>();
    let count = series.len();
    let total = stable_sum(&mut series);
    let average = if count == 0 { 0.0 } else { total / count as f64 };

    let mut min: Option<PeriodValue> = None;
    let mut max: Option<PeriodValue> = None;
    for group in groups {
        let value = group.values.get(field);
        if min.as_ref().map_or(true, |current| value < current.value) {
            min = Some(PeriodValue {
                period: group.period.clone(),
                value,
            });
        }
        if max.as_ref().map_or(true, |current| value > current.value) {
            max = Some(PeriodValue {
                period: group.period.clone(),
                value,
            });
        }
    }

    TrendSummary {
        field,
        total,
        average,
        min,
        max,
    }
}

fn aggregate(records: &[AnalyticsRecord]) -> (usize, MetricValues) {
    let mut accumulator = RecordAccumulator::default();
    for record in records {
        accumulator.push(record);
    }
    accumulator.finish()
}

/// Signed percentage change with one decimal, `"n/a"` against a zero base.
pub fn format_change(current: f64, prior: f64) -> String {
    if prior.abs() < f64::EPSILON {
        return NO_CHANGE.to_string();
    }
    let pct = ((current - prior) / prior.abs() * 1000.0).round() / 10.0;
    if pct == 0.0 {
        return "0.0%".to_string();
    }
    format!("{pct:+.1}%")
}
