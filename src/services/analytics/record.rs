use chrono::{DateTime, Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::AnalyticsError;

/// Numeric columns of a `property_analytics` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    GrossIncome,
    TotalExpenses,
    NetProfit,
    MaintenanceCosts,
    OccupancyRate,
    TenantSatisfaction,
    YieldRate,
    VacancyRate,
    PropertyValue,
    AvgTenancyLength,
}

/// How a field is combined across the records of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum,
    Mean,
}

impl MetricField {
    pub const ALL: [MetricField; 10] = [
        MetricField::GrossIncome,
        MetricField::TotalExpenses,
        MetricField::NetProfit,
        MetricField::MaintenanceCosts,
        MetricField::OccupancyRate,
        MetricField::TenantSatisfaction,
        MetricField::YieldRate,
        MetricField::VacancyRate,
        MetricField::PropertyValue,
        MetricField::AvgTenancyLength,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GrossIncome => "gross_income",
            Self::TotalExpenses => "total_expenses",
            Self::NetProfit => "net_profit",
            Self::MaintenanceCosts => "maintenance_costs",
            Self::OccupancyRate => "occupancy_rate",
            Self::TenantSatisfaction => "tenant_satisfaction",
            Self::YieldRate => "yield_rate",
            Self::VacancyRate => "vacancy_rate",
            Self::PropertyValue => "property_value",
            Self::AvgTenancyLength => "avg_tenancy_length",
        }
    }

    /// Monetary flows are summed; rates, valuations and tenancy length are
    /// plain arithmetic means.
    pub fn aggregation(self) -> Aggregation {
        match self {
            Self::GrossIncome | Self::TotalExpenses | Self::NetProfit | Self::MaintenanceCosts => {
                Aggregation::Sum
            }
            _ => Aggregation::Mean,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// One property's figures for one month.
///
/// Every numeric column is optional: the source table does not enforce
/// presence, and a missing value must stay distinguishable from a zero so
/// that means can leave it out of the denominator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyticsRecord {
    pub property_id: String,
    pub property_name: Option<String>,
    pub record_date: Option<NaiveDate>,
    pub month: Option<u32>,
    pub year: Option<i32>,
    values: [Option<f64>; 10],
}

impl AnalyticsRecord {
    /// Record for `property_id` dated on the first day of `month/year`.
    #[cfg(test)]
    pub fn new(property_id: impl Into<String>, year: i32, month: u32) -> Self {
        Self {
            property_id: property_id.into(),
            record_date: NaiveDate::from_ymd_opt(year, month, 1),
            month: Some(month),
            year: Some(year),
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn with(mut self, field: MetricField, value: f64) -> Self {
        self.values[field.index()] = Some(value);
        self
    }

    #[cfg(test)]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.property_name = Some(name.into());
        self
    }

    pub fn value(&self, field: MetricField) -> Option<f64> {
        self.values[field.index()]
    }

    pub fn set_value(&mut self, field: MetricField, value: Option<f64>) {
        self.values[field.index()] = value.filter(|number| number.is_finite());
    }

    /// Builds a record from a JSON row. Returns `None` for anything that is
    /// not an object; malformed columns inside an object become `None`.
    pub fn from_row(row: &Value) -> Option<Self> {
        let object = row.as_object()?;

        let mut record = Self {
            property_id: text_value(object.get("property_id")).unwrap_or_default(),
            property_name: text_value(object.get("property_name")),
            record_date: date_value(object.get("record_date")),
            month: numeric_or_none(object.get("month"))
                .filter(|value| value.fract() == 0.0 && (1.0..=12.0).contains(value))
                .map(|value| value as u32),
            year: numeric_or_none(object.get("year"))
                .filter(|value| value.fract() == 0.0 && (1.0..=9999.0).contains(value))
                .map(|value| value as i32),
            values: [None; 10],
        };
        for field in MetricField::ALL {
            record.set_value(field, numeric_or_none(object.get(field.as_str())));
        }
        Some(record)
    }

    /// Year and month this record belongs to: the explicit `year`/`month`
    /// columns when both are usable, otherwise `record_date`.
    pub fn year_month(&self) -> Option<(i32, u32)> {
        match (self.year, self.month) {
            (Some(year), Some(month)) if (1..=12).contains(&month) => Some((year, month)),
            _ => self
                .record_date
                .map(|date| (date.year(), date.month())),
        }
    }

    /// Display category: the property name, then its id.
    pub fn category(&self) -> Option<&str> {
        self.property_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .or_else(|| Some(self.property_id.trim()).filter(|id| !id.is_empty()))
    }
}

/// Parses a JSON payload that must be a list of rows.
///
/// A non-array payload is a caller bug and is rejected. Non-object elements
/// inside the list are skipped.
pub fn parse_records(payload: &Value) -> Result<Vec<AnalyticsRecord>, AnalyticsError> {
    let Value::Array(rows) = payload else {
        return Err(AnalyticsError::NotAList(json_kind(payload)));
    };
    Ok(records_from_rows(rows))
}

pub fn records_from_rows(rows: &[Value]) -> Vec<AnalyticsRecord> {
    rows.iter().filter_map(AnalyticsRecord::from_row).collect()
}

/// Reads a JSON number or numeric string. Null, booleans, containers,
/// unparseable text and non-finite numbers read as `None`.
pub fn numeric_or_none(value: Option<&Value>) -> Option<f64> {
    let number = match value? {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    number.is_finite().then_some(number)
}

/// Missing or non-finite values count as `fallback`.
pub fn coerce_numeric(value: Option<f64>, fallback: f64) -> f64 {
    value.filter(|number| number.is_finite()).unwrap_or(fallback)
}

fn text_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn date_value(value: Option<&Value>) -> Option<NaiveDate> {
    let text = value.and_then(Value::as_str).map(str::trim)?;
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|value| value.date_naive())
        })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
