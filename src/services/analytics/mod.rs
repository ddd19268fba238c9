//! Aggregation of `property_analytics` rows into trend, overview and
//! maintenance views.
//!
//! Everything here is pure and synchronous; handlers fetch rows, turn them
//! into [`AnalyticsRecord`]s and call these functions directly.

mod breakdown;
mod metrics;
mod period;
mod record;

use thiserror::Error;

pub use breakdown::compute_maintenance_breakdown;
pub use metrics::{
    compare_overview_metrics, compute_overview_metrics, compute_property_metrics,
    group_by_period, summarize_trend,
};
pub use period::TimeFrame;
pub use record::{parse_records, records_from_rows, AnalyticsRecord, MetricField};

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("Expected a list of analytics records, got {0}.")]
    NotAList(&'static str),
    #[error("Unknown time frame '{0}'. Use monthly, quarterly or annual.")]
    UnknownTimeFrame(String),
}
