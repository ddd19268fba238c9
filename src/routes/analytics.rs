use std::collections::{HashMap, HashSet};
use std::future::Future;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    repository::table_service::{list_all_rows, list_rows},
    schemas::{validate_input, AggregateInput, AnalyticsQuery},
    services::analytics::{
        compare_overview_metrics, compute_maintenance_breakdown, compute_overview_metrics,
        compute_property_metrics, group_by_period, parse_records, records_from_rows,
        summarize_trend, AnalyticsRecord, MetricField, TimeFrame,
    },
    state::AppState,
};

const ANALYTICS_TABLE: &str = "property_analytics";
const TREND_SUMMARY_FIELDS: [MetricField; 3] = [
    MetricField::NetProfit,
    MetricField::GrossIncome,
    MetricField::MaintenanceCosts,
];

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/analytics/overview", get(overview))
        .route("/analytics/trends", get(trends))
        .route(
            "/analytics/maintenance-breakdown",
            get(maintenance_breakdown),
        )
        .route("/analytics/properties", get(property_metrics))
        .route("/analytics/aggregate", post(aggregate_payload))
}

#[derive(Debug, Clone, Copy)]
struct DateRange {
    from: NaiveDate,
    to: NaiveDate,
}

async fn overview(
    State(state): State<AppState>,
    Query(query): Query<AnalyticsQuery>,
) -> AppResult<Json<Value>> {
    validate_input(&query)?;
    let range = parse_range(&query.from_date, &query.to_date)?;
    let comparison = comparison_range(&query)?;

    cached(&state, &query.cache_key("overview"), async {
        let records = fetch_records(&state, &query, range).await?;
        let metrics = match comparison {
            Some(prior_range) => {
                let prior = fetch_records(&state, &query, prior_range).await?;
                compare_overview_metrics(&records, &prior)
            }
            None => compute_overview_metrics(&records),
        };

        Ok(json!({
            "owner_id": query.owner_id,
            "from": range.from,
            "to": range.to,
            "property_id": query.property_id,
            "record_count": records.len(),
            "comparison": comparison.map(|prior| json!({ "from": prior.from, "to": prior.to })),
            "metrics": metrics,
        }))
    })
    .await
}

async fn trends(
    State(state): State<AppState>,
    Query(query): Query<AnalyticsQuery>,
) -> AppResult<Json<Value>> {
    validate_input(&query)?;
    let range = parse_range(&query.from_date, &query.to_date)?;
    let time_frame = parse_time_frame(query.time_frame.as_deref())?;

    cached(&state, &query.cache_key("trends"), async {
        let records = fetch_records(&state, &query, range).await?;
        let periods = group_by_period(&records, time_frame);
        let summary = TREND_SUMMARY_FIELDS
            .into_iter()
            .map(|field| {
                (
                    field.as_str().to_string(),
                    json!(summarize_trend(&periods, field)),
                )
            })
            .collect::<Map<String, Value>>();

        Ok(json!({
            "owner_id": query.owner_id,
            "from": range.from,
            "to": range.to,
            "property_id": query.property_id,
            "time_frame": time_frame,
            "periods": periods,
            "summary": summary,
        }))
    })
    .await
}

async fn maintenance_breakdown(
    State(state): State<AppState>,
    Query(query): Query<AnalyticsQuery>,
) -> AppResult<Json<Value>> {
    validate_input(&query)?;
    let range = parse_range(&query.from_date, &query.to_date)?;

    cached(&state, &query.cache_key("maintenance"), async {
        let records = fetch_records(&state, &query, range).await?;
        let mut categories = compute_maintenance_breakdown(&records);
        categories.sort_by(|left, right| {
            right
                .amount
                .total_cmp(&left.amount)
                .then_with(|| left.category.cmp(&right.category))
        });
        let total = categories.iter().map(|entry| entry.amount).sum::<f64>();

        Ok(json!({
            "owner_id": query.owner_id,
            "from": range.from,
            "to": range.to,
            "property_id": query.property_id,
            "total": total,
            "categories": categories,
        }))
    })
    .await
}

async fn property_metrics(
    State(state): State<AppState>,
    Query(query): Query<AnalyticsQuery>,
) -> AppResult<Json<Value>> {
    validate_input(&query)?;
    let range = parse_range(&query.from_date, &query.to_date)?;

    cached(&state, &query.cache_key("properties"), async {
        let records = fetch_records(&state, &query, range).await?;
        Ok(json!({
            "owner_id": query.owner_id,
            "from": range.from,
            "to": range.to,
            "properties": compute_property_metrics(&records),
        }))
    })
    .await
}

async fn aggregate_payload(Json(payload): Json<AggregateInput>) -> AppResult<Json<Value>> {
    let time_frame = parse_time_frame(payload.time_frame.as_deref())?;
    let records = parse_records(&payload.records)?;

    Ok(Json(json!({
        "time_frame": time_frame,
        "record_count": records.len(),
        "periods": group_by_period(&records, time_frame),
        "overview": compute_overview_metrics(&records),
        "maintenance_breakdown": compute_maintenance_breakdown(&records),
    })))
}

/// Serves `key` from the report cache. `compute` only runs on a miss, and
/// at most once per key at a time.
async fn cached<Fut>(state: &AppState, key: &str, compute: Fut) -> AppResult<Json<Value>>
where
    Fut: Future<Output = AppResult<Value>>,
{
    if let Some(hit) = state.report_cache.get(key).await {
        tracing::debug!(cache_key = %key, "Analytics cache hit");
        return Ok(Json(hit));
    }

    let key_lock = state.report_cache.key_lock(key).await;
    let _guard = key_lock.lock().await;

    if let Some(hit) = state.report_cache.get(key).await {
        return Ok(Json(hit));
    }

    let response = compute.await?;
    state
        .report_cache
        .put(key.to_string(), response.clone())
        .await;
    Ok(Json(response))
}

async fn fetch_records(
    state: &AppState,
    query: &AnalyticsQuery,
    range: DateRange,
) -> AppResult<Vec<AnalyticsRecord>> {
    let pool = db_pool(state)?;

    let mut filters = Map::new();
    filters.insert(
        "owner_id".to_string(),
        Value::String(query.owner_id.trim().to_string()),
    );
    if let Some(property_id) = non_empty_opt(query.property_id.as_deref()) {
        filters.insert("property_id".to_string(), Value::String(property_id));
    }
    filters.insert(
        "record_date__gte".to_string(),
        Value::String(range.from.to_string()),
    );
    filters.insert(
        "record_date__lte".to_string(),
        Value::String(range.to.to_string()),
    );

    let rows = list_all_rows(
        pool,
        ANALYTICS_TABLE,
        Some(&filters),
        state.config.analytics_row_limit,
        "record_date",
        true,
    )
    .await?;
    let mut records = records_from_rows(&rows);
    attach_property_names(pool, &mut records).await?;

    tracing::debug!(
        owner_id = %query.owner_id,
        rows = rows.len(),
        records = records.len(),
        "Fetched analytics records"
    );
    Ok(records)
}

/// Fills `property_name` from `properties` for records that lack one.
async fn attach_property_names(
    pool: &sqlx::PgPool,
    records: &mut [AnalyticsRecord],
) -> AppResult<()> {
    let missing = records
        .iter()
        .filter(|record| record.property_name.is_none() && !record.property_id.is_empty())
        .map(|record| record.property_id.clone())
        .collect::<HashSet<_>>();
    if missing.is_empty() {
        return Ok(());
    }

    let mut filters = Map::new();
    filters.insert(
        "id".to_string(),
        Value::Array(missing.iter().cloned().map(Value::String).collect()),
    );
    let properties = list_rows(
        pool,
        "properties",
        Some(&filters),
        missing.len() as i64,
        0,
        "id",
        true,
    )
    .await?;

    let names = properties
        .iter()
        .filter_map(|row| {
            let id = row.get("id").and_then(Value::as_str)?;
            let name = row.get("name").and_then(Value::as_str)?;
            Some((id.to_string(), name.to_string()))
        })
        .collect::<HashMap<_, _>>();

    for record in records.iter_mut() {
        if record.property_name.is_none() {
            record.property_name = names.get(&record.property_id).cloned();
        }
    }
    Ok(())
}

fn parse_range(from: &str, to: &str) -> AppResult<DateRange> {
    let range = DateRange {
        from: parse_date(from)?,
        to: parse_date(to)?,
    };
    if range.from > range.to {
        return Err(AppError::BadRequest(
            "'from' must be on or before 'to'.".to_string(),
        ));
    }
    Ok(range)
}

fn comparison_range(query: &AnalyticsQuery) -> AppResult<Option<DateRange>> {
    match (
        non_empty_opt(query.compare_from.as_deref()),
        non_empty_opt(query.compare_to.as_deref()),
    ) {
        (Some(from), Some(to)) => parse_range(&from, &to).map(Some),
        (None, None) => Ok(None),
        _ => Err(AppError::BadRequest(
            "compare_from and compare_to must be provided together.".to_string(),
        )),
    }
}

fn parse_time_frame(raw: Option<&str>) -> AppResult<TimeFrame> {
    match non_empty_opt(raw) {
        Some(value) => Ok(value.parse::<TimeFrame>()?),
        None => Ok(TimeFrame::default()),
    }
}

fn parse_date(value: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest("Invalid ISO date.".to_string()))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}
