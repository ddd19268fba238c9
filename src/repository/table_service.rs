use chrono::{DateTime, FixedOffset, NaiveDate};
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, Postgres, QueryBuilder, Row};

use crate::error::AppError;

const ALLOWED_TABLES: &[&str] = &["extension_requests", "properties", "property_analytics"];

/// Largest page a single query may return.
pub const MAX_PAGE_SIZE: i64 = 1000;

/// Primary key shared by every allowed table.
const UNIQUE_KEY: &str = "id";

/// One page of rows as JSON objects.
///
/// Filter keys are column names with an optional operator suffix:
/// `column__gte`, `column__lte`, `column__gt`, `column__lt`, `column__in`,
/// and `column__ieq` for case-insensitive text equality.
/// Array values become `= ANY(...)`; `null` values are ignored.
pub async fn list_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
    limit: i64,
    offset: i64,
    order_by: &str,
    ascending: bool,
) -> Result<Vec<Value>, AppError> {
    let mut query = build_list_query(table, filters, order_by, ascending, limit, offset)?;
    let rows = query.build().fetch_all(pool).await.map_err(map_db_error)?;
    Ok(read_rows(rows))
}

/// Pages through [`list_rows`] until the table is exhausted or `max_rows`
/// rows have been read.
pub async fn list_all_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
    max_rows: i64,
    order_by: &str,
    ascending: bool,
) -> Result<Vec<Value>, AppError> {
    let max_rows = max_rows.max(1);
    let mut collected: Vec<Value> = Vec::new();
    loop {
        let remaining = max_rows - collected.len() as i64;
        if remaining <= 0 {
            tracing::warn!(table, max_rows, "Row limit reached, result truncated");
            break;
        }
        let page_size = remaining.min(MAX_PAGE_SIZE);
        let page = list_rows(
            pool,
            table,
            filters,
            page_size,
            collected.len() as i64,
            order_by,
            ascending,
        )
        .await?;
        let fetched = page.len() as i64;
        collected.extend(page);
        if fetched < page_size {
            break;
        }
    }
    Ok(collected)
}

fn build_list_query<'a>(
    table: &str,
    filters: Option<&Map<String, Value>>,
    order_by: &str,
    ascending: bool,
    limit: i64,
    offset: i64,
) -> Result<QueryBuilder<'a, Postgres>, AppError> {
    let table_name = validate_table(table)?;
    let order_name = if order_by.trim().is_empty() {
        "created_at"
    } else {
        validate_identifier(order_by)?
    };

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE 1=1");

    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    // `id` breaks ties so OFFSET pages never overlap or skip rows.
    let direction = if ascending { " ASC" } else { " DESC" };
    query.push(" ORDER BY t.").push(order_name).push(direction);
    if order_name != UNIQUE_KEY {
        query.push(", t.").push(UNIQUE_KEY).push(direction);
    }
    query
        .push(" LIMIT ")
        .push_bind(limit.clamp(1, MAX_PAGE_SIZE))
        .push(" OFFSET ")
        .push_bind(offset.max(0));
    Ok(query)
}

fn read_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect()
}

fn validate_table(table: &str) -> Result<&str, AppError> {
    let normalized = validate_identifier(table)?;
    if ALLOWED_TABLES.contains(&normalized) {
        return Ok(normalized);
    }
    Err(AppError::BadRequest(format!(
        "Table '{normalized}' is not allowed."
    )))
}

fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest(
            "Identifier cannot be empty.".to_string(),
        ));
    }
    let well_formed = trimmed.chars().all(|character| {
        character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_'
    }) && !trimmed
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_digit());
    if !well_formed {
        return Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    Ok(trimmed)
}

#[derive(Debug, Clone)]
enum ScalarFilter {
    Text(String),
    Uuid(uuid::Uuid),
    Bool(bool),
    I64(i64),
    F64(f64),
    Date(NaiveDate),
    Timestamp(DateTime<FixedOffset>),
}

#[derive(Debug, Clone)]
enum ArrayFilter {
    Text(Vec<String>),
    Uuid(Vec<uuid::Uuid>),
    I64(Vec<i64>),
}

impl ArrayFilter {
    fn is_empty(&self) -> bool {
        match self {
            Self::Text(values) => values.is_empty(),
            Self::Uuid(values) => values.is_empty(),
            Self::I64(values) => values.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOperator {
    Eq,
    IEq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOperator {
    fn sql(self) -> &'static str {
        match self {
            Self::Eq | Self::IEq => " = ",
            Self::Gt => " > ",
            Self::Gte => " >= ",
            Self::Lt => " < ",
            Self::Lte => " <= ",
        }
    }
}

fn parse_filter_key(filter_key: &str) -> Result<(&str, FilterOperator), AppError> {
    let (column, operator) = match filter_key.rsplit_once("__") {
        Some((column, "gt")) => (column, FilterOperator::Gt),
        Some((column, "gte")) => (column, FilterOperator::Gte),
        Some((column, "lt")) => (column, FilterOperator::Lt),
        Some((column, "lte")) => (column, FilterOperator::Lte),
        Some((column, "in")) => (column, FilterOperator::Eq),
        Some((column, "ieq")) => (column, FilterOperator::IEq),
        _ => (filter_key, FilterOperator::Eq),
    };
    Ok((validate_identifier(column)?, operator))
}

fn push_filter_clause(
    query: &mut QueryBuilder<Postgres>,
    filter_key: &str,
    value: &Value,
) -> Result<(), AppError> {
    let (column, operator) = parse_filter_key(filter_key)?;

    match value {
        Value::Null => Ok(()),
        Value::Array(items) => {
            if operator != FilterOperator::Eq {
                return Err(AppError::BadRequest(format!(
                    "Filter '{filter_key}' does not support array values."
                )));
            }
            let filter = infer_array_filter(column, items);
            if filter.is_empty() {
                // An empty IN list matches nothing.
                query.push(" AND FALSE");
                return Ok(());
            }
            query.push(" AND ");
            push_array_filter(query, column, &filter);
            Ok(())
        }
        _ if operator == FilterOperator::IEq => {
            let text = match value {
                Value::String(text) => text.trim().to_string(),
                other => other.to_string(),
            };
            query
                .push(" AND lower(t.")
                .push(column)
                .push("::text) = lower(")
                .push_bind(text)
                .push(")");
            Ok(())
        }
        _ => {
            query.push(" AND ");
            let filter = infer_scalar_filter(column, value);
            push_scalar_filter(query, column, operator, &filter);
            Ok(())
        }
    }
}

fn push_scalar_filter(
    query: &mut QueryBuilder<Postgres>,
    column: &str,
    operator: FilterOperator,
    value: &ScalarFilter,
) {
    query.push("t.").push(column);
    match value {
        ScalarFilter::Text(text) => {
            query
                .push("::text")
                .push(operator.sql())
                .push_bind(text.clone());
        }
        ScalarFilter::Uuid(id) => {
            query.push(operator.sql()).push_bind(*id);
        }
        ScalarFilter::Bool(flag) => {
            query.push(operator.sql()).push_bind(*flag);
        }
        ScalarFilter::I64(number) => {
            query.push(operator.sql()).push_bind(*number);
        }
        ScalarFilter::F64(number) => {
            query.push(operator.sql()).push_bind(*number);
        }
        ScalarFilter::Date(date) => {
            query.push(operator.sql()).push_bind(*date);
        }
        ScalarFilter::Timestamp(timestamp) => {
            query.push(operator.sql()).push_bind(*timestamp);
        }
    }
}

fn push_array_filter(query: &mut QueryBuilder<Postgres>, column: &str, value: &ArrayFilter) {
    query.push("t.").push(column);
    match value {
        ArrayFilter::Text(values) => {
            query
                .push("::text = ANY(")
                .push_bind(values.clone())
                .push(")");
        }
        ArrayFilter::Uuid(values) => {
            query.push(" = ANY(").push_bind(values.clone()).push(")");
        }
        ArrayFilter::I64(values) => {
            query.push(" = ANY(").push_bind(values.clone()).push(")");
        }
    }
}

fn infer_scalar_filter(column: &str, value: &Value) -> ScalarFilter {
    match value {
        Value::Bool(flag) => ScalarFilter::Bool(*flag),
        Value::Number(number) => number
            .as_i64()
            .map(ScalarFilter::I64)
            .or_else(|| number.as_f64().map(ScalarFilter::F64))
            .unwrap_or_else(|| ScalarFilter::Text(number.to_string())),
        Value::String(text) => {
            let trimmed = text.trim();
            if is_uuid_identifier(column) {
                if let Ok(parsed) = uuid::Uuid::parse_str(trimmed) {
                    return ScalarFilter::Uuid(parsed);
                }
            }
            if is_timestamp_identifier(column) {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                    return ScalarFilter::Timestamp(parsed);
                }
            }
            if is_date_identifier(column) {
                if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                    return ScalarFilter::Date(parsed);
                }
            }
            ScalarFilter::Text(text.clone())
        }
        other => ScalarFilter::Text(other.to_string()),
    }
}

fn infer_array_filter(column: &str, values: &[Value]) -> ArrayFilter {
    if is_uuid_identifier(column) {
        let parsed = values
            .iter()
            .map(|value| {
                value
                    .as_str()
                    .and_then(|text| uuid::Uuid::parse_str(text.trim()).ok())
            })
            .collect::<Option<Vec<_>>>();
        if let Some(ids) = parsed {
            return ArrayFilter::Uuid(ids);
        }
    }

    if values.iter().all(|value| value.as_i64().is_some()) {
        return ArrayFilter::I64(values.iter().filter_map(Value::as_i64).collect());
    }

    ArrayFilter::Text(
        values
            .iter()
            .map(|value| match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect(),
    )
}

fn is_uuid_identifier(identifier: &str) -> bool {
    let normalized = identifier.trim();
    normalized == "id" || normalized.ends_with("_id")
}

fn is_date_identifier(identifier: &str) -> bool {
    identifier.trim().ends_with("_date")
}

fn is_timestamp_identifier(identifier: &str) -> bool {
    identifier.trim().ends_with("_at")
}

fn map_db_error(error: sqlx::Error) -> AppError {
    tracing::error!(db_error = %error, "Database query failed");
    AppError::Dependency("Database operation failed.".to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{build_list_query, parse_filter_key, validate_identifier, FilterOperator};

    fn filters(entries: Value) -> Map<String, Value> {
        entries.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn builds_date_range_query() {
        let filter_map = filters(json!({
            "owner_id": "550e8400-e29b-41d4-a716-446655440000",
            "record_date__gte": "2024-01-01",
            "record_date__lte": "2024-12-31",
        }));
        let query =
            build_list_query("property_analytics", Some(&filter_map), "record_date", true, 500, 0)
                .expect("valid query");
        let sql = query.sql();

        assert!(sql.starts_with("SELECT row_to_json(t) AS row FROM property_analytics t WHERE 1=1"));
        assert!(sql.contains("t.owner_id = $1"), "unexpected SQL: {sql}");
        assert!(sql.contains("t.record_date >= $2"), "unexpected SQL: {sql}");
        assert!(sql.contains("t.record_date <= $3"), "unexpected SQL: {sql}");
        assert!(
            sql.contains("ORDER BY t.record_date ASC, t.id ASC LIMIT $4 OFFSET $5"),
            "unexpected SQL: {sql}"
        );
    }

    #[test]
    fn later_pages_keep_a_unique_order() {
        let query = build_list_query("property_analytics", None, "record_date", true, 1000, 1000)
            .expect("valid query");
        assert!(
            query.sql().ends_with("ORDER BY t.record_date ASC, t.id ASC LIMIT $1 OFFSET $2"),
            "unexpected SQL: {}",
            query.sql()
        );

        let descending = build_list_query("properties", None, "name", false, 10, 0)
            .expect("valid query");
        assert!(descending.sql().contains("ORDER BY t.name DESC, t.id DESC"));

        let by_id = build_list_query("properties", None, "id", true, 10, 0).expect("valid query");
        assert!(by_id.sql().contains("ORDER BY t.id ASC LIMIT"));
    }

    #[test]
    fn array_filters_use_any_and_empty_lists_match_nothing() {
        let with_ids = filters(json!({ "id": ["550e8400-e29b-41d4-a716-446655440000"] }));
        let sql = build_list_query("properties", Some(&with_ids), "name", true, 10, 0)
            .expect("valid query")
            .sql()
            .to_string();
        assert!(sql.contains("t.id = ANY($1)"), "unexpected SQL: {sql}");

        let empty = filters(json!({ "id": [] }));
        let sql = build_list_query("properties", Some(&empty), "name", true, 10, 0)
            .expect("valid query")
            .sql()
            .to_string();
        assert!(sql.contains("AND FALSE"), "unexpected SQL: {sql}");
    }

    #[test]
    fn text_columns_compare_as_text() {
        let status = filters(json!({ "status": "pending" }));
        let sql = build_list_query("extension_requests", Some(&status), "", false, 10, 0)
            .expect("valid query")
            .sql()
            .to_string();
        assert!(sql.contains("t.status::text = $1"), "unexpected SQL: {sql}");
        assert!(sql.contains("ORDER BY t.created_at DESC"));
    }

    #[test]
    fn case_insensitive_filter_lowers_both_sides() {
        let status = filters(json!({ "status__ieq": "Pending" }));
        let sql = build_list_query("extension_requests", Some(&status), "id", true, 10, 0)
            .expect("valid query")
            .sql()
            .to_string();
        assert!(
            sql.contains("AND lower(t.status::text) = lower($1)"),
            "unexpected SQL: {sql}"
        );

        let as_list = filters(json!({ "status__ieq": ["pending"] }));
        assert!(build_list_query("extension_requests", Some(&as_list), "id", true, 10, 0).is_err());
    }

    #[test]
    fn rejects_unknown_tables_and_identifiers() {
        assert!(build_list_query("users", None, "id", true, 10, 0).is_err());
        assert!(build_list_query("properties", None, "name; drop", true, 10, 0).is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("Name").is_err());
        assert_eq!(validate_identifier(" record_date ").ok(), Some("record_date"));
    }

    #[test]
    fn parses_operator_suffixes() {
        assert_eq!(
            parse_filter_key("record_date__gte").ok(),
            Some(("record_date", FilterOperator::Gte))
        );
        assert_eq!(
            parse_filter_key("property_id__in").ok(),
            Some(("property_id", FilterOperator::Eq))
        );
        assert_eq!(
            parse_filter_key("status__ieq").ok(),
            Some(("status", FilterOperator::IEq))
        );
        assert_eq!(
            parse_filter_key("year").ok(),
            Some(("year", FilterOperator::Eq))
        );
    }
}
