//! Translates a validated [`VqlQuery`] into a parameterized SQL statement
//! against `metrics` and runs it, mirroring `VQLExecutor._to_sql` /
//! `.execute`. Every identifier reaching this module has already passed
//! [`super::security::validate_query`], so string concatenation here is
//! safe — values are still bound as parameters, never interpolated.

use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Map, Value};

use crate::clock::now_ms;
use crate::error::VqlError;
use crate::store::Store;

use super::parser::{OrderDirection, VqlQuery};

#[derive(Debug, Clone)]
pub struct VqlResult {
    pub rows: Vec<Map<String, Value>>,
    pub row_count: usize,
}

/// Percentile columns are precomputed on aggregated rows rather than
/// computed on the fly; `PERCENTILE(value, 95)` maps to the `p95` column
/// that `apply_downsample_rule` already wrote.
fn build_select(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| rewrite_percentile(f))
        .collect::<Vec<_>>()
        .join(", ")
}

fn rewrite_percentile(field: &str) -> String {
    let trimmed = field.trim();
    let lower = trimmed.to_lowercase();
    if let Some(rest) = lower.strip_prefix("percentile(") {
        if let Some(args) = rest.strip_suffix(')') {
            if let Some((_, pct)) = args.split_once(',') {
                let pct = pct.trim();
                return format!("p{pct}");
            }
        }
    }
    trimmed.to_string()
}

fn build_sql(query: &VqlQuery) -> (String, Vec<String>) {
    let select_clause = build_select(&query.select_fields);

    let mut params = Vec::new();
    let where_clause = if query.where_conditions.is_empty() {
        String::new()
    } else {
        let parts: Vec<String> = query
            .where_conditions
            .iter()
            .map(|c| {
                params.push(c.value.clone());
                format!("{} {} ?", c.field, c.operator)
            })
            .collect();
        format!("WHERE {}", parts.join(" AND "))
    };

    let group_clause = if query.group_by.is_empty() {
        String::new()
    } else {
        format!("GROUP BY {}", query.group_by.join(", "))
    };

    let order_clause = if query.order_by.is_empty() {
        String::new()
    } else {
        let parts: Vec<String> = query
            .order_by
            .iter()
            .map(|t| format!("{} {}", t.field, if t.direction == OrderDirection::Desc { "DESC" } else { "ASC" }))
            .collect();
        format!("ORDER BY {}", parts.join(", "))
    };

    let limit_clause = query.limit.map(|l| format!("LIMIT {l}")).unwrap_or_default();

    let sql = [
        format!("SELECT {select_clause}"),
        format!("FROM {}", query.table),
        where_clause,
        group_clause,
        order_clause,
        limit_clause,
    ]
    .into_iter()
    .filter(|s| !s.is_empty())
    .collect::<Vec<_>>()
    .join(" ");

    (sql, params)
}

fn sql_value_to_json(value: ValueRef) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

/// Parses, validates, executes `query_text`, logs it to `query_log`, and
/// returns the result rows as loosely-typed JSON objects (column names come
/// from the query itself, so the shape varies row to row).
pub fn execute(store: &Store, query_text: &str) -> Result<VqlResult, VqlError> {
    let started_at = now_ms();
    super::security::validate_query_text(query_text)?;
    let parsed = super::parser::parse(query_text)?;
    super::security::validate_query(&parsed)?;

    let (sql, params) = build_sql(&parsed);
    let bound: Vec<SqlValue> = params.into_iter().map(SqlValue::Text).collect();

    let conn = store.pool().get().map_err(|e| VqlError::Execution(e.into()))?;
    let mut stmt = conn.prepare(&sql).map_err(|e| VqlError::Execution(e.into()))?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    let param_refs: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
    let mut rows_iter = stmt.query(param_refs.as_slice()).map_err(|e| VqlError::Execution(e.into()))?;

    let mut rows = Vec::new();
    while let Some(row) = rows_iter.next().map_err(|e| VqlError::Execution(e.into()))? {
        let mut obj = Map::new();
        for (idx, name) in column_names.iter().enumerate() {
            let value = row.get_ref(idx).map_err(|e| VqlError::Execution(e.into()))?;
            obj.insert(name.clone(), sql_value_to_json(value));
        }
        rows.push(obj);
    }

    let row_count = rows.len();

    let logged_metric = parsed
        .where_conditions
        .iter()
        .find(|c| c.field == "metric_name")
        .map(|c| c.value.clone())
        .unwrap_or_else(|| "*".to_string());
    let logged_service = parsed
        .where_conditions
        .iter()
        .find(|c| c.field == "service_name")
        .map(|c| c.value.clone())
        .unwrap_or_else(|| "*".to_string());
    let elapsed_ms = (now_ms() - started_at) as f64;
    let _ = store.record_query(&logged_service, &logged_metric, elapsed_ms);

    Ok(VqlResult { rows, row_count })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    use crate::model::{HttpFacet, Metric, MetricKind, Tags};

    fn temp_store() -> Store {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let path = std::env::temp_dir().join(format!("vantage-vql-test-{nanos}.db"));
        Store::open_writer(path.to_str().unwrap()).unwrap()
    }

    fn sample(service: &str, name: &str, ts: i64, value: f64) -> Metric {
        Metric {
            id: None,
            timestamp: ts,
            service_name: service.into(),
            metric_name: name.into(),
            kind: MetricKind::Gauge,
            value,
            http: HttpFacet::default(),
            tags: Tags::new(),
            trace_id: None,
            span_id: None,
            aggregated: false,
            downsample: None,
        }
    }

    #[test]
    fn executes_simple_select_with_where() {
        let store = temp_store();
        store.insert_metrics_batch(&[sample("api", "cpu", 1_000, 42.0)]).unwrap();

        let result = execute(&store, "SELECT service_name, value FROM metrics WHERE service_name = 'api'").unwrap();
        assert_eq!(result.row_count, 1);
        assert_eq!(result.rows[0]["service_name"], Value::String("api".into()));
    }

    #[test]
    fn executes_aggregate_group_by() {
        let store = temp_store();
        store
            .insert_metrics_batch(&[sample("api", "cpu", 1_000, 10.0), sample("api", "cpu", 2_000, 30.0)])
            .unwrap();

        let result = execute(&store, "SELECT service_name, AVG(value) FROM metrics GROUP BY service_name").unwrap();
        assert_eq!(result.row_count, 1);
    }

    #[test]
    fn rejects_dangerous_query() {
        let store = temp_store();
        let err = execute(&store, "SELECT * FROM metrics; DROP TABLE metrics").unwrap_err();
        assert!(matches!(err, VqlError::Validation { .. }));
    }
}
