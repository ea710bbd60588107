//! Whitelist-based query validation, mirroring
//! `vantage-api/api/vql_security.py` exactly: the same table/column/
//! function/operator sets, the same complexity caps, the same dangerous-
//! keyword and system-table blocklists. This runs before [`super::parser`]
//! output ever reaches [`super::executor`].

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::VqlError;
use crate::vql::parser::VqlQuery;

pub static ALLOWED_TABLES: &[&str] = &["metrics", "traces", "spans", "alerts"];

/// `metrics` columns, fixed to the literal set from `vql_security.py` (see
/// SPEC_FULL.md §B.3). Other tables get their whitelist from their own
/// store schema (`store::SCHEMA`) since spec.md only enumerates `metrics`.
pub static ALLOWED_COLUMNS: &[&str] = &[
    "id", "timestamp", "service_name", "metric_name", "metric_type", "value", "endpoint",
    "method", "status_code", "duration_ms", "tags", "trace_id", "span_id", "aggregated",
    "resolution_minutes", "min_value", "max_value", "p50", "p95", "p99", "sample_count",
    "error_count", "created_at",
];

pub static TRACES_COLUMNS: &[&str] =
    &["trace_id", "service_name", "start_time", "end_time", "duration_ms", "status", "error_flag"];

pub static SPANS_COLUMNS: &[&str] = &[
    "span_id", "trace_id", "parent_span_id", "service_name", "operation_name", "start_time",
    "end_time", "duration_ms", "tags", "logs", "status", "error_flag",
];

pub static ALERTS_COLUMNS: &[&str] = &[
    "alert_id", "service_name", "metric_name", "severity", "status", "message", "current_value",
    "expected_min", "expected_max", "breach_count", "first_triggered", "last_triggered",
    "resolved_at",
];

fn columns_for_table(table: &str) -> &'static [&'static str] {
    match table {
        "traces" => TRACES_COLUMNS,
        "spans" => SPANS_COLUMNS,
        "alerts" => ALERTS_COLUMNS,
        _ => ALLOWED_COLUMNS,
    }
}

fn validate_table(table: &str) -> Result<String, VqlError> {
    let lower = table.trim().to_lowercase();
    if lower.starts_with("sqlite_") {
        return Err(fail("system_table", format!("access to system table not allowed: {table}")));
    }
    if !ALLOWED_TABLES.iter().any(|t| *t == lower) {
        return Err(fail("table", format!("table not allowed: {table}")));
    }
    Ok(lower)
}

pub static ALLOWED_FUNCTIONS: &[&str] = &["COUNT", "SUM", "AVG", "MIN", "MAX", "PERCENTILE"];

pub static ALLOWED_OPERATORS: &[&str] = &["=", ">", "<", ">=", "<=", "!=", "LIKE"];

pub const MAX_SELECT_FIELDS: usize = 20;
pub const MAX_WHERE_CONDITIONS: usize = 10;
pub const MAX_GROUP_BY_FIELDS: usize = 5;
pub const MAX_ORDER_BY_FIELDS: usize = 3;
pub const MAX_LIMIT_VALUE: i64 = 10_000;
pub const MAX_QUERY_LEN: usize = 5000;
pub const MAX_LIKE_PATTERN_LEN: usize = 100;

static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap());
static LIKE_WILDCARD_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"%{3,}|_{3,}").unwrap());
static AGG_FN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(\w+)\(([a-zA-Z0-9_*]*)\)(?:\s+as\s+(\w+))?$").unwrap());

static DANGEROUS_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "INSERT", "UPDATE", "TRUNCATE", "ALTER", "CREATE", "REPLACE", "EXEC",
    "EXECUTE", "PRAGMA", "ATTACH", "DETACH",
];
static SYSTEM_TABLES: &[&str] = &["sqlite_master", "sqlite_schema", "sqlite_temp_master"];
static DANGEROUS_VALUE_PATTERNS: &[&str] =
    &[";", "--", "/*", "*/", "xp_", "sp_", "UNION", "DROP", "DELETE", "INSERT", "UPDATE", "EXEC", "EXECUTE"];

fn fail(rule: &str, message: impl Into<String>) -> VqlError {
    VqlError::Validation { rule: rule.to_string(), message: message.into() }
}

fn word_present(haystack: &str, word: &str) -> bool {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(word)))
        .map(|re| re.is_match(haystack))
        .unwrap_or(false)
}

/// Coarse text-level checks over the raw query string, run before parsing
/// (mirrors `validate_vql_query`).
pub fn validate_query_text(query: &str) -> Result<(), VqlError> {
    if query.len() > MAX_QUERY_LEN {
        return Err(fail("length", format!("query exceeds {MAX_QUERY_LEN} characters")));
    }
    let trimmed = query.trim();
    if let Some(idx) = trimmed.find(';') {
        if idx < trimmed.len() - 1 {
            return Err(fail("statement_stacking", "multiple statements not allowed"));
        }
    }
    if query.contains("--") || query.contains("/*") {
        return Err(fail("comments", "comments not allowed in queries"));
    }
    if !word_present(query, "SELECT") {
        return Err(fail("select_required", "query must contain a SELECT clause"));
    }
    for keyword in DANGEROUS_KEYWORDS {
        if word_present(query, keyword) {
            return Err(fail("dangerous_keyword", format!("dangerous keyword not allowed: {keyword}")));
        }
    }
    for table in SYSTEM_TABLES {
        if word_present(query, table) {
            return Err(fail("system_table", format!("access to system table not allowed: {table}")));
        }
    }
    Ok(())
}

fn validate_identifier(table: &str, identifier: &str) -> Result<String, VqlError> {
    let identifier = identifier.trim();
    if !IDENTIFIER_RE.is_match(identifier) {
        return Err(fail("identifier", format!("invalid identifier: {identifier}")));
    }
    let lower = identifier.to_lowercase();
    if !columns_for_table(table).iter().any(|c| *c == lower) {
        return Err(fail("identifier", format!("identifier not allowed: {identifier}")));
    }
    Ok(identifier.to_string())
}

fn validate_operator(operator: &str) -> Result<String, VqlError> {
    let operator = operator.trim().to_uppercase();
    if !ALLOWED_OPERATORS.iter().any(|o| *o == operator) {
        return Err(fail("operator", format!("operator not allowed: {operator}")));
    }
    Ok(operator)
}

fn validate_value(value: &str) -> Result<String, VqlError> {
    let value = value.trim().trim_matches(|c| c == '\'' || c == '"');
    for pattern in DANGEROUS_VALUE_PATTERNS {
        if word_present(value, pattern) || value.contains(pattern) {
            return Err(fail("value", format!("value contains dangerous pattern: {pattern}")));
        }
    }
    Ok(value.to_string())
}

/// LIKE patterns get an extra cap beyond [`validate_value`]: length and a
/// ban on long wildcard runs, both of which are cheap ways to make the
/// store scan pathologically (a `%%%...%` pattern defeats any index).
fn validate_like_pattern(value: &str) -> Result<(), VqlError> {
    if value.len() > MAX_LIKE_PATTERN_LEN {
        return Err(fail("like_pattern", format!("LIKE pattern exceeds {MAX_LIKE_PATTERN_LEN} characters")));
    }
    if LIKE_WILDCARD_RUN_RE.is_match(value) {
        return Err(fail("like_pattern", "LIKE pattern has too long a run of wildcard characters"));
    }
    Ok(())
}

fn validate_function(name: &str) -> Result<String, VqlError> {
    let upper = name.trim().to_uppercase();
    if !ALLOWED_FUNCTIONS.iter().any(|f| *f == upper) {
        return Err(fail("function", format!("function not allowed: {upper}")));
    }
    Ok(upper)
}

fn validate_select_field(table: &str, field: &str) -> Result<(), VqlError> {
    if field.trim() == "*" {
        return Ok(());
    }
    if let Some(caps) = AGG_FN_RE.captures(field.trim()) {
        validate_function(caps.get(1).unwrap().as_str())?;
        let arg = caps.get(2).unwrap().as_str();
        if arg != "*" && !arg.is_empty() {
            validate_identifier(table, arg)?;
        }
        return Ok(());
    }
    validate_identifier(table, field)?;
    Ok(())
}

pub fn validate_limit(limit: i64) -> Result<i64, VqlError> {
    if limit <= 0 {
        return Err(fail("limit", "LIMIT must be positive"));
    }
    if limit > MAX_LIMIT_VALUE {
        return Err(fail("limit", format!("LIMIT exceeds maximum: {MAX_LIMIT_VALUE}")));
    }
    Ok(limit)
}

/// Validates a fully-parsed query against every whitelist and complexity
/// cap. On success, every identifier referenced in `query` is a known
/// `metrics` column and every operator/function is one the executor knows
/// how to translate safely.
pub fn validate_query(query: &VqlQuery) -> Result<(), VqlError> {
    validate_table(&query.table)?;
    if query.select_fields.len() > MAX_SELECT_FIELDS {
        return Err(fail("complexity", format!("too many SELECT fields: {}", query.select_fields.len())));
    }
    if query.where_conditions.len() > MAX_WHERE_CONDITIONS {
        return Err(fail("complexity", format!("too many WHERE conditions: {}", query.where_conditions.len())));
    }
    if query.group_by.len() > MAX_GROUP_BY_FIELDS {
        return Err(fail("complexity", format!("too many GROUP BY fields: {}", query.group_by.len())));
    }
    if query.order_by.len() > MAX_ORDER_BY_FIELDS {
        return Err(fail("complexity", format!("too many ORDER BY fields: {}", query.order_by.len())));
    }

    for field in &query.select_fields {
        validate_select_field(&query.table, field)?;
    }
    for cond in &query.where_conditions {
        validate_identifier(&query.table, &cond.field)?;
        let operator = validate_operator(&cond.operator)?;
        validate_value(&cond.value)?;
        if operator == "LIKE" {
            validate_like_pattern(&cond.value)?;
        }
    }
    for field in &query.group_by {
        validate_identifier(&query.table, field)?;
    }
    for term in &query.order_by {
        validate_identifier(&query.table, &term.field)?;
    }
    if let Some(limit) = query.limit {
        validate_limit(limit)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vql::parser::parse;

    #[test]
    fn rejects_unknown_table_reference() {
        assert!(validate_table("sqlite_master").is_err());
    }

    #[test]
    fn rejects_table_outside_whitelist() {
        assert!(validate_table("users").is_err());
    }

    #[test]
    fn accepts_query_against_traces_table() {
        let text = "SELECT trace_id, status FROM traces WHERE service_name = 'api' LIMIT 10";
        validate_query_text(text).unwrap();
        let parsed = parse(text).unwrap();
        validate_query(&parsed).unwrap();
    }

    #[test]
    fn rejects_dangerous_keyword_in_text() {
        assert!(validate_query_text("SELECT * FROM metrics; DROP TABLE metrics").is_err());
    }

    #[test]
    fn accepts_well_formed_query() {
        let text = "SELECT service_name, AVG(value) FROM metrics WHERE service_name = 'api' GROUP BY service_name LIMIT 10";
        validate_query_text(text).unwrap();
        let parsed = parse(text).unwrap();
        validate_query(&parsed).unwrap();
    }

    #[test]
    fn rejects_too_many_where_conditions() {
        let conditions: Vec<String> = (0..12).map(|i| format!("value > {i}")).collect();
        let text = format!("SELECT * FROM metrics WHERE {}", conditions.join(" AND "));
        let parsed = parse(&text).unwrap();
        assert!(validate_query(&parsed).is_err());
    }

    #[test]
    fn rejects_disallowed_function() {
        let parsed = parse("SELECT STDEV(value) FROM metrics").unwrap();
        assert!(validate_query(&parsed).is_err());
    }

    #[test]
    fn rejects_value_with_injection_pattern() {
        let parsed = parse("SELECT * FROM metrics WHERE service_name = 'x UNION SELECT 1'").unwrap();
        assert!(validate_query(&parsed).is_err());
    }

    #[test]
    fn accepts_well_formed_like_pattern() {
        let parsed = parse("SELECT * FROM metrics WHERE metric_name LIKE 'http%'").unwrap();
        assert!(validate_query(&parsed).is_ok());
    }

    #[test]
    fn rejects_overlong_like_pattern() {
        let pattern = "a".repeat(101);
        let text = format!("SELECT * FROM metrics WHERE metric_name LIKE '{pattern}'");
        let parsed = parse(&text).unwrap();
        assert!(validate_query(&parsed).is_err());
    }

    #[test]
    fn rejects_like_pattern_with_long_wildcard_run() {
        let parsed = parse("SELECT * FROM metrics WHERE metric_name LIKE '%%%'").unwrap();
        assert!(validate_query(&parsed).is_err());
    }
}
