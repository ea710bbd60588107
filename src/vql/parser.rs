//! Regex-based VQL parser. Deliberately not a grammar: the language is a
//! small SELECT-only subset, so matching clause keywords with the `regex`
//! crate is enough — no need for a parser-combinator or grammar crate.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::VqlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct WhereCondition {
    pub field: String,
    pub operator: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct OrderTerm {
    pub field: String,
    pub direction: OrderDirection,
}

#[derive(Debug, Clone)]
pub struct VqlQuery {
    pub table: String,
    pub select_fields: Vec<String>,
    pub where_conditions: Vec<WhereCondition>,
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderTerm>,
    pub limit: Option<i64>,
}

static SELECT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)SELECT\s+(.*?)\s+FROM").unwrap());
static FROM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)FROM\s+(\w+)").unwrap());
static WHERE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)WHERE\s+(.*?)(?:\s+GROUP BY|\s+ORDER BY|\s+LIMIT|$)").unwrap());
static GROUP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)GROUP BY\s+(.*?)(?:\s+ORDER BY|\s+LIMIT|$)").unwrap());
static ORDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)ORDER BY\s+(.*?)(?:\s+LIMIT|$)").unwrap());
static LIMIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)LIMIT\s+(\d+)").unwrap());
static COND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\w+)\s*(=|>=|<=|!=|>|<|LIKE\b)\s*(.+)$").unwrap());
static ORDER_TERM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(\w+)(?:\s+(ASC|DESC))?$").unwrap());
static AND_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s+AND\s+").unwrap());

pub fn parse(query: &str) -> Result<VqlQuery, VqlError> {
    let query = query.trim();

    let select_clause = SELECT_RE
        .captures(query)
        .ok_or_else(|| VqlError::Validation {
            rule: "select".into(),
            message: "query must contain a SELECT ... FROM clause".into(),
        })?
        .get(1)
        .unwrap()
        .as_str();
    let select_fields = select_clause.split(',').map(|f| f.trim().to_string()).collect();

    let table = FROM_RE
        .captures(query)
        .ok_or_else(|| VqlError::Validation { rule: "from".into(), message: "query must name a FROM table".into() })?
        .get(1)
        .unwrap()
        .as_str()
        .to_string();

    let where_conditions = match WHERE_RE.captures(query) {
        Some(caps) => parse_where(caps.get(1).unwrap().as_str())?,
        None => Vec::new(),
    };

    let group_by = match GROUP_RE.captures(query) {
        Some(caps) => caps.get(1).unwrap().as_str().split(',').map(|f| f.trim().to_string()).collect(),
        None => Vec::new(),
    };

    let order_by = match ORDER_RE.captures(query) {
        Some(caps) => parse_order_by(caps.get(1).unwrap().as_str()),
        None => Vec::new(),
    };

    let limit = LIMIT_RE
        .captures(query)
        .and_then(|caps| caps.get(1).unwrap().as_str().parse::<i64>().ok());

    Ok(VqlQuery { table, select_fields, where_conditions, group_by, order_by, limit })
}

/// Every `AND`-separated conjunct must parse as a condition; one that
/// doesn't is a caller error, not a clause to quietly drop (a dropped
/// conjunct would silently widen the query to more rows than asked for).
fn parse_where(clause: &str) -> Result<Vec<WhereCondition>, VqlError> {
    AND_SPLIT_RE
        .split(clause)
        .map(|part| {
            let part = part.trim();
            let caps = COND_RE.captures(part).ok_or_else(|| VqlError::Validation {
                rule: "where".into(),
                message: format!("unparseable WHERE condition: {part}"),
            })?;
            let value = caps.get(3).unwrap().as_str().trim().trim_matches(|c| c == '\'' || c == '"');
            Ok(WhereCondition {
                field: caps.get(1).unwrap().as_str().to_string(),
                operator: caps.get(2).unwrap().as_str().to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

fn parse_order_by(clause: &str) -> Vec<OrderTerm> {
    clause
        .split(',')
        .filter_map(|part| {
            let caps = ORDER_TERM_RE.captures(part.trim())?;
            let direction = match caps.get(2).map(|m| m.as_str().to_uppercase()) {
                Some(d) if d == "DESC" => OrderDirection::Desc,
                _ => OrderDirection::Asc,
            };
            Some(OrderTerm { field: caps.get(1).unwrap().as_str().to_string(), direction })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_select_where_group_order_limit() {
        let q = parse(
            "SELECT service_name, AVG(value) FROM metrics WHERE timestamp > 100 AND service_name = 'api' \
             GROUP BY service_name ORDER BY service_name DESC LIMIT 50",
        )
        .unwrap();
        assert_eq!(q.table, "metrics");
        assert_eq!(q.select_fields, vec!["service_name", "AVG(value)"]);
        assert_eq!(q.where_conditions.len(), 2);
        assert_eq!(q.where_conditions[1].value, "api");
        assert_eq!(q.group_by, vec!["service_name"]);
        assert_eq!(q.order_by[0].direction, OrderDirection::Desc);
        assert_eq!(q.limit, Some(50));
    }

    #[test]
    fn missing_select_from_is_an_error() {
        assert!(parse("DELETE FROM metrics").is_err());
    }

    #[test]
    fn star_select_with_no_where() {
        let q = parse("SELECT * FROM metrics LIMIT 10").unwrap();
        assert_eq!(q.select_fields, vec!["*"]);
        assert!(q.where_conditions.is_empty());
        assert_eq!(q.limit, Some(10));
    }

    #[test]
    fn parses_like_condition() {
        let q = parse("SELECT * FROM metrics WHERE metric_name LIKE 'http%'").unwrap();
        assert_eq!(q.where_conditions.len(), 1);
        assert_eq!(q.where_conditions[0].operator.to_uppercase(), "LIKE");
        assert_eq!(q.where_conditions[0].value, "http%");
    }

    #[test]
    fn unparseable_where_conjunct_is_an_error_not_a_silent_drop() {
        let err = parse("SELECT * FROM metrics WHERE this is not a condition").unwrap_err();
        assert!(matches!(err, VqlError::Validation { .. }));
    }
}
