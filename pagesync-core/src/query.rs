//! Structured filter/sort/paginate descriptions for data-bound components,
//! their validation, and translation into document-database queries.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const MAX_LIMIT: i64 = 5000;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueryError {
    #[error("unsupported query operator: {0}")]
    UnsupportedOperator(String),
    #[error("operator {operator} on '{field}' is missing its value")]
    MissingValue { field: String, operator: QueryOperator },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
    Contains,
    Search,
    StartsWith,
    EndsWith,
    IsNull,
    IsNotNull,
    Between,
}

impl QueryOperator {
    pub const ALL: [QueryOperator; 13] = [
        QueryOperator::Equal,
        QueryOperator::NotEqual,
        QueryOperator::LessThan,
        QueryOperator::LessThanEqual,
        QueryOperator::GreaterThan,
        QueryOperator::GreaterThanEqual,
        QueryOperator::Contains,
        QueryOperator::Search,
        QueryOperator::StartsWith,
        QueryOperator::EndsWith,
        QueryOperator::IsNull,
        QueryOperator::IsNotNull,
        QueryOperator::Between,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueryOperator::Equal => "equal",
            QueryOperator::NotEqual => "notEqual",
            QueryOperator::LessThan => "lessThan",
            QueryOperator::LessThanEqual => "lessThanEqual",
            QueryOperator::GreaterThan => "greaterThan",
            QueryOperator::GreaterThanEqual => "greaterThanEqual",
            QueryOperator::Contains => "contains",
            QueryOperator::Search => "search",
            QueryOperator::StartsWith => "startsWith",
            QueryOperator::EndsWith => "endsWith",
            QueryOperator::IsNull => "isNull",
            QueryOperator::IsNotNull => "isNotNull",
            QueryOperator::Between => "between",
        }
    }

    /// Null checks take no operand.
    pub fn is_null_check(self) -> bool {
        matches!(self, QueryOperator::IsNull | QueryOperator::IsNotNull)
    }
}

impl fmt::Display for QueryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryOperator {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueryOperator::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| QueryError::UnsupportedOperator(s.to_string()))
    }
}

/// One filter row as the UI edits it. `operator` stays a raw string so a
/// config from a newer editor still deserializes and can be reported on.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryCondition {
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Value>>,
}

impl QueryCondition {
    pub fn new(field: impl Into<String>, operator: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            operator: operator.into(),
            value: Some(value),
            values: None,
        }
    }

    pub fn null_check(field: impl Into<String>, operator: QueryOperator) -> Self {
        Self {
            field: field.into(),
            operator: operator.as_str().to_string(),
            ..Self::default()
        }
    }

    pub fn between(field: impl Into<String>, low: Value, high: Value) -> Self {
        Self {
            field: field.into(),
            operator: QueryOperator::Between.as_str().to_string(),
            value: None,
            values: Some(vec![low, high]),
        }
    }

    fn has_value(&self) -> bool {
        !matches!(self.value, None | Some(Value::Null))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryLogic {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySort {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl QuerySort {
    pub fn asc(field: impl Into<String>) -> Self {
        Self { field: field.into(), direction: SortDirection::Asc }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self { field: field.into(), direction: SortDirection::Desc }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default)]
    pub conditions: Vec<QueryCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic: Option<QueryLogic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<QuerySort>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

impl QueryConfig {
    pub fn logic(&self) -> QueryLogic {
        self.logic.unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Checks a config before it is executed. Problems are collected, never
/// raised.
pub fn validate_query_config(config: &QueryConfig) -> ValidationResult {
    let mut errors = Vec::new();

    for (i, condition) in config.conditions.iter().enumerate() {
        if condition.field.trim().is_empty() {
            errors.push(format!("condition {i}: field is required"));
        }
        if condition.operator.trim().is_empty() {
            errors.push(format!("condition {i}: operator is required"));
            continue;
        }
        let operator = match condition.operator.parse::<QueryOperator>() {
            Ok(op) => op,
            Err(_) => {
                errors.push(format!("condition {i}: unsupported operator '{}'", condition.operator));
                continue;
            }
        };
        match operator {
            QueryOperator::Between => {
                let count = condition.values.as_ref().map_or(0, Vec::len);
                if count != 2 {
                    errors.push(format!(
                        "condition {i}: between requires exactly 2 values, got {count}"
                    ));
                }
            }
            op if op.is_null_check() => {
                if condition.has_value() {
                    errors.push(format!("condition {i}: {op} does not take a value"));
                }
            }
            op => {
                if !condition.has_value() {
                    errors.push(format!("condition {i}: {op} requires a value"));
                }
            }
        }
    }

    if let Some(limit) = config.limit {
        if !(0..=MAX_LIMIT).contains(&limit) {
            errors.push(format!("limit must be between 0 and {MAX_LIMIT}, got {limit}"));
        }
    }
    if let Some(offset) = config.offset {
        if offset < 0 {
            errors.push(format!("offset must be >= 0, got {offset}"));
        }
    }

    ValidationResult { valid: errors.is_empty(), errors }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Condition {
        operator: QueryOperator,
        attribute: String,
        values: Vec<Value>,
    },
    Or(Vec<Filter>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryClause {
    Filter(Filter),
    OrderAsc(String),
    OrderDesc(String),
    Limit(i64),
    Offset(i64),
}

impl QueryClause {
    /// Renders the clause in the document database's JSON query syntax.
    pub fn to_backend_string(&self) -> String {
        self.to_backend_value().to_string()
    }

    fn to_backend_value(&self) -> Value {
        match self {
            QueryClause::Filter(filter) => filter_value(filter),
            QueryClause::OrderAsc(field) => json!({"method": "orderAsc", "attribute": field}),
            QueryClause::OrderDesc(field) => json!({"method": "orderDesc", "attribute": field}),
            QueryClause::Limit(n) => json!({"method": "limit", "values": [n]}),
            QueryClause::Offset(n) => json!({"method": "offset", "values": [n]}),
        }
    }
}

fn filter_value(filter: &Filter) -> Value {
    match filter {
        Filter::Condition { operator, attribute, values } => {
            json!({"method": operator.as_str(), "attribute": attribute, "values": values})
        }
        Filter::Or(filters) => {
            json!({"method": "or", "values": filters.iter().map(filter_value).collect::<Vec<_>>()})
        }
    }
}

fn build_filter(condition: &QueryCondition) -> Result<Filter, QueryError> {
    let operator: QueryOperator = condition.operator.parse()?;
    let missing = || QueryError::MissingValue {
        field: condition.field.clone(),
        operator,
    };

    let values = match operator {
        op if op.is_null_check() => Vec::new(),
        QueryOperator::Between => match condition.values.as_deref() {
            Some([low, high]) => vec![low.clone(), high.clone()],
            _ => return Err(missing()),
        },
        _ => match &condition.value {
            None | Some(Value::Null) => return Err(missing()),
            Some(Value::Array(items)) => items.clone(),
            Some(value) => vec![value.clone()],
        },
    };

    Ok(Filter::Condition {
        operator,
        attribute: condition.field.clone(),
        values,
    })
}

/// Translates `config` into backend clauses: filters, then sort clauses in
/// list order, then limit and offset.
pub fn build_query(config: &QueryConfig) -> Result<Vec<QueryClause>, QueryError> {
    let filters = config
        .conditions
        .iter()
        .map(build_filter)
        .collect::<Result<Vec<_>, _>>()?;

    let mut clauses = Vec::with_capacity(filters.len() + 2);
    if config.logic() == QueryLogic::Or && filters.len() > 1 {
        clauses.push(QueryClause::Filter(Filter::Or(filters)));
    } else {
        clauses.extend(filters.into_iter().map(QueryClause::Filter));
    }

    for sort in config.sort.iter().flatten() {
        clauses.push(match sort.direction {
            SortDirection::Asc => QueryClause::OrderAsc(sort.field.clone()),
            SortDirection::Desc => QueryClause::OrderDesc(sort.field.clone()),
        });
    }
    if let Some(limit) = config.limit {
        clauses.push(QueryClause::Limit(limit));
    }
    if let Some(offset) = config.offset {
        clauses.push(QueryClause::Offset(offset));
    }

    log::trace!("built {} query clauses", clauses.len());
    Ok(clauses)
}
