//! Query requests produced from model function calls.
//!
//! Arguments arrive as untrusted JSON text. [`QueryRequest::decode`] parses
//! them into an untyped object first, then validates every table, column,
//! operator and refinement against the domain's [`DomainSchema`] before a
//! typed request exists. The first mismatch is rejected.
//!
//! [`ScopedQuery`] is the only form a store accepts. It is built from a
//! request plus the caller's [`UserId`], re-checked against the catalog, and
//! always carries exactly one owner-equality predicate.

use std::fmt;

use chrono::{DateTime, NaiveDate};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::auth::UserId;
use crate::catalog::{
    CompletionStatus, Domain, DomainSchema, OWNER_COLUMN, RefinementSpec, SchemaCatalog,
    TableDescriptor,
};

// ============================================================================
// Errors
// ============================================================================

/// Model-produced arguments that do not fit the schema.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("arguments are not a JSON object: {0}")]
    InvalidArguments(String),

    #[error("no table given")]
    MissingTable,

    #[error("table '{table}' is not part of the {domain} domain")]
    UnknownTable { domain: Domain, table: String },

    #[error("column '{column}' does not exist on table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("unsupported operator '{0}'")]
    UnsupportedOperator(String),

    #[error("between on '{field}' needs exactly two values, got {got}")]
    BetweenArity { field: String, got: usize },

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("invalid {param}: {reason}")]
    InvalidRange { param: String, reason: String },

    #[error("unknown argument '{0}'")]
    UnknownArgument(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("domain '{0}' is not in the catalog")]
    UnknownDomain(Domain),
}

// ============================================================================
// Typed request
// ============================================================================

/// Supported filter operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    Eq,
    Gt,
    Lt,
    Gte,
    Lte,
    Between,
    Like,
}

impl FilterOperator {
    pub const ALL: [FilterOperator; 7] = [
        FilterOperator::Eq,
        FilterOperator::Gt,
        FilterOperator::Lt,
        FilterOperator::Gte,
        FilterOperator::Lte,
        FilterOperator::Between,
        FilterOperator::Like,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Gt => "gt",
            FilterOperator::Lt => "lt",
            FilterOperator::Gte => "gte",
            FilterOperator::Lte => "lte",
            FilterOperator::Between => "between",
            FilterOperator::Like => "like",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == s)
    }
}

/// Right-hand side of a filter.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Scalar(Value),
    /// Inclusive `[start, end]`, only for `between`.
    Bounds(Value, Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterPredicate {
    pub field: String,
    pub operator: FilterOperator,
    pub value: FilterValue,
}

/// Column selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Columns(Vec<String>),
}

impl Selection {
    /// PostgREST-style select list.
    pub fn to_select_list(&self) -> String {
        match self {
            Selection::All => "*".to_string(),
            Selection::Columns(cols) => cols.join(","),
        }
    }
}

/// Validated domain refinement.
#[derive(Debug, Clone, PartialEq)]
pub enum Refinement {
    DateRange {
        column: String,
        start: Option<String>,
        end: Option<String>,
    },
    NumericRange {
        field: String,
        min: Option<f64>,
        max: Option<f64>,
    },
    Completion {
        column: String,
        status: CompletionStatus,
    },
}

/// A validated, typed query against one table of one domain.
///
/// Only [`decode`](Self::decode), [`from_value`](Self::from_value) and
/// [`for_domain`](Self::for_domain) build one, so every request has passed
/// schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    domain: Domain,
    table: String,
    selection: Selection,
    filters: Vec<FilterPredicate>,
    refinements: Vec<Refinement>,
}

impl QueryRequest {
    /// Decode and validate raw function-call arguments for `schema`'s domain.
    pub fn decode(schema: &DomainSchema, arguments: &str) -> Result<Self, ValidationError> {
        let raw: Value = serde_json::from_str(arguments.trim())
            .map_err(|e| ValidationError::InvalidArguments(e.to_string()))?;
        Self::from_value(schema, raw)
    }

    /// Validate an argument object of the same shape the model fills in.
    pub fn from_value(schema: &DomainSchema, raw: Value) -> Result<Self, ValidationError> {
        let mut args = match raw {
            Value::Object(map) => map,
            other => {
                return Err(ValidationError::InvalidArguments(format!(
                    "expected object, got {other}"
                )));
            }
        };

        let table_name = match args.remove("table") {
            Some(Value::String(t)) if !t.is_empty() => t,
            Some(Value::Null) | None => return Err(ValidationError::MissingTable),
            Some(other) => {
                return Err(ValidationError::InvalidValue {
                    field: "table".into(),
                    reason: format!("expected string, got {other}"),
                });
            }
        };
        let table = schema
            .table(&table_name)
            .ok_or_else(|| ValidationError::UnknownTable {
                domain: schema.domain,
                table: table_name.clone(),
            })?;

        let unknown_column = |column: &str| ValidationError::UnknownColumn {
            table: table.name.clone(),
            column: column.to_string(),
        };

        let selection = match args.remove("select") {
            None | Some(Value::Null) => Selection::All,
            Some(Value::String(s)) => {
                let cols: Vec<String> = s
                    .split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect();
                if cols.is_empty() || cols.iter().any(|c| c == "*") {
                    Selection::All
                } else {
                    if let Some(bad) = cols.iter().find(|c| !table.has_column(c)) {
                        return Err(unknown_column(bad));
                    }
                    Selection::Columns(cols)
                }
            }
            Some(other) => {
                return Err(ValidationError::InvalidValue {
                    field: "select".into(),
                    reason: format!("expected string, got {other}"),
                });
            }
        };

        let mut filters = Vec::new();
        match args.remove("filters") {
            None | Some(Value::Null) => {}
            Some(Value::Array(items)) => {
                for item in items {
                    let predicate = decode_filter(item)?;
                    if !table.has_column(&predicate.field) {
                        return Err(unknown_column(&predicate.field));
                    }
                    filters.push(predicate);
                }
            }
            Some(other) => {
                return Err(ValidationError::InvalidValue {
                    field: "filters".into(),
                    reason: format!("expected array, got {other}"),
                });
            }
        }

        let mut refinements = Vec::new();
        for (param, value) in args {
            if value.is_null() {
                continue;
            }
            let spec = schema
                .refinement(&param)
                .ok_or_else(|| ValidationError::UnknownArgument(param.clone()))?;
            let refinement = decode_refinement(
                spec,
                &table.name,
                value,
                |c| table.has_column(c),
                |f| table.common_fields.contains(f),
            )?;
            refinements.push(refinement);
        }

        Ok(Self {
            domain: schema.domain,
            table: table.name.clone(),
            selection,
            filters,
            refinements,
        })
    }

    /// [`from_value`](Self::from_value) against `domain`'s schema in `catalog`.
    pub fn for_domain(
        catalog: &SchemaCatalog,
        domain: Domain,
        arguments: Value,
    ) -> Result<Self, ValidationError> {
        let schema = catalog
            .domain(domain)
            .ok_or(ValidationError::UnknownDomain(domain))?;
        Self::from_value(schema, arguments)
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn filters(&self) -> &[FilterPredicate] {
        &self.filters
    }

    pub fn refinements(&self) -> &[Refinement] {
        &self.refinements
    }
}

fn decode_filter(item: Value) -> Result<FilterPredicate, ValidationError> {
    let mut obj = match item {
        Value::Object(map) => map,
        other => {
            return Err(ValidationError::InvalidValue {
                field: "filters".into(),
                reason: format!("expected object, got {other}"),
            });
        }
    };

    let field = match obj.remove("field") {
        Some(Value::String(f)) => f,
        _ => {
            return Err(ValidationError::InvalidValue {
                field: "filters".into(),
                reason: "filter without a field name".into(),
            });
        }
    };

    let operator = match obj.remove("operator") {
        Some(Value::String(op)) => {
            FilterOperator::parse(&op).ok_or(ValidationError::UnsupportedOperator(op))?
        }
        // A missing operator means equality.
        None | Some(Value::Null) => FilterOperator::Eq,
        Some(other) => return Err(ValidationError::UnsupportedOperator(other.to_string())),
    };

    let value = obj.remove("value").unwrap_or(Value::Null);
    let value = if operator == FilterOperator::Between {
        match value {
            Value::Array(mut items) if items.len() == 2 => {
                let end = items.pop().unwrap_or(Value::Null);
                let start = items.pop().unwrap_or(Value::Null);
                check_scalar(&field, &start)?;
                check_scalar(&field, &end)?;
                FilterValue::Bounds(start, end)
            }
            Value::Array(items) => {
                return Err(ValidationError::BetweenArity {
                    field,
                    got: items.len(),
                });
            }
            Value::Null => return Err(ValidationError::BetweenArity { field, got: 0 }),
            _ => return Err(ValidationError::BetweenArity { field, got: 1 }),
        }
    } else {
        check_scalar(&field, &value)?;
        if operator == FilterOperator::Like && !value.is_string() {
            return Err(ValidationError::InvalidValue {
                field,
                reason: "like needs a string pattern".into(),
            });
        }
        FilterValue::Scalar(value)
    };

    Ok(FilterPredicate {
        field,
        operator,
        value,
    })
}

fn check_scalar(field: &str, value: &Value) -> Result<(), ValidationError> {
    match value {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => Ok(()),
        other => Err(ValidationError::InvalidValue {
            field: field.to_string(),
            reason: format!("expected a string, number or boolean, got {other}"),
        }),
    }
}

fn decode_refinement(
    spec: &RefinementSpec,
    table: &str,
    value: Value,
    has_column: impl Fn(&str) -> bool,
    is_common_field: impl Fn(&str) -> bool,
) -> Result<Refinement, ValidationError> {
    let param = spec.param();
    let range_err = |reason: String| ValidationError::InvalidRange {
        param: param.to_string(),
        reason,
    };

    match spec {
        RefinementSpec::DateRange {
            column,
            start_key,
            end_key,
            ..
        } => {
            let obj = expect_object(param, value)?;
            if !has_column(column) {
                return Err(ValidationError::UnknownColumn {
                    table: table.to_string(),
                    column: column.to_string(),
                });
            }
            let start = optional_date(param, &obj, start_key)?;
            let end = optional_date(param, &obj, end_key)?;
            match (&start, &end) {
                (None, None) => return Err(range_err("no bounds given".into())),
                (Some((s_raw, s)), Some((e_raw, e))) if s > e => {
                    return Err(range_err(format!("start {s_raw} is after end {e_raw}")));
                }
                _ => {}
            }
            Ok(Refinement::DateRange {
                column: column.to_string(),
                start: start.map(|(raw, _)| raw),
                end: end.map(|(raw, _)| raw),
            })
        }
        RefinementSpec::NumericRange { .. } => {
            let obj = expect_object(param, value)?;
            let field = obj
                .get("field")
                .and_then(Value::as_str)
                .ok_or_else(|| range_err("missing field".into()))?;
            if !is_common_field(field) {
                return Err(range_err(format!(
                    "'{field}' is not a range field of table '{table}'"
                )));
            }
            let min = optional_number(param, &obj, "min")?;
            let max = optional_number(param, &obj, "max")?;
            match (min, max) {
                (None, None) => return Err(range_err("no bounds given".into())),
                (Some(lo), Some(hi)) if lo > hi => {
                    return Err(range_err(format!("min {lo} is greater than max {hi}")));
                }
                _ => {}
            }
            Ok(Refinement::NumericRange {
                field: field.to_string(),
                min,
                max,
            })
        }
        RefinementSpec::Completion { column, .. } => {
            let raw = value.as_str().ok_or_else(|| ValidationError::InvalidValue {
                field: param.to_string(),
                reason: format!("expected string, got {value}"),
            })?;
            let status =
                CompletionStatus::parse(raw).ok_or_else(|| ValidationError::InvalidValue {
                    field: param.to_string(),
                    reason: format!("expected completed, pending or all, got '{raw}'"),
                })?;
            if !has_column(column) {
                return Err(ValidationError::UnknownColumn {
                    table: table.to_string(),
                    column: column.to_string(),
                });
            }
            Ok(Refinement::Completion {
                column: column.to_string(),
                status,
            })
        }
    }
}

fn expect_object(param: &str, value: Value) -> Result<Map<String, Value>, ValidationError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ValidationError::InvalidRange {
            param: param.to_string(),
            reason: format!("expected object, got {other}"),
        }),
    }
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp; returns the raw text and
/// its calendar date for ordering.
fn optional_date(
    param: &str,
    obj: &Map<String, Value>,
    key: &str,
) -> Result<Option<(String, NaiveDate)>, ValidationError> {
    let raw = match obj.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => {
            return Err(ValidationError::InvalidRange {
                param: param.to_string(),
                reason: format!("{key} must be a date string, got {other}"),
            });
        }
    };
    let date = NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(&raw).ok().map(|dt| dt.date_naive()))
        .ok_or_else(|| ValidationError::InvalidRange {
            param: param.to_string(),
            reason: format!("{key} '{raw}' is not a date"),
        })?;
    Ok(Some((raw, date)))
}

fn optional_number(
    param: &str,
    obj: &Map<String, Value>,
    key: &str,
) -> Result<Option<f64>, ValidationError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
            .map(Some)
            .ok_or_else(|| ValidationError::InvalidRange {
                param: param.to_string(),
                reason: format!("{key} must be a number, got {v}"),
            }),
    }
}

fn check_refinement(table: &TableDescriptor, refinement: &Refinement) -> Result<(), ValidationError> {
    match refinement {
        Refinement::DateRange { column, .. } | Refinement::Completion { column, .. } => {
            if table.has_column(column) {
                Ok(())
            } else {
                Err(ValidationError::UnknownColumn {
                    table: table.name.clone(),
                    column: column.clone(),
                })
            }
        }
        Refinement::NumericRange { field, .. } => {
            if table.common_fields.contains(field) {
                Ok(())
            } else {
                Err(ValidationError::InvalidRange {
                    param: field.clone(),
                    reason: format!("'{field}' is not a range field of table '{}'", table.name),
                })
            }
        }
    }
}

// ============================================================================
// Scoped query
// ============================================================================

/// Store-level comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Eq,
    Gt,
    Lt,
    Gte,
    Lte,
    Like,
}

impl Comparison {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparison::Eq => "eq",
            Comparison::Gt => "gt",
            Comparison::Lt => "lt",
            Comparison::Gte => "gte",
            Comparison::Lte => "lte",
            Comparison::Like => "like",
        }
    }
}

/// A single column comparison issued to the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Predicate {
    pub column: String,
    pub comparison: Comparison,
    pub value: Value,
}

impl Predicate {
    pub fn new(column: &str, comparison: Comparison, value: Value) -> Self {
        Self {
            column: column.to_string(),
            comparison,
            value,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.column, self.comparison.as_str(), self.value)
    }
}

/// A read restricted to one owner.
///
/// Fields are private: the only constructor lowers a [`QueryRequest`],
/// checks it against the catalog once more, and appends the owner
/// predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedQuery {
    table: String,
    selection: Selection,
    predicates: Vec<Predicate>,
    owner: UserId,
}

impl ScopedQuery {
    /// Lower `request` for `owner`. Fails on any table, column or
    /// operator/value pair the catalog does not allow; nothing is skipped.
    pub fn new(
        catalog: &SchemaCatalog,
        request: QueryRequest,
        owner: &UserId,
    ) -> Result<Self, ValidationError> {
        let schema = catalog
            .domain(request.domain)
            .ok_or(ValidationError::UnknownDomain(request.domain))?;
        let table = schema
            .table(&request.table)
            .ok_or_else(|| ValidationError::UnknownTable {
                domain: request.domain,
                table: request.table.clone(),
            })?;
        let known = |column: &str| -> Result<(), ValidationError> {
            if table.has_column(column) {
                Ok(())
            } else {
                Err(ValidationError::UnknownColumn {
                    table: table.name.clone(),
                    column: column.to_string(),
                })
            }
        };

        if let Selection::Columns(columns) = &request.selection {
            for column in columns {
                known(column.as_str())?;
            }
        }

        let mut predicates = Vec::new();
        for filter in request.filters {
            known(filter.field.as_str())?;
            match (filter.operator, filter.value) {
                (FilterOperator::Between, FilterValue::Bounds(start, end)) => {
                    predicates.push(Predicate::new(&filter.field, Comparison::Gte, start));
                    predicates.push(Predicate::new(&filter.field, Comparison::Lte, end));
                }
                (op, FilterValue::Bounds(..)) => {
                    return Err(ValidationError::InvalidValue {
                        field: filter.field,
                        reason: format!("{} takes a single value", op.as_str()),
                    });
                }
                (op, FilterValue::Scalar(v)) => {
                    let comparison = match op {
                        FilterOperator::Eq => Comparison::Eq,
                        FilterOperator::Gt => Comparison::Gt,
                        FilterOperator::Lt => Comparison::Lt,
                        FilterOperator::Gte => Comparison::Gte,
                        FilterOperator::Lte => Comparison::Lte,
                        FilterOperator::Like => Comparison::Like,
                        FilterOperator::Between => {
                            return Err(ValidationError::BetweenArity {
                                field: filter.field,
                                got: 1,
                            });
                        }
                    };
                    predicates.push(Predicate::new(&filter.field, comparison, v));
                }
            }
        }

        for refinement in request.refinements {
            check_refinement(table, &refinement)?;
            match refinement {
                Refinement::DateRange { column, start, end } => {
                    if let Some(start) = start {
                        predicates.push(Predicate::new(&column, Comparison::Gte, start.into()));
                    }
                    if let Some(end) = end {
                        predicates.push(Predicate::new(&column, Comparison::Lte, end.into()));
                    }
                }
                Refinement::NumericRange { field, min, max } => {
                    if let Some(min) = min {
                        predicates.push(Predicate::new(&field, Comparison::Gte, min.into()));
                    }
                    if let Some(max) = max {
                        predicates.push(Predicate::new(&field, Comparison::Lte, max.into()));
                    }
                }
                Refinement::Completion { column, status } => match status {
                    CompletionStatus::Completed => {
                        predicates.push(Predicate::new(&column, Comparison::Eq, true.into()));
                    }
                    CompletionStatus::Pending => {
                        predicates.push(Predicate::new(&column, Comparison::Eq, false.into()));
                    }
                    CompletionStatus::All => {}
                },
            }
        }

        let before = predicates.len();
        predicates.retain(|p| p.column != OWNER_COLUMN);
        if predicates.len() != before {
            debug!(
                table = %request.table,
                dropped = before - predicates.len(),
                "dropped upstream owner predicates"
            );
        }
        predicates.push(Predicate::new(
            OWNER_COLUMN,
            Comparison::Eq,
            Value::String(owner.as_str().to_string()),
        ));

        Ok(Self {
            table: request.table,
            selection: request.selection,
            predicates,
            owner: owner.clone(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn owner(&self) -> &UserId {
        &self.owner
    }
}

// ============================================================================
// Tests
// ============================================================================
