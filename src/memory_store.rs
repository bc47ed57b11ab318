//! In-process store backed by fixture data.
//!
//! Tables are loaded from a JSON document of the form
//! `{"transactions": [{...}, ...], "todos": [...]}`. Predicates are
//! evaluated locally with the same semantics the REST store applies:
//! missing or null columns never match, and `like` follows SQL LIKE
//! (`%` any run, `_` one character).

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::auth::UserId;
use crate::backend::{Row, StoreError};
use crate::catalog::OWNER_COLUMN;
use crate::query::{Comparison, Predicate, ScopedQuery, Selection};

/// Number of recent reads kept by [`MemoryStore::executed_queries`].
pub const QUERY_LOG_CAPACITY: usize = 64;

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<HashMap<String, Vec<Row>>>>,
    /// The most recent scoped reads, oldest first.
    executed: Arc<Mutex<VecDeque<ScopedQuery>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from `(table, rows)` pairs. Every row must be a JSON object.
    pub fn from_tables(
        tables: impl IntoIterator<Item = (String, Vec<Value>)>,
    ) -> Result<Self, StoreError> {
        let mut map = HashMap::new();
        for (table, rows) in tables {
            let rows = rows
                .into_iter()
                .map(|row| match row {
                    Value::Object(obj) => Ok(obj),
                    other => Err(StoreError::Parse(format!(
                        "row in '{table}' is not an object: {other}"
                    ))),
                })
                .collect::<Result<Vec<Row>, StoreError>>()?;
            map.insert(table, rows);
        }
        Ok(Self {
            tables: Arc::new(RwLock::new(map)),
            executed: Arc::default(),
        })
    }

    /// Load a fixture file. A missing file yields an empty store.
    pub fn from_fixture(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Parse(format!("{}: {e}", path.display())))?;
        let doc: HashMap<String, Vec<Value>> = serde_json::from_str(&text)
            .map_err(|e| StoreError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_tables(doc)
    }

    pub async fn select(&self, query: &ScopedQuery) -> Result<Vec<Row>, StoreError> {
        {
            let mut executed = self.executed.lock().await;
            if executed.len() == QUERY_LOG_CAPACITY {
                executed.pop_front();
            }
            executed.push_back(query.clone());
        }

        let matchers = query
            .predicates()
            .iter()
            .map(Matcher::compile)
            .collect::<Result<Vec<_>, _>>()?;

        let tables = self.tables.read().await;
        let rows = tables.get(query.table()).map(Vec::as_slice).unwrap_or_default();

        Ok(rows
            .iter()
            .filter(|row| matchers.iter().all(|m| m.matches(row)))
            .map(|row| project(row, query.selection()))
            .collect())
    }

    pub async fn insert(&self, table: &str, mut row: Row, owner: &UserId) -> Row {
        row.insert(OWNER_COLUMN.to_string(), Value::String(owner.to_string()));
        row.entry("id")
            .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
        row.entry("created_at")
            .or_insert_with(|| Value::String(chrono::Utc::now().to_rfc3339()));

        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        row
    }

    pub async fn update(&self, table: &str, id: &str, mut patch: Row, owner: &UserId) -> Option<Row> {
        patch.remove("id");
        patch.remove(OWNER_COLUMN);

        let mut tables = self.tables.write().await;
        let row = tables
            .get_mut(table)?
            .iter_mut()
            .find(|row| owns(row, id, owner))?;
        row.extend(patch);
        row.insert(
            "updated_at".to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        Some(row.clone())
    }

    pub async fn delete(&self, table: &str, id: &str, owner: &UserId) -> bool {
        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(table) else {
            return false;
        };
        let before = rows.len();
        rows.retain(|row| !owns(row, id, owner));
        rows.len() != before
    }

    /// The last [`QUERY_LOG_CAPACITY`] scoped reads, oldest first.
    pub async fn executed_queries(&self) -> Vec<ScopedQuery> {
        self.executed.lock().await.iter().cloned().collect()
    }
}

fn owns(row: &Row, id: &str, owner: &UserId) -> bool {
    let id_matches = match row.get("id") {
        Some(Value::String(s)) => s == id,
        Some(Value::Number(n)) => n.to_string() == id,
        _ => false,
    };
    id_matches && row.get(OWNER_COLUMN).and_then(Value::as_str) == Some(owner.as_str())
}

fn project(row: &Row, selection: &Selection) -> Row {
    match selection {
        Selection::All => row.clone(),
        Selection::Columns(cols) => cols
            .iter()
            .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
            .collect(),
    }
}

/// A predicate ready to evaluate against rows.
struct Matcher<'a> {
    predicate: &'a Predicate,
    pattern: Option<Regex>,
}

impl<'a> Matcher<'a> {
    fn compile(predicate: &'a Predicate) -> Result<Self, StoreError> {
        let pattern = match predicate.comparison {
            Comparison::Like => {
                let raw = predicate
                    .value
                    .as_str()
                    .ok_or_else(|| StoreError::Pattern(predicate.value.to_string()))?;
                Some(like_regex(raw)?)
            }
            _ => None,
        };
        Ok(Self { predicate, pattern })
    }

    fn matches(&self, row: &Row) -> bool {
        let Some(actual) = row.get(&self.predicate.column).filter(|v| !v.is_null()) else {
            return false;
        };
        if let Some(re) = &self.pattern {
            return match actual {
                Value::String(s) => re.is_match(s),
                other => re.is_match(&other.to_string()),
            };
        }

        let Some(ordering) = compare(actual, &self.predicate.value) else {
            return false;
        };
        match self.predicate.comparison {
            Comparison::Eq => ordering == Ordering::Equal,
            Comparison::Gt => ordering == Ordering::Greater,
            Comparison::Lt => ordering == Ordering::Less,
            Comparison::Gte => ordering != Ordering::Less,
            Comparison::Lte => ordering != Ordering::Greater,
            Comparison::Like => false,
        }
    }
}

/// Translate a SQL LIKE pattern into an anchored regex.
fn like_regex(pattern: &str) -> Result<Regex, StoreError> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|_| StoreError::Pattern(pattern.to_string()))
}

/// Order `actual` against `expected`, coercing numeric and boolean strings
/// the way a typed column would. `None` when the values are incomparable.
fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (as_bool(actual), as_bool(expected)) {
        return Some(a.cmp(&b));
    }
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
