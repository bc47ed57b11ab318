//! Todo actions: list, add, toggle, reprioritize, delete.
//!
//! Every action runs for one authenticated caller and only ever touches that
//! caller's rows.

use std::fmt;
use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error};

use crate::auth::{Identity, UserId};
use crate::backend::{Row, StoreBackend, StoreError};
use crate::catalog::{Domain, SchemaCatalog};
use crate::query::{QueryRequest, ValidationError};

pub const TODOS_TABLE: &str = "todos";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub user_id: UserId,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Ids are strings or integers depending on the store.
fn id_string<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid id {other}"))),
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewTodo {
    pub title: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub due_date: Option<String>,
}

#[derive(Debug, Error)]
pub enum TodoError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Todo '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid todo query: {0}")]
    Query(#[from] ValidationError),

    #[error("Invalid todo row: {0}")]
    Decode(String),
}

impl IntoResponse for TodoError {
    fn into_response(self) -> Response {
        let status = match self {
            TodoError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            TodoError::NotFound(_) => StatusCode::NOT_FOUND,
            TodoError::Store(_) | TodoError::Query(_) | TodoError::Decode(_) => {
                error!(error = %self, "todo action failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Clone)]
pub struct TodoService {
    store: StoreBackend,
    catalog: Arc<SchemaCatalog>,
}

impl TodoService {
    pub fn new(store: StoreBackend) -> Self {
        Self {
            store,
            catalog: Arc::new(SchemaCatalog::dashboard()),
        }
    }

    /// Reads go through the same validated query path as the chat endpoint.
    fn query(&self, arguments: Value) -> Result<QueryRequest, TodoError> {
        Ok(QueryRequest::for_domain(&self.catalog, Domain::Todos, arguments)?)
    }

    pub async fn list(&self, identity: &Identity) -> Result<Vec<Todo>, TodoError> {
        let request = self.query(json!({ "table": TODOS_TABLE }))?;
        let result = self.store.execute(&self.catalog, request, identity).await?;
        result.rows.into_iter().map(decode).collect()
    }

    pub async fn add(&self, identity: &Identity, new: NewTodo) -> Result<Todo, TodoError> {
        let title = new.title.trim();
        if title.is_empty() {
            return Err(TodoError::InvalidInput("Title is required".into()));
        }
        let due_date = match new.due_date.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(date) => {
                NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| {
                    TodoError::InvalidInput(format!("due_date must be YYYY-MM-DD, got '{date}'"))
                })?;
                Some(date.to_string())
            }
        };

        let mut row = Row::new();
        row.insert("title".into(), Value::String(title.to_string()));
        row.insert(
            "priority".into(),
            Value::String(new.priority.unwrap_or_default().to_string()),
        );
        row.insert("completed".into(), Value::Bool(false));
        row.insert("due_date".into(), due_date.map_or(Value::Null, Value::String));

        let stored = self.store.insert(TODOS_TABLE, row, identity).await?;
        debug!(user_id = %identity.user_id, "todo added");
        decode(stored)
    }

    pub async fn toggle(&self, identity: &Identity, id: &str) -> Result<Todo, TodoError> {
        let current = self.get(identity, id).await?;
        self.patch(identity, id, "completed", Value::Bool(!current.completed))
            .await
    }

    pub async fn set_priority(
        &self,
        identity: &Identity,
        id: &str,
        priority: Priority,
    ) -> Result<Todo, TodoError> {
        self.patch(identity, id, "priority", Value::String(priority.to_string()))
            .await
    }

    pub async fn delete(&self, identity: &Identity, id: &str) -> Result<(), TodoError> {
        if self.store.delete(TODOS_TABLE, id, identity).await? {
            Ok(())
        } else {
            Err(TodoError::NotFound(id.to_string()))
        }
    }

    async fn get(&self, identity: &Identity, id: &str) -> Result<Todo, TodoError> {
        let request = self.query(json!({
            "table": TODOS_TABLE,
            "filters": [{ "field": "id", "operator": "eq", "value": id }],
        }))?;
        let result = self.store.execute(&self.catalog, request, identity).await?;
        match result.rows.into_iter().next() {
            Some(row) => decode(row),
            None => Err(TodoError::NotFound(id.to_string())),
        }
    }

    async fn patch(
        &self,
        identity: &Identity,
        id: &str,
        column: &str,
        value: Value,
    ) -> Result<Todo, TodoError> {
        let mut patch = Row::new();
        patch.insert(column.to_string(), value);
        match self.store.update(TODOS_TABLE, id, patch, identity).await? {
            Some(row) => decode(row),
            None => Err(TodoError::NotFound(id.to_string())),
        }
    }
}

fn decode(row: Row) -> Result<Todo, TodoError> {
    serde_json::from_value(Value::Object(row)).map_err(|e| TodoError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;

    fn service() -> TodoService {
        let store = MemoryStore::from_tables([(
            TODOS_TABLE.to_string(),
            vec![
                json!({"id": 1, "user_id": "alice", "title": "pay rent", "completed": false, "priority": "high"}),
                json!({"id": 2, "user_id": "bob", "title": "walk dog", "completed": true, "priority": "low"}),
            ],
        )])
        .unwrap();
        TodoService::new(StoreBackend::Memory(store))
    }

    fn user(id: &str) -> Identity {
        Identity::new(UserId::new(id))
    }

    fn new_todo(title: &str) -> NewTodo {
        NewTodo {
            title: title.to_string(),
            priority: None,
            due_date: None,
        }
    }

    #[test]
    fn test_priority_wire_names() {
        assert_eq!(serde_json::from_value::<Priority>(json!("high")).unwrap(), Priority::High);
        assert!(serde_json::from_value::<Priority>(json!("urgent")).is_err());
        assert_eq!(serde_json::to_value(Priority::Low).unwrap(), json!("low"));
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[tokio::test]
    async fn test_list_only_own_todos() {
        let todos = service().list(&user("alice")).await.unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].id, "1");
        assert_eq!(todos[0].priority, Priority::High);
    }

    #[tokio::test]
    async fn test_add_trims_and_defaults() {
        let service = service();
        let todo = service
            .add(&user("alice"), new_todo("  buy milk  "))
            .await
            .unwrap();
        assert_eq!(todo.title, "buy milk");
        assert_eq!(todo.priority, Priority::Medium);
        assert!(!todo.completed);
        assert_eq!(todo.user_id, UserId::new("alice"));
        assert_eq!(service.list(&user("alice")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_add_validates_input() {
        let service = service();
        let err = service.add(&user("alice"), new_todo("   ")).await.unwrap_err();
        assert!(matches!(err, TodoError::InvalidInput(msg) if msg == "Title is required"));

        let mut bad_date = new_todo("dentist");
        bad_date.due_date = Some("next tuesday".into());
        let err = service.add(&user("alice"), bad_date).await.unwrap_err();
        assert!(matches!(err, TodoError::InvalidInput(_)));

        let mut good_date = new_todo("dentist");
        good_date.due_date = Some("2026-11-02".into());
        let todo = service.add(&user("alice"), good_date).await.unwrap();
        assert_eq!(todo.due_date.as_deref(), Some("2026-11-02"));
    }

    #[tokio::test]
    async fn test_toggle_flips_completed() {
        let service = service();
        let todo = service.toggle(&user("alice"), "1").await.unwrap();
        assert!(todo.completed);
        let todo = service.toggle(&user("alice"), "1").await.unwrap();
        assert!(!todo.completed);
    }

    #[tokio::test]
    async fn test_actions_on_foreign_todo_are_not_found() {
        let service = service();
        let alice = user("alice");
        assert!(matches!(
            service.toggle(&alice, "2").await.unwrap_err(),
            TodoError::NotFound(_)
        ));
        assert!(matches!(
            service.set_priority(&alice, "2", Priority::High).await.unwrap_err(),
            TodoError::NotFound(_)
        ));
        assert!(matches!(
            service.delete(&alice, "2").await.unwrap_err(),
            TodoError::NotFound(_)
        ));
        assert_eq!(service.list(&user("bob")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_priority_and_delete() {
        let service = service();
        let alice = user("alice");
        let todo = service.set_priority(&alice, "1", Priority::Low).await.unwrap();
        assert_eq!(todo.priority, Priority::Low);

        service.delete(&alice, "1").await.unwrap();
        assert!(service.list(&alice).await.unwrap().is_empty());
    }
}
