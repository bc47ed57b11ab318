//! Backend abstraction: hosted REST store or in-process fixture store.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::auth::Identity;
use crate::catalog::SchemaCatalog;
use crate::memory_store::MemoryStore;
use crate::postgrest::PostgrestClient;
use crate::query::{QueryRequest, ScopedQuery, ValidationError};

/// One row as returned by the store.
pub type Row = Map<String, Value>;

/// Rows fetched for one request, in store order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct QueryResult {
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Errors returned by store operations. Store-side rejections are passed
/// through with their original status and message.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid like pattern '{0}'")]
    Pattern(String),

    /// The request did not fit the catalog; nothing was sent to the store.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Unified backend for data operations.
///
/// `Rest` talks to a PostgREST endpoint (Supabase). `Memory` evaluates
/// queries against fixture data held in process.
#[derive(Clone)]
pub enum StoreBackend {
    Rest(PostgrestClient),
    Memory(MemoryStore),
}

impl StoreBackend {
    /// Run `request` for `identity`. The request is checked against `catalog`
    /// and the read is always scoped to the caller; see [`ScopedQuery::new`].
    pub async fn execute(
        &self,
        catalog: &SchemaCatalog,
        request: QueryRequest,
        identity: &Identity,
    ) -> Result<QueryResult, StoreError> {
        let scoped = ScopedQuery::new(catalog, request, &identity.user_id)?;
        debug!(
            table = scoped.table(),
            predicates = scoped.predicates().len(),
            "executing scoped query"
        );

        let rows = match self {
            Self::Rest(client) => {
                client
                    .select(&scoped, identity.access_token.as_deref())
                    .await?
            }
            Self::Memory(store) => store.select(&scoped).await?,
        };
        Ok(QueryResult { rows })
    }

    /// Insert a row owned by `identity`. Returns the stored row.
    pub async fn insert(&self, table: &str, row: Row, identity: &Identity) -> Result<Row, StoreError> {
        match self {
            Self::Rest(client) => client.insert(table, row, identity).await,
            Self::Memory(store) => Ok(store.insert(table, row, &identity.user_id).await),
        }
    }

    /// Patch the caller's row with `id`. `None` when no such row is owned by
    /// the caller.
    pub async fn update(
        &self,
        table: &str,
        id: &str,
        patch: Row,
        identity: &Identity,
    ) -> Result<Option<Row>, StoreError> {
        match self {
            Self::Rest(client) => client.update(table, id, patch, identity).await,
            Self::Memory(store) => Ok(store.update(table, id, patch, &identity.user_id).await),
        }
    }

    /// Delete the caller's row with `id`. Returns whether a row was removed.
    pub async fn delete(&self, table: &str, id: &str, identity: &Identity) -> Result<bool, StoreError> {
        match self {
            Self::Rest(client) => client.delete(table, id, identity).await,
            Self::Memory(store) => Ok(store.delete(table, id, &identity.user_id).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserId;
    use crate::catalog::{Domain, OWNER_COLUMN};
    use crate::query::{Comparison, Predicate};
    use serde_json::json;

    fn backend() -> (StoreBackend, MemoryStore) {
        let store = MemoryStore::from_tables([(
            "transactions".to_string(),
            vec![
                json!({"id": "t1", "user_id": "alice", "category": "groceries", "amount": 42.5}),
                json!({"id": "t2", "user_id": "bob", "category": "groceries", "amount": 10}),
            ],
        )])
        .unwrap();
        (StoreBackend::Memory(store.clone()), store)
    }

    fn transactions(arguments: serde_json::Value) -> QueryRequest {
        QueryRequest::for_domain(&SchemaCatalog::dashboard(), Domain::Budget, arguments).unwrap()
    }

    #[tokio::test]
    async fn test_execute_is_scoped_to_identity() {
        let (backend, store) = backend();
        let identity = Identity::new(UserId::new("alice"));
        let request = transactions(json!({
            "table": "transactions",
            "filters": [{"field": "category", "operator": "eq", "value": "groceries"}]
        }));

        let result = backend
            .execute(&SchemaCatalog::dashboard(), request, &identity)
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.rows[0]["id"], "t1");

        let executed = store.executed_queries().await;
        assert_eq!(executed.len(), 1);
        assert!(executed[0].predicates().contains(&Predicate::new(
            OWNER_COLUMN,
            Comparison::Eq,
            json!("alice")
        )));
    }

    #[tokio::test]
    async fn test_execute_ignores_upstream_owner_filter() {
        let (backend, _store) = backend();
        let identity = Identity::new(UserId::new("alice"));
        let request = transactions(json!({
            "table": "transactions",
            "filters": [{"field": OWNER_COLUMN, "operator": "eq", "value": "bob"}]
        }));

        let result = backend
            .execute(&SchemaCatalog::dashboard(), request, &identity)
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.rows[0]["user_id"], "alice");
    }

    #[tokio::test]
    async fn test_execute_rejects_request_outside_catalog() {
        let (backend, store) = backend();
        let identity = Identity::new(UserId::new("alice"));
        let request = transactions(json!({"table": "transactions"}));

        // A catalog without the budget domain cannot vouch for the request.
        let empty = SchemaCatalog::new(Vec::new()).unwrap();
        let err = backend.execute(&empty, request, &identity).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Validation(ValidationError::UnknownDomain(Domain::Budget))
        ));
        assert!(store.executed_queries().await.is_empty());
    }

    #[tokio::test]
    async fn test_write_operations_are_owner_scoped() {
        let (backend, _store) = backend();
        let alice = Identity::new(UserId::new("alice"));
        let bob = Identity::new(UserId::new("bob"));

        let mut row = Row::new();
        row.insert("title".into(), json!("buy milk"));
        row.insert("user_id".into(), json!("bob"));
        let stored = backend.insert("todos", row, &alice).await.unwrap();
        assert_eq!(stored["user_id"], "alice");
        let id = stored["id"].as_str().unwrap().to_string();

        let mut patch = Row::new();
        patch.insert("completed".into(), json!(true));
        assert!(backend.update("todos", &id, patch.clone(), &bob).await.unwrap().is_none());
        assert!(backend.update("todos", &id, patch, &alice).await.unwrap().is_some());

        assert!(!backend.delete("todos", &id, &bob).await.unwrap());
        assert!(backend.delete("todos", &id, &alice).await.unwrap());
    }

    #[test]
    fn test_query_result_serializes_as_array() {
        let mut row = Row::new();
        row.insert("a".into(), json!(1));
        let result = QueryResult { rows: vec![row] };
        assert_eq!(serde_json::to_value(&result).unwrap(), json!([{"a": 1}]));
    }
}
