//! PostgREST client for the hosted relational store.
//!
//! Reads map each [`Predicate`] to a `column=op.value` query parameter.
//! Repeated parameters on one column are combined with AND by the server,
//! which is how inclusive ranges are expressed.

use reqwest::{Method, RequestBuilder};
use serde_json::Value;

use crate::auth::Identity;
use crate::backend::{Row, StoreError};
use crate::catalog::OWNER_COLUMN;
use crate::query::{Predicate, ScopedQuery};

#[derive(Clone)]
pub struct PostgrestClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl PostgrestClient {
    /// `base_url` is the project URL; requests go to `{base_url}/rest/v1`.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, method: Method, table: &str, access_token: Option<&str>) -> RequestBuilder {
        let bearer = access_token.unwrap_or(&self.api_key);
        self.client
            .request(method, format!("{}/rest/v1/{table}", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
    }

    pub async fn select(
        &self,
        query: &ScopedQuery,
        access_token: Option<&str>,
    ) -> Result<Vec<Row>, StoreError> {
        let builder = self
            .request(Method::GET, query.table(), access_token)
            .query(&select_params(query));
        fetch_rows(builder).await
    }

    pub async fn insert(&self, table: &str, mut row: Row, identity: &Identity) -> Result<Row, StoreError> {
        row.insert(
            OWNER_COLUMN.to_string(),
            Value::String(identity.user_id.as_str().to_string()),
        );
        let builder = self
            .request(Method::POST, table, identity.access_token.as_deref())
            .header("Prefer", "return=representation")
            .json(&[row]);
        fetch_rows(builder)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Parse("insert returned no row".into()))
    }

    pub async fn update(
        &self,
        table: &str,
        id: &str,
        mut patch: Row,
        identity: &Identity,
    ) -> Result<Option<Row>, StoreError> {
        patch.remove("id");
        patch.remove(OWNER_COLUMN);
        let builder = self
            .request(Method::PATCH, table, identity.access_token.as_deref())
            .header("Prefer", "return=representation")
            .query(&row_params(id, identity))
            .json(&patch);
        Ok(fetch_rows(builder).await?.into_iter().next())
    }

    pub async fn delete(&self, table: &str, id: &str, identity: &Identity) -> Result<bool, StoreError> {
        let builder = self
            .request(Method::DELETE, table, identity.access_token.as_deref())
            .header("Prefer", "return=representation")
            .query(&row_params(id, identity));
        Ok(!fetch_rows(builder).await?.is_empty())
    }
}

async fn fetch_rows(builder: RequestBuilder) -> Result<Vec<Row>, StoreError> {
    let response = builder
        .send()
        .await
        .map_err(|e| StoreError::Http(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        // PostgREST reports errors as {"message": ..., "code": ...}.
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);
        return Err(StoreError::Rejected {
            status: status.as_u16(),
            message,
        });
    }

    response
        .json::<Vec<Row>>()
        .await
        .map_err(|e| StoreError::Parse(e.to_string()))
}

/// Query parameters for a scoped read.
pub fn select_params(query: &ScopedQuery) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), query.selection().to_select_list())];
    params.extend(query.predicates().iter().map(predicate_param));
    params
}

fn predicate_param(predicate: &Predicate) -> (String, String) {
    (
        predicate.column.clone(),
        format!("{}.{}", predicate.comparison.as_str(), encode_value(&predicate.value)),
    )
}

fn row_params(id: &str, identity: &Identity) -> Vec<(String, String)> {
    vec![
        ("id".to_string(), format!("eq.{id}")),
        (
            OWNER_COLUMN.to_string(),
            format!("eq.{}", identity.user_id.as_str()),
        ),
    ]
}

fn encode_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserId;
    use crate::catalog::{Domain, SchemaCatalog};
    use crate::query::QueryRequest;
    use axum::Json;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use serde_json::json;

    fn pair(k: &str, v: &str) -> (String, String) {
        (k.to_string(), v.to_string())
    }

    fn scoped(domain: Domain, arguments: Value, user: &str) -> ScopedQuery {
        let catalog = SchemaCatalog::dashboard();
        let request = QueryRequest::for_domain(&catalog, domain, arguments).unwrap();
        ScopedQuery::new(&catalog, request, &UserId::new(user)).unwrap()
    }

    /// Serve `app` on an ephemeral local port and return its base URL.
    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[test]
    fn test_select_params_with_between_and_owner() {
        let query = scoped(
            Domain::Budget,
            json!({
                "table": "transactions",
                "select": "amount,date",
                "filters": [
                    {"field": "category", "operator": "eq", "value": "groceries"},
                    {"field": "date", "operator": "between", "value": ["2026-09-01", "2026-09-30"]},
                    {"field": "amount", "operator": "gt", "value": 12.5}
                ]
            }),
            "u-1",
        );
        assert_eq!(
            select_params(&query),
            vec![
                pair("select", "amount,date"),
                pair("category", "eq.groceries"),
                pair("date", "gte.2026-09-01"),
                pair("date", "lte.2026-09-30"),
                pair("amount", "gt.12.5"),
                pair("user_id", "eq.u-1"),
            ]
        );
    }

    #[test]
    fn test_like_and_bool_encoding() {
        let query = scoped(
            Domain::Todos,
            json!({
                "table": "todos",
                "filters": [
                    {"field": "title", "operator": "like", "value": "%milk%"},
                    {"field": "completed", "operator": "eq", "value": false}
                ]
            }),
            "u",
        );
        let params = select_params(&query);
        assert_eq!(params[0], pair("select", "*"));
        assert_eq!(params[1], pair("title", "like.%milk%"));
        assert_eq!(params[2], pair("completed", "eq.false"));
    }

    #[test]
    fn test_row_params_scope_by_owner() {
        let identity = Identity::new(UserId::new("u-9"));
        assert_eq!(
            row_params("42", &identity),
            vec![pair("id", "eq.42"), pair("user_id", "eq.u-9")]
        );
    }

    #[tokio::test]
    async fn test_select_sends_scoped_params_and_decodes_rows() {
        let app = Router::new().route(
            "/rest/v1/todos",
            get(
                |headers: axum::http::HeaderMap,
                 axum::extract::RawQuery(query): axum::extract::RawQuery| async move {
                    let query = query.unwrap_or_default();
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    Json(json!([{"id": 1, "query": query, "auth": auth}]))
                },
            ),
        );
        let client = PostgrestClient::new(serve(app).await, "anon");

        let rows = client
            .select(&scoped(Domain::Todos, json!({"table": "todos"}), "u-1"), Some("user-jwt"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["query"], "select=*&user_id=eq.u-1");
        assert_eq!(rows[0]["auth"], "Bearer user-jwt");
    }

    #[tokio::test]
    async fn test_rejection_passes_status_and_message_through() {
        let app = Router::new().route(
            "/rest/v1/transactions",
            get(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "code": "42703",
                        "message": "column transactions.amount_cents does not exist"
                    })),
                )
            }),
        );
        let client = PostgrestClient::new(serve(app).await, "anon");
        let query = scoped(Domain::Budget, json!({"table": "transactions"}), "u");

        let err = client.select(&query, None).await.unwrap_err();
        assert!(matches!(
            &err,
            StoreError::Rejected { status: 400, message }
                if message == "column transactions.amount_cents does not exist"
        ));

        let route_err = crate::error::RouteError::from(err);
        assert_eq!(
            route_err.to_string(),
            "Query failed: Store rejected request (400): column transactions.amount_cents does not exist"
        );
    }

    #[tokio::test]
    async fn test_rejection_without_json_body_keeps_raw_text() {
        let app = Router::new().route(
            "/rest/v1/todos",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "upstream down") }),
        );
        let client = PostgrestClient::new(serve(app).await, "anon");
        let query = scoped(Domain::Todos, json!({"table": "todos"}), "u");

        let err = client.select(&query, None).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected { status: 503, message } if message == "upstream down"
        ));
    }
}
