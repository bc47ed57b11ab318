//! HTTP surface.
//!
//! | Method | Path | Handler |
//! |---|---|---|
//! | GET | `/health` | liveness |
//! | POST | `/api/ai/query` | ask the assistant |
//! | GET, POST | `/api/todos` | list, add |
//! | POST | `/api/todos/{id}/toggle` | flip completion |
//! | PUT | `/api/todos/{id}/priority` | change priority |
//! | DELETE | `/api/todos/{id}` | remove |
//!
//! Every route except `/health` needs a session token, taken from
//! `Authorization: Bearer` or the session cookie.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use crate::auth::Identity;
use crate::router::{AskResponse, QueryRouter};
use crate::todos::{NewTodo, Priority, Todo, TodoError, TodoService};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    router: Arc<QueryRouter>,
    todos: TodoService,
    session_cookie: Arc<str>,
}

impl AppState {
    pub fn new(router: QueryRouter, session_cookie: &str) -> Self {
        let todos = TodoService::new(router.store().clone());
        Self {
            router: Arc::new(router),
            todos,
            session_cookie: Arc::from(session_cookie),
        }
    }

    /// Resolve the caller from the request headers.
    async fn caller(&self, headers: &HeaderMap) -> Result<Identity, Response> {
        let token = session_token(headers, &self.session_cookie);
        self.router
            .authenticate(token.as_deref())
            .await
            .map_err(IntoResponse::into_response)
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/ai/query", post(ask))
        .route("/api/todos", get(list_todos).post(add_todo))
        .route("/api/todos/{id}", delete(delete_todo))
        .route("/api/todos/{id}/toggle", post(toggle_todo))
        .route("/api/todos/{id}/priority", put(set_priority))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bearer token if present, otherwise the named cookie.
fn session_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|t| !t.is_empty())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// The body is decoded only after the caller is known.
async fn ask(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AskResponse>, Response> {
    let token = session_token(&headers, &state.session_cookie);
    state
        .router
        .handle(token.as_deref(), &body)
        .await
        .map(Json)
        .map_err(IntoResponse::into_response)
}

async fn list_todos(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Todo>>, Response> {
    let identity = state.caller(&headers).await?;
    state
        .todos
        .list(&identity)
        .await
        .map(Json)
        .map_err(IntoResponse::into_response)
}

async fn add_todo(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<NewTodo>, JsonRejection>,
) -> Result<(StatusCode, Json<Todo>), Response> {
    let identity = state.caller(&headers).await?;
    let Json(new) = body.map_err(rejected)?;
    state
        .todos
        .add(&identity, new)
        .await
        .map(|todo| (StatusCode::CREATED, Json(todo)))
        .map_err(IntoResponse::into_response)
}

async fn toggle_todo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Todo>, Response> {
    let identity = state.caller(&headers).await?;
    state
        .todos
        .toggle(&identity, &id)
        .await
        .map(Json)
        .map_err(IntoResponse::into_response)
}

#[derive(Debug, Deserialize)]
struct PriorityUpdate {
    priority: Priority,
}

async fn set_priority(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<PriorityUpdate>, JsonRejection>,
) -> Result<Json<Todo>, Response> {
    let identity = state.caller(&headers).await?;
    let Json(update) = body.map_err(rejected)?;
    state
        .todos
        .set_priority(&identity, &id, update.priority)
        .await
        .map(Json)
        .map_err(IntoResponse::into_response)
}

async fn delete_todo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, Response> {
    let identity = state.caller(&headers).await?;
    state
        .todos
        .delete(&identity, &id)
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(IntoResponse::into_response)
}

fn rejected(rejection: JsonRejection) -> Response {
    TodoError::InvalidInput(rejection.body_text()).into_response()
}
