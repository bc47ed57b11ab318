//! Request-level error taxonomy and its HTTP mapping.
//!
//! Every pipeline failure ends up as a [`RouteError`]. Callers only ever see
//! two outcomes: 401 for a missing identity and 500 for everything else.

use std::fmt;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::backend::StoreError;
use crate::conversation::ClassifyError;
use crate::llm::LlmError;
use crate::query::ValidationError;
use crate::responder::AnalysisError;
use crate::selector::SelectError;

/// External call made while handling a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Identity,
    Classify,
    Select,
    Execute,
    Analyze,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Identity => "identity",
            Stage::Classify => "classify",
            Stage::Select => "select",
            Stage::Execute => "execute",
            Stage::Analyze => "analyze",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Could not classify message: {0}")]
    ClassificationParse(String),

    #[error("No function call received")]
    NoFunctionSelected,

    #[error("Invalid query arguments: {0}")]
    Validation(#[from] ValidationError),

    #[error("Query failed: {0}")]
    QueryExecution(StoreError),

    #[error("Analysis failed: {0}")]
    Analysis(String),

    #[error("Model request failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Timed out during {stage}")]
    Timeout { stage: Stage },
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        match self {
            RouteError::Unauthorized => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ClassifyError> for RouteError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::Llm(e) => RouteError::Llm(e),
            ClassifyError::Parse(text) => RouteError::ClassificationParse(text),
        }
    }
}

impl From<SelectError> for RouteError {
    fn from(err: SelectError) -> Self {
        match err {
            SelectError::Llm(e) => RouteError::Llm(e),
            SelectError::NoFunctionSelected => RouteError::NoFunctionSelected,
            SelectError::Validation(e) => RouteError::Validation(e),
        }
    }
}

impl From<StoreError> for RouteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(e) => RouteError::Validation(e),
            other => RouteError::QueryExecution(other),
        }
    }
}

impl From<AnalysisError> for RouteError {
    fn from(err: AnalysisError) -> Self {
        match err {
            AnalysisError::Llm(e) => RouteError::Llm(e),
            other => RouteError::Analysis(other.to_string()),
        }
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
