//! Route orchestrator: one inbound message in, one answer out.
//!
//! A request walks a fixed sequence of external calls, each awaited before
//! the next is issued:
//!
//! ```text
//! identity -> classify -> { follow-up: analyze
//!                         | fresh/switch: select -> execute -> analyze }
//! ```
//!
//! Every call runs under the configured timeout. The first failure ends the
//! request; no partial result is returned.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::auth::{Identity, IdentityProvider};
use crate::backend::{QueryResult, StoreBackend};
use crate::catalog::SchemaCatalog;
use crate::conversation::{
    Classification, ConversationHistory, DEFAULT_MAX_HISTORY, ROUTER_TEMPERATURE, classify,
};
use crate::error::{RouteError, Stage};
use crate::llm::{ChatMessage, LlmClient};
use crate::responder::{DEFAULT_TEMPERATURE, respond};
use crate::selector::select_function;

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AskRequest {
    pub message: String,
    #[serde(rename = "conversationHistory", default)]
    pub conversation_history: Vec<ChatMessage>,
}

/// Successful answer. `data` is present only when rows were fetched for
/// this turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AskResponse {
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<QueryResult>,
    #[serde(rename = "type")]
    pub kind: Classification,
}

// ============================================================================
// State Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Received,
    Classified,
    FollowupAnswered,
    DataFetched,
    Analyzed,
    Responded,
    Failed,
}

impl RouteState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RouteState::Responded | RouteState::Failed)
    }

    pub fn can_advance_to(self, next: RouteState) -> bool {
        use RouteState::*;
        match (self, next) {
            (Responded | Failed, _) => false,
            (_, Failed) => true,
            (Received, Classified)
            | (Classified, FollowupAnswered)
            | (Classified, DataFetched)
            | (DataFetched, Analyzed)
            | (FollowupAnswered, Responded)
            | (Analyzed, Responded) => true,
            _ => false,
        }
    }
}

/// States visited by one request.
#[derive(Debug)]
struct RouteTrace {
    path: Vec<RouteState>,
}

impl RouteTrace {
    fn new() -> Self {
        Self {
            path: vec![RouteState::Received],
        }
    }

    fn current(&self) -> RouteState {
        self.path.last().copied().unwrap_or(RouteState::Received)
    }

    fn advance(&mut self, next: RouteState) {
        let from = self.current();
        debug_assert!(
            from.can_advance_to(next),
            "invalid route transition {from:?} -> {next:?}"
        );
        debug!(?from, to = ?next, "route transition");
        self.path.push(next);
    }
}

// ============================================================================
// Router
// ============================================================================

/// Tunables for a [`QueryRouter`].
#[derive(Debug, Clone, PartialEq)]
pub struct RouterSettings {
    pub router_temperature: f32,
    pub temperature: f32,
    pub max_history: usize,
    pub call_timeout: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            router_temperature: ROUTER_TEMPERATURE,
            temperature: DEFAULT_TEMPERATURE,
            max_history: DEFAULT_MAX_HISTORY,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Owns the collaborators a request needs. Shared across requests; holds no
/// per-request state.
pub struct QueryRouter {
    llm: Arc<dyn LlmClient>,
    store: StoreBackend,
    identity: Arc<dyn IdentityProvider>,
    catalog: SchemaCatalog,
    settings: RouterSettings,
}

impl QueryRouter {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: StoreBackend,
        identity: Arc<dyn IdentityProvider>,
        catalog: SchemaCatalog,
    ) -> Self {
        Self {
            llm,
            store,
            identity,
            catalog,
            settings: RouterSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: RouterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &StoreBackend {
        &self.store
    }

    /// Resolve the session token. A missing token, an unknown session and an
    /// identity provider failure all end in [`RouteError::Unauthorized`].
    pub async fn authenticate(&self, token: Option<&str>) -> Result<Identity, RouteError> {
        let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
            warn!("request without session token");
            return Err(RouteError::Unauthorized);
        };

        match tokio::time::timeout(self.settings.call_timeout, self.identity.current_user(token))
            .await
        {
            Err(_) => {
                error!(stage = %Stage::Identity, "external call timed out");
                Err(RouteError::Timeout {
                    stage: Stage::Identity,
                })
            }
            Ok(Ok(Some(identity))) => Ok(identity),
            Ok(Ok(None)) => {
                warn!("session token did not resolve to a user");
                Err(RouteError::Unauthorized)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "identity lookup failed");
                Err(RouteError::Unauthorized)
            }
        }
    }

    /// Full request: identity first, then body decode, then the pipeline.
    pub async fn handle(&self, token: Option<&str>, body: &[u8]) -> Result<AskResponse, RouteError> {
        let identity = self.authenticate(token).await?;
        let request: AskRequest = serde_json::from_slice(body).map_err(|e| {
            let err = RouteError::MalformedRequest(e.to_string());
            error!(user_id = %identity.user_id, error = %err, "request failed");
            err
        })?;
        self.answer(&identity, request).await
    }

    /// Run the pipeline for an authenticated caller.
    pub async fn answer(
        &self,
        identity: &Identity,
        request: AskRequest,
    ) -> Result<AskResponse, RouteError> {
        let mut trace = RouteTrace::new();
        self.answer_traced(identity, request, &mut trace).await
    }

    async fn answer_traced(
        &self,
        identity: &Identity,
        request: AskRequest,
        trace: &mut RouteTrace,
    ) -> Result<AskResponse, RouteError> {
        let result = self.run(identity, request, trace).await;
        match &result {
            Ok(response) => {
                trace.advance(RouteState::Responded);
                info!(
                    user_id = %identity.user_id,
                    classification = %response.kind,
                    rows = response.data.as_ref().map(QueryResult::len),
                    "request answered"
                );
            }
            Err(e) => {
                trace.advance(RouteState::Failed);
                error!(user_id = %identity.user_id, error = %e, "request failed");
            }
        }
        result
    }

    async fn run(
        &self,
        identity: &Identity,
        request: AskRequest,
        trace: &mut RouteTrace,
    ) -> Result<AskResponse, RouteError> {
        let message = request.message.trim();
        if message.is_empty() {
            return Err(RouteError::MalformedRequest("message must not be empty".into()));
        }
        let history =
            ConversationHistory::new(request.conversation_history, self.settings.max_history);
        let llm = self.llm.as_ref();

        let kind = self
            .call(
                Stage::Classify,
                classify(llm, &history, message, self.settings.router_temperature),
            )
            .await?;
        trace.advance(RouteState::Classified);
        debug!(user_id = %identity.user_id, classification = %kind, "classified message");

        if !kind.needs_data() {
            let response = self
                .call(
                    Stage::Analyze,
                    respond(llm, &history, message, None, self.settings.temperature),
                )
                .await?;
            trace.advance(RouteState::FollowupAnswered);
            return Ok(AskResponse {
                response,
                data: None,
                kind,
            });
        }

        let (domain, query) = self
            .call(
                Stage::Select,
                select_function(
                    llm,
                    &self.catalog,
                    message,
                    today(),
                    self.settings.temperature,
                ),
            )
            .await?;
        let table = query.table().to_string();

        let data = self
            .call(
                Stage::Execute,
                self.store.execute(&self.catalog, query, identity),
            )
            .await?;
        trace.advance(RouteState::DataFetched);
        debug!(domain = %domain, table = %table, rows = data.len(), "data fetched");

        let response = self
            .call(
                Stage::Analyze,
                respond(llm, &history, message, Some(&data), self.settings.temperature),
            )
            .await?;
        trace.advance(RouteState::Analyzed);

        Ok(AskResponse {
            response,
            data: Some(data),
            kind,
        })
    }

    /// Await one external call under the per-call timeout. Dropping the
    /// returned future cancels the call.
    async fn call<T, E>(
        &self,
        stage: Stage,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, RouteError>
    where
        RouteError: From<E>,
    {
        match tokio::time::timeout(self.settings.call_timeout, fut).await {
            Ok(result) => result.map_err(RouteError::from),
            Err(_) => Err(RouteError::Timeout { stage }),
        }
    }
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}
