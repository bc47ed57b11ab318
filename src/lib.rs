//! Dashboard assistant: shared library for the HTTP service and CLI.

pub mod auth;
pub mod backend;
pub mod catalog;
pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod memory_store;
pub mod postgrest;
pub mod query;
pub mod responder;
pub mod router;
pub mod selector;
pub mod server;
pub mod todos;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::auth::{DEV_TOKENS_VAR, IdentityProvider, StaticIdentityProvider, SupabaseAuth};
use crate::backend::{StoreBackend, StoreError};
use crate::catalog::SchemaCatalog;
use crate::config::{ConfigError, LlmProvider, LlmSettings, Settings, StoreSettings};
use crate::llm::{AnthropicClient, LlmClient, LlmError, OpenAiClient};
use crate::memory_store::MemoryStore;
use crate::postgrest::PostgrestClient;
use crate::router::QueryRouter;

/// Fixture location used when `ASSISTANT_FIXTURE` is not set.
pub fn default_fixture_path() -> PathBuf {
    let data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    data_dir.join("dashboard-assistant").join("fixture.json")
}

/// Open the configured store: the hosted REST store when Supabase is
/// configured, otherwise the fixture-backed in-process store.
pub fn connect_backend(store: &StoreSettings) -> Result<StoreBackend, StoreError> {
    match store {
        StoreSettings::Supabase { url, anon_key } => {
            info!(url = %url, "using Supabase REST store");
            Ok(StoreBackend::Rest(PostgrestClient::new(url, anon_key)))
        }
        StoreSettings::Fixture { path } => {
            if !path.exists() {
                warn!(path = %path.display(), "fixture not found, starting with an empty store");
            } else {
                info!(path = %path.display(), "using fixture store");
            }
            Ok(StoreBackend::Memory(MemoryStore::from_fixture(path)?))
        }
    }
}

/// Build the chat-completion client for the selected provider.
pub fn build_llm(settings: &LlmSettings) -> Result<Arc<dyn LlmClient>, LlmError> {
    let api_key = settings
        .api_key
        .clone()
        .ok_or(LlmError::MissingApiKey(settings.provider.api_key_var()))?;

    let client: Arc<dyn LlmClient> = match settings.provider {
        LlmProvider::OpenAi => {
            let client = OpenAiClient::new(api_key);
            Arc::new(match &settings.model {
                Some(model) => client.with_model(model),
                None => client,
            })
        }
        LlmProvider::Anthropic => {
            let client = AnthropicClient::new(api_key);
            Arc::new(match &settings.model {
                Some(model) => client.with_model(model),
                None => client,
            })
        }
    };
    Ok(client)
}

/// Supabase auth alongside the REST store; the static token table otherwise.
pub fn build_identity_provider(
    settings: &Settings,
) -> Result<Arc<dyn IdentityProvider>, ConfigError> {
    match &settings.store {
        StoreSettings::Supabase { url, anon_key } => Ok(Arc::new(SupabaseAuth::new(url, anon_key))),
        StoreSettings::Fixture { .. } => {
            let provider = StaticIdentityProvider::parse(&settings.dev_tokens)?;
            if settings.dev_tokens.is_empty() {
                warn!("{DEV_TOKENS_VAR} is empty; every request will be unauthorized");
            }
            Ok(Arc::new(provider))
        }
    }
}

/// Assemble a [`QueryRouter`] from settings.
pub fn build_router(settings: &Settings) -> Result<QueryRouter, Box<dyn std::error::Error>> {
    let llm = build_llm(&settings.llm)?;
    let store = connect_backend(&settings.store)?;
    let identity = build_identity_provider(settings)?;
    Ok(QueryRouter::new(llm, store, identity, SchemaCatalog::dashboard())
        .with_settings(settings.router.clone()))
}
