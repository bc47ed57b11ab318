//! Identity resolution.
//!
//! The caller's identity always comes from an ambient session token (bearer
//! header or cookie), never from a request body. [`IdentityProvider`] turns
//! that token into an [`Identity`]:
//!
//! - [`SupabaseAuth`]: asks the hosted auth service for the current user
//! - [`StaticIdentityProvider`]: fixed token table for local and test use

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// Variable that carries the static token table.
pub const DEV_TOKENS_VAR: &str = "ASSISTANT_DEV_TOKENS";

/// Opaque id of the owning user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An authenticated caller.
///
/// `access_token` is forwarded to the backing store so its own row-level
/// policies apply as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub access_token: Option<String>,
}

impl Identity {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            access_token: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Auth service error ({status}): {body}")]
    Service { status: u16, body: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Resolves a session token to the current user.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Returns `Ok(None)` when the token does not belong to a live session.
    async fn current_user(&self, token: &str) -> Result<Option<Identity>, AuthError>;
}

// ============================================================================
// Supabase Auth
// ============================================================================

/// "Get current user" against the Supabase auth endpoint.
pub struct SupabaseAuth {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SupabaseUser {
    id: String,
}

impl SupabaseAuth {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl IdentityProvider for SupabaseAuth {
    async fn current_user(&self, token: &str) -> Result<Option<Identity>, AuthError> {
        let response = self
            .client
            .get(format!("{}/auth/v1/user", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthError::Http(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Service {
                status: status.as_u16(),
                body,
            });
        }

        let user: SupabaseUser = response
            .json()
            .await
            .map_err(|e| AuthError::Parse(e.to_string()))?;

        if user.id.is_empty() {
            return Ok(None);
        }

        Ok(Some(Identity {
            user_id: UserId::new(user.id),
            access_token: Some(token.to_string()),
        }))
    }
}

// ============================================================================
// Static tokens
// ============================================================================

/// Token table provider. Counts lookups so tests can prove whether the
/// identity step ran.
#[derive(Default)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, UserId>,
    lookups: AtomicUsize,
}

impl StaticIdentityProvider {
    pub fn new(tokens: HashMap<String, UserId>) -> Self {
        Self {
            tokens,
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn single(token: impl Into<String>, user_id: UserId) -> Self {
        Self::new(HashMap::from([(token.into(), user_id)]))
    }

    /// Parse `token=user_id` pairs separated by commas. The offending pair
    /// is reported as the invalid value.
    pub fn parse(pairs: &str) -> Result<Self, ConfigError> {
        let mut tokens = HashMap::new();
        for pair in pairs.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let invalid = || ConfigError::Invalid {
                var: DEV_TOKENS_VAR,
                value: pair.to_string(),
            };
            let (token, user) = pair.split_once('=').ok_or_else(invalid)?;
            let (token, user) = (token.trim(), user.trim());
            if token.is_empty() || user.is_empty() {
                return Err(invalid());
            }
            tokens.insert(token.to_string(), UserId::new(user));
        }
        Ok(Self::new(tokens))
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn current_user(&self, token: &str) -> Result<Option<Identity>, AuthError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.tokens.get(token).cloned().map(Identity::new))
    }
}
