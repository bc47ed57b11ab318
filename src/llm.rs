//! LLM client abstraction and chat-completion API implementations.
//!
//! This module provides a generic [`LlmClient`] trait for interacting with
//! chat-completion models, along with concrete implementations:
//!
//! - [`OpenAiClient`]: production client for the OpenAI Chat Completions API
//! - [`AnthropicClient`]: production client for Anthropic's Messages API
//! - [`MockLlmClient`]: test double for unit tests
//!
//! Requests can ask for a JSON-object answer or offer a set of callable
//! functions from which the model picks one automatically.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The provider's API key is not configured.
    #[error("{0} environment variable not set")]
    MissingApiKey(&'static str),

    /// HTTP or network error occurred.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The provider answered with a non-success status.
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// Failed to parse the API response.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Model returned neither text nor a function call.
    #[error("Model returned empty response")]
    EmptyResponse,
}

// ============================================================================
// Request / Completion Types
// ============================================================================

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single turn sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A callable function offered to the model, with a JSON Schema parameter shape.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A chat-completion request.
///
/// When `functions` is non-empty the model chooses one automatically.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub json_output: bool,
    pub functions: Vec<FunctionSpec>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>, temperature: f32) -> Self {
        Self {
            messages,
            temperature,
            json_output: false,
            functions: Vec::new(),
        }
    }

    /// Ask for a single JSON object as the answer.
    pub fn json_output(mut self) -> Self {
        self.json_output = true;
        self
    }

    /// Offer callable functions to the model.
    pub fn with_functions(mut self, functions: Vec<FunctionSpec>) -> Self {
        self.functions = functions;
        self
    }
}

/// The function the model chose, with its raw JSON argument text.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// The result of a successful LLM completion request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    /// The generated text from the model, if any.
    pub text: Option<String>,
    /// The function the model selected, if any.
    pub function_call: Option<FunctionCall>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            function_call: None,
        }
    }

    pub fn function_call(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            text: None,
            function_call: Some(FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            }),
        }
    }
}

// ============================================================================
// LlmClient Trait
// ============================================================================

/// Generic interface for chat-completion clients.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one chat completion.
    ///
    /// # Returns
    ///
    /// A [`Completion`] containing the model's text and/or function call.
    async fn chat(&self, request: &ChatRequest) -> Result<Completion, LlmError>;
}

/// Strip markdown code fences from LLM output.
pub fn strip_markdown_fences(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with("```") {
        let after_first_fence = trimmed
            .find('\n')
            .map(|i| &trimmed[i + 1..])
            .unwrap_or(trimmed);
        if let Some(end) = after_first_fence.rfind("```") {
            return after_first_fence[..end].trim().to_string();
        }
    }
    trimmed.to_string()
}

async fn send_json<T: Serialize + ?Sized>(
    builder: reqwest::RequestBuilder,
    body: &T,
) -> Result<reqwest::Response, LlmError> {
    let response = builder
        .header("content-type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| LlmError::Http(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::Api {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

// ============================================================================
// OpenAI Chat Completions Implementation
// ============================================================================

/// Client for the OpenAI Chat Completions API.
pub struct OpenAiClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

/// Default model for [`OpenAiClient`].
pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    function: OpenAiFunction,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunction {
    name: String,
    arguments: String,
}

impl OpenAiClient {
    /// Create a new client with an explicit API key and the default model.
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            model: OPENAI_DEFAULT_MODEL.to_string(),
            base_url: "https://api.openai.com".to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Send requests to another OpenAI-compatible endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

fn openai_body<'a>(model: &'a str, request: &'a ChatRequest) -> OpenAiRequest<'a> {
    let tools: Vec<Value> = request
        .functions
        .iter()
        .map(|f| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": f.name,
                    "description": f.description,
                    "parameters": f.parameters,
                }
            })
        })
        .collect();
    let tool_choice = if tools.is_empty() { None } else { Some("auto") };

    OpenAiRequest {
        model,
        temperature: request.temperature,
        messages: &request.messages,
        response_format: request
            .json_output
            .then(|| serde_json::json!({ "type": "json_object" })),
        tools,
        tool_choice,
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        let body = openai_body(&self.model, request);
        let builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key);

        let api_response: OpenAiResponse = send_json(builder, &body)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let message = api_response
            .choices
            .into_iter()
            .next()
            .ok_or(LlmError::EmptyResponse)?
            .message;

        let function_call = message.tool_calls.into_iter().next().map(|c| FunctionCall {
            name: c.function.name,
            arguments: c.function.arguments,
        });

        Ok(Completion {
            text: message.content,
            function_call,
        })
    }
}

// ============================================================================
// Anthropic API Implementation
// ============================================================================

/// Client for the Anthropic Claude API.
///
/// Makes HTTP requests to the Anthropic Messages API endpoint. Offered
/// functions are sent as tools; a `tool_use` block becomes the
/// [`Completion::function_call`].
pub struct AnthropicClient {
    api_key: String,
    model: String,
    max_tokens: u32,
    base_url: String,
    client: reqwest::Client,
}

/// Default model for [`AnthropicClient`].
pub const ANTHROPIC_DEFAULT_MODEL: &str = "claude-haiku-4-5";

const JSON_ONLY_INSTRUCTION: &str =
    "Respond with ONLY a JSON object (no markdown, no explanation).";

/// Request body for the Anthropic Messages API.
#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
}

/// Response from the Anthropic Messages API.
#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
}

/// A content block in the API response.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

impl AnthropicClient {
    /// Create a new client with an explicit API key.
    ///
    /// Uses default model `claude-haiku-4-5` and max tokens `2048`.
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            model: ANTHROPIC_DEFAULT_MODEL.to_string(),
            max_tokens: 2048,
            base_url: "https://api.anthropic.com".to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

/// Opens a conversation whose first remaining turn is the assistant's.
const CONTINUATION_TURN: &str = "(continuing our conversation)";

/// Lift system turns into the system prompt and merge consecutive turns of
/// the same role. The Messages API expects alternating roles starting with
/// a user turn, so a leading assistant turn gets a short user turn before it.
fn anthropic_body<'a>(model: &'a str, max_tokens: u32, request: &ChatRequest) -> AnthropicRequest<'a> {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut messages: Vec<ChatMessage> = Vec::new();

    for msg in &request.messages {
        if msg.role == Role::System {
            system_parts.push(&msg.content);
            continue;
        }
        match messages.last_mut() {
            Some(last) if last.role == msg.role => {
                last.content.push_str("\n\n");
                last.content.push_str(&msg.content);
            }
            _ => messages.push(msg.clone()),
        }
    }
    if messages.first().is_some_and(|m| m.role == Role::Assistant) {
        messages.insert(0, ChatMessage::user(CONTINUATION_TURN));
    }
    if request.json_output {
        system_parts.push(JSON_ONLY_INSTRUCTION);
    }

    let tools: Vec<Value> = request
        .functions
        .iter()
        .map(|f| {
            serde_json::json!({
                "name": f.name,
                "description": f.description,
                "input_schema": f.parameters,
            })
        })
        .collect();
    let tool_choice = (!tools.is_empty()).then(|| serde_json::json!({ "type": "auto" }));

    AnthropicRequest {
        model,
        max_tokens,
        temperature: request.temperature,
        system: system_parts.join("\n\n"),
        messages,
        tools,
        tool_choice,
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn chat(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        let body = anthropic_body(&self.model, self.max_tokens, request);
        let builder = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01");

        let api_response: AnthropicResponse = send_json(builder, &body)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let mut completion = Completion::default();
        for block in api_response.content {
            match block {
                ContentBlock::Text { text } if completion.text.is_none() => {
                    completion.text = Some(text);
                }
                ContentBlock::ToolUse { name, input } if completion.function_call.is_none() => {
                    completion.function_call = Some(FunctionCall {
                        name,
                        arguments: input.to_string(),
                    });
                }
                _ => {}
            }
        }

        if completion.text.is_none() && completion.function_call.is_none() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(completion)
    }
}

// ============================================================================
// Mock Implementation (Test Only)
// ============================================================================

/// Mock LLM client for testing. Returns pre-programmed completions in FIFO
/// order and records every request it receives.
#[cfg(test)]
pub struct MockLlmClient {
    /// Pre-programmed completions to return in FIFO order.
    pub responses: std::sync::Mutex<std::collections::VecDeque<Result<Completion, LlmError>>>,
    /// Requests received so far.
    pub requests: std::sync::Mutex<Vec<ChatRequest>>,
    delay: Option<std::time::Duration>,
}

#[cfg(test)]
impl MockLlmClient {
    /// Create a new mock client with a sequence of completions.
    ///
    /// # Panics
    ///
    /// [`chat`](LlmClient::chat) panics when called more times than there
    /// are responses.
    pub fn new(responses: Vec<Completion>) -> Self {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    /// Create a mock whose responses may include errors.
    pub fn with_results(responses: Vec<Result<Completion, LlmError>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into()),
            requests: std::sync::Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleep for `delay` before answering each request.
    pub fn delayed(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn recorded(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("MockLlmClient: no more responses available")
    }
}

// ============================================================================
// Tests
// ============================================================================
