//! Function selection: ask the model to pick one domain function and fill
//! in its arguments, then validate them against the catalog.

use chrono::NaiveDate;
use thiserror::Error;
use tracing::debug;

use crate::catalog::{Domain, SchemaCatalog};
use crate::llm::{ChatMessage, ChatRequest, LlmClient, LlmError};
use crate::query::{QueryRequest, ValidationError};

/// System prompt for function selection. `{today}` is replaced with the
/// current date so relative ranges ("last month") can be resolved.
pub const FUNCTION_SELECTION_PROMPT: &str = r#"You are a data assistant for a personal dashboard. Today's date is {today}.

Choose exactly one of the available functions to fetch the data needed to answer the user's question, and fill in its arguments:
- Pick the table that holds the requested information.
- Use filters only on the listed fields, with the listed operators.
- For "between", give the value as a two-element array [start, end]; both ends are inclusive.
- Express dates as YYYY-MM-DD and resolve relative periods like "last month" against today's date.
- Never filter on user_id; the caller is identified automatically."#;

#[derive(Debug, Error)]
pub enum SelectError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("No function call received")]
    NoFunctionSelected,

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

pub fn selection_prompt(today: NaiveDate) -> String {
    FUNCTION_SELECTION_PROMPT.replace("{today}", &today.format("%Y-%m-%d").to_string())
}

/// Ask the model for one function call and decode it into a validated
/// [`QueryRequest`].
///
/// Only the new message is sent; the history informs classification and
/// analysis but not argument filling.
pub async fn select_function(
    llm: &dyn LlmClient,
    catalog: &SchemaCatalog,
    message: &str,
    today: NaiveDate,
    temperature: f32,
) -> Result<(Domain, QueryRequest), SelectError> {
    let request = ChatRequest::new(
        vec![
            ChatMessage::system(selection_prompt(today)),
            ChatMessage::user(message),
        ],
        temperature,
    )
    .with_functions(catalog.function_specs());

    let completion = llm.chat(&request).await?;
    let call = completion.function_call.ok_or(SelectError::NoFunctionSelected)?;
    debug!(function = %call.name, arguments = %call.arguments, "model selected function");

    let domain = Domain::from_function_name(&call.name)
        .ok_or_else(|| ValidationError::UnknownFunction(call.name.clone()))?;
    let schema = catalog
        .domain(domain)
        .ok_or_else(|| ValidationError::UnknownFunction(call.name.clone()))?;

    let query = QueryRequest::decode(schema, &call.arguments)?;
    Ok((domain, query))
}
