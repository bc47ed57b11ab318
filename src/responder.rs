//! Natural-language answers grounded in fetched data or prior turns.

use thiserror::Error;

use crate::backend::QueryResult;
use crate::conversation::ConversationHistory;
use crate::llm::{ChatMessage, ChatRequest, LlmClient, LlmError};

/// Default temperature for selection and analysis calls.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// System prompt for answering the user.
pub const DATA_ANALYSIS_PROMPT: &str = r#"You are a helpful analyst for a personal dashboard covering budget, workout, nutrition, habits and todos.

Answer the user's latest message using only the data that appears in the conversation, including any "New data retrieved" turn. Cite concrete figures (totals, counts, dates) when they are available, and keep the answer short and direct.

If the conversation does not contain the figures needed to answer, say plainly that you do not have that data yet instead of estimating or inventing numbers."#;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("analysis returned no text")]
    EmptyAnswer,

    #[error("could not serialize fetched data: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The assistant turn that hands freshly fetched rows to the model.
pub fn data_turn(data: &QueryResult) -> Result<ChatMessage, serde_json::Error> {
    Ok(ChatMessage::assistant(format!(
        "New data retrieved: {}",
        serde_json::to_string(data)?
    )))
}

/// Answer `message`. With `data`, the rows are presented as an assistant
/// turn placed between the history and the new message; without it the
/// answer comes from the history alone.
pub async fn respond(
    llm: &dyn LlmClient,
    history: &ConversationHistory,
    message: &str,
    data: Option<&QueryResult>,
    temperature: f32,
) -> Result<String, AnalysisError> {
    let extra = data.map(data_turn).transpose()?;
    let request = ChatRequest::new(
        history.to_messages(DATA_ANALYSIS_PROMPT, extra, message),
        temperature,
    );

    let completion = llm.chat(&request).await?;
    match completion.text {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => Err(AnalysisError::EmptyAnswer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Row;
    use crate::conversation::DEFAULT_MAX_HISTORY;
    use crate::llm::{Completion, MockLlmClient, Role};
    use serde_json::json;

    fn rows() -> QueryResult {
        let mut row = Row::new();
        row.insert("category".into(), json!("groceries"));
        row.insert("amount".into(), json!(312.4));
        QueryResult { rows: vec![row] }
    }

    #[test]
    fn test_data_turn_format() {
        let turn = data_turn(&rows()).unwrap();
        assert_eq!(turn.role, Role::Assistant);
        let payload = turn.content.strip_prefix("New data retrieved: ").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(parsed, json!([{"category": "groceries", "amount": 312.4}]));
    }

    #[tokio::test]
    async fn test_respond_with_fresh_data() {
        let mock = MockLlmClient::new(vec![Completion::text("You spent $312.40 on groceries.")]);
        let history = ConversationHistory::default();

        let answer = respond(&mock, &history, "groceries?", Some(&rows()), DEFAULT_TEMPERATURE)
            .await
            .unwrap();
        assert_eq!(answer, "You spent $312.40 on groceries.");

        let recorded = mock.recorded();
        let messages = &recorded[0].messages;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, DATA_ANALYSIS_PROMPT);
        assert!(messages[1].content.starts_with("New data retrieved: "));
        assert_eq!(messages[2], ChatMessage::user("groceries?"));
        assert_eq!(recorded[0].temperature, DEFAULT_TEMPERATURE);
    }

    #[tokio::test]
    async fn test_respond_followup_uses_history_only() {
        let mock = MockLlmClient::new(vec![Completion::text(
            "I don't have August figures yet.",
        )]);
        let history = ConversationHistory::new(
            vec![
                ChatMessage::user("What did I spend on groceries last month?"),
                ChatMessage::assistant("You spent $312.40."),
            ],
            DEFAULT_MAX_HISTORY,
        );

        respond(&mock, &history, "and the month before?", None, DEFAULT_TEMPERATURE)
            .await
            .unwrap();

        let recorded = mock.recorded();
        let messages = &recorded[0].messages;
        assert_eq!(messages.len(), 4);
        assert!(messages.iter().all(|m| !m.content.starts_with("New data retrieved")));
    }

    #[tokio::test]
    async fn test_empty_answer_is_an_error() {
        let mock = MockLlmClient::new(vec![Completion::text("   ")]);
        let err = respond(&mock, &ConversationHistory::default(), "hi", None, DEFAULT_TEMPERATURE)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyAnswer));
    }
}
