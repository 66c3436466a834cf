//! Network-free converter used by tests and dry runs.

use crate::converter::{Provider, ProviderConverter};
use crate::error::{LlmError, Result};
use crate::types::{ChatRequest, ChatResponse, Usage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Mock content that makes the call fail, for exercising retry paths.
pub const POISON_CONTENT: &str = "halt and catch fire";

/// Overrides for a mocked call. Anything left `None` is derived from the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockSpec {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub input_tokens: Option<u32>,
    #[serde(default)]
    pub output_tokens: Option<u32>,
}

impl MockSpec {
    pub fn echo() -> Self {
        Self::default()
    }

    pub fn poison() -> Self {
        Self::default().with_content(POISON_CONTENT)
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_tokens(mut self, input_tokens: u32, output_tokens: u32) -> Self {
        self.input_tokens = Some(input_tokens);
        self.output_tokens = Some(output_tokens);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockConverter {
    spec: MockSpec,
}

impl MockConverter {
    pub fn new(spec: MockSpec) -> Self {
        Self { spec }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MockWire {
    model: String,
    content: String,
    input_tokens: u32,
    output_tokens: u32,
}

fn char_count(s: &str) -> u32 {
    u32::try_from(s.chars().count()).unwrap_or(u32::MAX)
}

#[async_trait]
impl ProviderConverter for MockConverter {
    fn provider(&self) -> Provider {
        Provider::Mock
    }

    fn convert_request(&self, model: &str, request: &ChatRequest) -> Result<serde_json::Value> {
        let content = match self.spec.content.as_ref() {
            Some(content) => content.clone(),
            None => request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default(),
        };
        let input_tokens = self.spec.input_tokens.unwrap_or_else(|| {
            request
                .all_messages()
                .iter()
                .fold(0u32, |acc, m| acc.saturating_add(char_count(&m.content)))
        });
        let output_tokens = self
            .spec
            .output_tokens
            .unwrap_or_else(|| char_count(&content));

        Ok(serde_json::to_value(MockWire {
            model: model.to_string(),
            content,
            input_tokens,
            output_tokens,
        })?)
    }

    async fn invoke(&self, wire: serde_json::Value) -> Result<serde_json::Value> {
        let call: MockWire = serde_json::from_value(wire)?;
        if call.content == POISON_CONTENT {
            return Err(LlmError::Provider(
                "the system caught fire, as requested".to_string(),
            ));
        }
        Ok(serde_json::to_value(call)?)
    }

    fn convert_response(
        &self,
        raw: serde_json::Value,
        _request: &ChatRequest,
    ) -> Result<ChatResponse> {
        let call: MockWire = serde_json::from_value(raw)?;
        Ok(ChatResponse {
            content: call.content,
            usage: Usage::new(call.input_tokens, call.output_tokens),
            tool_call_results: None,
            finish_reason: "stop".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    #[tokio::test]
    async fn echoes_last_message_with_character_counts() {
        let request = ChatRequest::new(vec![
            ChatMessage::user("first"),
            ChatMessage::user("Test message 7"),
        ])
        .with_system("sys");
        let resp = MockConverter::default()
            .complete("gpt-4o-mini", &request)
            .await
            .unwrap();
        assert_eq!(resp.content, "Test message 7");
        assert_eq!(resp.usage.prompt_tokens, 3 + 5 + 14);
        assert_eq!(resp.usage.completion_tokens, 14);
        assert_eq!(resp.usage.total_tokens, 36);
    }

    #[tokio::test]
    async fn overrides_take_precedence() {
        let spec = MockSpec::echo().with_content("{\"tags\": []}").with_tokens(1000, 10);
        let resp = MockConverter::new(spec)
            .complete("gpt-4o", &ChatRequest::new(vec![ChatMessage::user("x")]))
            .await
            .unwrap();
        assert_eq!(resp.content, "{\"tags\": []}");
        assert_eq!(resp.usage, Usage::new(1000, 10));
    }

    #[tokio::test]
    async fn poison_content_fails() {
        let err = MockConverter::new(MockSpec::poison())
            .complete("gpt-4o", &ChatRequest::new(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Provider(_)));
        assert!(!err.is_protocol_violation());
    }
}
