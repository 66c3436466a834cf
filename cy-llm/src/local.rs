//! Locally hosted models behind an OpenAI-compatible HTTP server
//! (llama.cpp `server`, vLLM, Ollama).
//!
//! These servers rarely implement native tool calling, so tools are described
//! in the system prompt and a JSON object in the reply is read back as a call.

use crate::converter::{Provider, ProviderConverter, post_json};
use crate::error::Result;
use crate::openai::{OpenAiChatRequest, OpenAiChatResponse};
use crate::types::{ChatRequest, ChatResponse, ToolCallResult, ToolChoice};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_LOCAL_BASE_URL: &str = "http://127.0.0.1:8080/v1";

#[derive(Clone)]
pub struct LocalModelConverter {
    http: reqwest::Client,
    base_url: String,
}

impl LocalModelConverter {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ProviderConverter for LocalModelConverter {
    fn provider(&self) -> Provider {
        Provider::Local
    }

    fn convert_request(&self, model: &str, request: &ChatRequest) -> Result<serde_json::Value> {
        let prompted = inline_tools(request)?;
        Ok(serde_json::to_value(OpenAiChatRequest::new(model, &prompted))?)
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn invoke(&self, wire: serde_json::Value) -> Result<serde_json::Value> {
        let request = self.http.post(format!("{}/chat/completions", self.base_url));
        post_json(request, &wire, "local chat").await
    }

    fn convert_response(
        &self,
        raw: serde_json::Value,
        request: &ChatRequest,
    ) -> Result<ChatResponse> {
        let parsed: OpenAiChatResponse = serde_json::from_value(raw)?;
        let mut response = parsed.into_chat_response(&HashMap::new(), "local")?;
        if !request.tools.is_empty() && request.tool_choice != ToolChoice::None {
            if let Some(call) = extract_tool_call(&response.content) {
                response.content.clear();
                response.tool_call_results = Some(BTreeMap::from([("0".to_string(), call)]));
            }
        }
        Ok(response)
    }
}

/// Move tool definitions into the system prompt and fold speaker names into content.
fn inline_tools(request: &ChatRequest) -> Result<ChatRequest> {
    let mut out = request.clone();
    out.tools = Vec::new();
    for m in out.messages.iter_mut() {
        if let Some(name) = m.name.take() {
            m.content = format!("{}: {}", name.to_uppercase(), m.content);
        }
    }

    if request.tools.is_empty() || request.tool_choice == ToolChoice::None {
        return Ok(out);
    }

    let instruction = match request.tool_choice {
        ToolChoice::Required => {
            "You must use one of the available tools to respond. Respond with a JSON object in the format: {\"name\": tool_name, \"parameters\": {parameter_dict}}"
        }
        _ => {
            "You can use tools when helpful. When using a tool, respond with a JSON object in the format: {\"name\": tool_name, \"parameters\": {parameter_dict}}"
        }
    };
    let schemas = serde_json::to_string_pretty(&request.tools)?;
    let mut system = out.system_message.take().unwrap_or_default();
    if !system.is_empty() {
        system.push_str("\n\n");
    }
    system.push_str(&format!(
        "-- Tool Instructions --\n{instruction}\n\nAvailable tools:\n{schemas}"
    ));
    out.system_message = Some(system);
    Ok(out)
}

fn extract_tool_call(content: &str) -> Option<ToolCallResult> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(&content[start..=end]).ok()?;
    let tool_name = value.get("name")?.as_str()?.to_string();
    let arguments = value
        .get("parameters")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));
    Some(ToolCallResult {
        tool_name,
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, ToolDefinition};
    use serde_json::json;

    fn converter() -> LocalModelConverter {
        LocalModelConverter::new(reqwest::Client::new(), "http://localhost:11434/v1/")
    }

    fn tool_request() -> ChatRequest {
        ChatRequest::new(vec![ChatMessage::user("note this").with_name("sam")])
            .with_system("be helpful")
            .with_tools(
                vec![ToolDefinition {
                    name: "add_task".to_string(),
                    description: "add a task".to_string(),
                    parameters: json!({"type": "object"}),
                }],
                ToolChoice::Auto,
            )
    }

    #[test]
    fn tools_are_described_in_system_prompt() {
        let wire = converter().convert_request("llama-3.2-3b", &tool_request()).unwrap();
        assert!(wire.get("tools").is_none());
        let system = wire["messages"][0]["content"].as_str().unwrap();
        assert!(system.starts_with("be helpful\n\n-- Tool Instructions --"));
        assert!(system.contains("add_task"));
        assert_eq!(wire["messages"][1]["content"], "SAM: note this");
    }

    #[test]
    fn json_reply_is_read_as_tool_call() {
        let raw = json!({
            "choices": [{
                "message": {"content": "Sure: {\"name\": \"add_task\", \"parameters\": {\"title\": \"milk\"}}"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 30, "completion_tokens": 9}
        });
        let resp = converter().convert_response(raw, &tool_request()).unwrap();
        assert!(resp.content.is_empty());
        assert_eq!(resp.usage.total_tokens, 39);
        let calls = resp.tool_call_results.unwrap();
        assert_eq!(calls["0"].tool_name, "add_task");
        assert_eq!(calls["0"].arguments["title"], "milk");
    }

    #[test]
    fn plain_reply_stays_text() {
        let raw = json!({
            "choices": [{"message": {"content": "no tools needed"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 3, "total_tokens": 6}
        });
        let resp = converter().convert_response(raw, &tool_request()).unwrap();
        assert_eq!(resp.content, "no tools needed");
        assert!(resp.tool_call_results.is_none());
    }
}
