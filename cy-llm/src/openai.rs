use crate::converter::{
    Provider, ProviderConverter, post_json, sanitize_messages_for_openai, sanitize_tools_for_openai,
};
use crate::error::{LlmError, Result};
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, Role, ToolCallResult, ToolDefinition, Usage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAiConverter {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiConverter {
    pub fn new(http: reqwest::Client, api_key: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            base_url: OPENAI_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ProviderConverter for OpenAiConverter {
    fn provider(&self) -> Provider {
        Provider::OpenAI
    }

    fn convert_request(&self, model: &str, request: &ChatRequest) -> Result<serde_json::Value> {
        let wire = OpenAiChatRequest::new(model, request);
        Ok(serde_json::to_value(wire)?)
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn invoke(&self, wire: serde_json::Value) -> Result<serde_json::Value> {
        let request = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key);
        post_json(request, &wire, "openai chat").await
    }

    fn convert_response(
        &self,
        raw: serde_json::Value,
        request: &ChatRequest,
    ) -> Result<ChatResponse> {
        let parsed: OpenAiChatResponse = serde_json::from_value(raw)?;
        let reverse = sanitize_tools_for_openai(&request.tools).reverse;
        parsed.into_chat_response(&reverse, "openai")
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OpenAiResponseFormat>,
}

#[derive(Debug, Serialize)]
struct OpenAiResponseFormat {
    r#type: String,
}

impl OpenAiChatRequest {
    pub(crate) fn new(model: &str, request: &ChatRequest) -> Self {
        let map = sanitize_tools_for_openai(&request.tools);
        let messages = sanitize_messages_for_openai(&request.all_messages(), &map.forward);
        // o1 models reject the system role.
        let demote_system = model.starts_with("o1");

        let mut out = Self {
            model: model.to_string(),
            messages: messages
                .iter()
                .map(|m| to_openai_message(m, demote_system))
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_output_tokens,
            tools: map.tools.iter().map(to_openai_tool).collect(),
            tool_choice: None,
            response_format: None,
        };

        if !out.tools.is_empty() {
            out.tool_choice = Some(request.tool_choice.as_str().to_string());
            out.response_format = Some(OpenAiResponseFormat {
                r#type: "json_object".to_string(),
            });
        }

        out
    }
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    r#type: String,
    function: OpenAiToolFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

fn to_openai_tool(t: &ToolDefinition) -> OpenAiTool {
    OpenAiTool {
        r#type: "function".to_string(),
        function: OpenAiToolFunction {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        },
    }
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAiToolCall {
    id: String,
    r#type: String,
    function: OpenAiToolFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunctionCall {
    name: String,
    arguments: String,
}

fn to_openai_message(m: &ChatMessage, demote_system: bool) -> OpenAiMessage {
    let role = match m.role {
        Role::System if demote_system => Role::User,
        other => other,
    };
    OpenAiMessage {
        role: role.as_str().to_string(),
        content: Some(m.content.clone()).filter(|s| !s.is_empty()),
        name: m.name.clone().filter(|_| matches!(role, Role::User | Role::Assistant)),
        tool_calls: m
            .tool_calls
            .iter()
            .map(|tc| OpenAiToolCall {
                id: tc.id.clone(),
                r#type: "function".to_string(),
                function: OpenAiToolFunctionCall {
                    name: tc.name.clone(),
                    arguments: tc.arguments.clone(),
                },
            })
            .collect(),
        tool_call_id: m.tool_call_id.clone(),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiChoiceToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceToolCall {
    id: String,
    #[serde(default)]
    function: OpenAiChoiceToolCallFunction,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiChoiceToolCallFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: Option<u32>,
}

impl OpenAiChatResponse {
    pub(crate) fn into_chat_response(
        self,
        reverse: &HashMap<String, String>,
        label: &str,
    ) -> Result<ChatResponse> {
        let usage = self
            .usage
            .ok_or_else(|| LlmError::MissingUsage(format!("{label} response has no usage")))?;
        let choice = self.choices.into_iter().next().ok_or_else(|| {
            LlmError::ResponseFormat(format!("{label} response missing choices"))
        })?;
        let finish_reason = choice
            .finish_reason
            .unwrap_or_else(|| "unknown".to_string());

        let mut tool_call_results = None;
        if finish_reason == "tool_calls" && !choice.message.tool_calls.is_empty() {
            let mut results = BTreeMap::new();
            for tc in choice.message.tool_calls {
                let arguments: serde_json::Value = serde_json::from_str(&tc.function.arguments)
                    .map_err(|e| {
                        LlmError::ResponseFormat(format!(
                            "{label} tool call {} arguments are not json: {e}",
                            tc.id
                        ))
                    })?;
                let tool_name = reverse
                    .get(&tc.function.name)
                    .cloned()
                    .unwrap_or(tc.function.name);
                results.insert(tc.id, ToolCallResult { tool_name, arguments });
            }
            tool_call_results = Some(results);
        }

        let mut normalized = Usage::new(usage.prompt_tokens, usage.completion_tokens);
        if let Some(total) = usage.total_tokens {
            normalized.total_tokens = total;
        }

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            usage: normalized,
            tool_call_results,
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolChoice;
    use serde_json::json;

    fn converter() -> OpenAiConverter {
        OpenAiConverter::new(reqwest::Client::new(), "sk-test")
    }

    #[test]
    fn request_carries_system_tools_and_json_format() {
        let request = ChatRequest::new(vec![ChatMessage::user("hi").with_name("alice")])
            .with_system("be brief")
            .with_tools(
                vec![ToolDefinition {
                    name: "shell.execute".to_string(),
                    description: "run".to_string(),
                    parameters: json!({"type": "object"}),
                }],
                ToolChoice::Auto,
            )
            .with_max_output_tokens(256);

        let wire = converter().convert_request("gpt-4o", &request).unwrap();
        assert_eq!(wire["model"], "gpt-4o");
        assert_eq!(wire["max_tokens"], 256);
        assert_eq!(wire["messages"][0]["role"], "system");
        assert_eq!(wire["messages"][1]["name"], "alice");
        assert_eq!(wire["tools"][0]["function"]["name"], "shell_execute");
        assert_eq!(wire["tool_choice"], "auto");
        assert_eq!(wire["response_format"]["type"], "json_object");
    }

    #[test]
    fn o1_models_receive_system_prompt_as_user() {
        let request = ChatRequest::new(vec![ChatMessage::user("hi")]).with_system("rules");
        let wire = converter().convert_request("o1-preview", &request).unwrap();
        assert_eq!(wire["messages"][0]["role"], "user");
        assert_eq!(wire["messages"][0]["content"], "rules");
        assert!(wire.get("tools").is_none());
        assert!(wire.get("response_format").is_none());
    }

    #[test]
    fn response_maps_tool_calls_back_to_original_names() {
        let request = ChatRequest::new(vec![ChatMessage::user("ls")]).with_tools(
            vec![ToolDefinition {
                name: "shell.execute".to_string(),
                description: "run".to_string(),
                parameters: json!({}),
            }],
            ToolChoice::Auto,
        );
        let raw = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "shell_execute", "arguments": "{\"command\":\"ls\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17}
        });

        let resp = converter().convert_response(raw, &request).unwrap();
        assert_eq!(resp.usage.total_tokens, 17);
        let calls = resp.tool_call_results.expect("tool calls present");
        assert_eq!(calls["call_1"].tool_name, "shell.execute");
        assert_eq!(calls["call_1"].arguments["command"], "ls");
    }

    #[test]
    fn response_without_usage_is_a_protocol_violation() {
        let raw = json!({
            "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}]
        });
        let err = converter()
            .convert_response(raw, &ChatRequest::new(Vec::new()))
            .unwrap_err();
        assert!(err.is_protocol_violation());
    }
}
