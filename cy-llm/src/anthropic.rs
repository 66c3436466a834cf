use crate::converter::{Provider, ProviderConverter, post_json};
use crate::error::{LlmError, Result};
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, Role, ToolCallResult, ToolChoice, ToolDefinition,
    Usage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Clone)]
pub struct AnthropicConverter {
    http: reqwest::Client,
    api_key: String,
    url: String,
}

impl AnthropicConverter {
    pub fn new(http: reqwest::Client, api_key: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            url: ANTHROPIC_MESSAGES_URL.to_string(),
        }
    }
}

#[async_trait]
impl ProviderConverter for AnthropicConverter {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn convert_request(&self, model: &str, request: &ChatRequest) -> Result<serde_json::Value> {
        let wire = AnthropicRequest::new(model, request);
        Ok(serde_json::to_value(wire)?)
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn invoke(&self, wire: serde_json::Value) -> Result<serde_json::Value> {
        let request = self
            .http
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION);
        post_json(request, &wire, "anthropic chat").await
    }

    fn convert_response(
        &self,
        raw: serde_json::Value,
        _request: &ChatRequest,
    ) -> Result<ChatResponse> {
        let parsed: AnthropicResponse = serde_json::from_value(raw)?;
        parsed.try_into()
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<AnthropicToolChoice>,
}

#[derive(Debug, Serialize)]
struct AnthropicToolChoice {
    r#type: String,
}

impl AnthropicRequest {
    fn new(model: &str, request: &ChatRequest) -> Self {
        let mut messages = request.all_messages();

        // Only the first system message maps onto the native field.
        let system = match messages.iter().position(|m| m.role == Role::System) {
            Some(idx) => messages.remove(idx).content.trim().to_string(),
            None => String::new(),
        };

        let tools: Vec<AnthropicTool> = request.tools.iter().map(to_anthropic_tool).collect();
        let tool_choice = if tools.is_empty() {
            None
        } else {
            let kind = match request.tool_choice {
                ToolChoice::Auto => "auto",
                ToolChoice::Required => "any",
                ToolChoice::None => "none",
            };
            Some(AnthropicToolChoice {
                r#type: kind.to_string(),
            })
        };

        Self {
            model: model.to_string(),
            max_tokens: request.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: request.temperature,
            system,
            messages: enforce_alternation(group_messages(fold_system_messages(messages))),
            tools,
            tool_choice,
        }
    }
}

/// Later system messages ride along with the next user turn.
fn fold_system_messages(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len());
    let mut pending_system: Vec<String> = Vec::new();

    for mut m in messages {
        if m.role == Role::System {
            pending_system.push(m.content);
            continue;
        }
        if m.role == Role::User {
            if let Some(name) = m.name.as_ref() {
                m.content = format!("{}: {}", name.to_uppercase(), m.content);
            }
            if !pending_system.is_empty() {
                m.content = format!("SYSTEM: {}\n\n{}", pending_system.join("\n\n"), m.content);
                pending_system.clear();
            }
        }
        out.push(m);
    }

    if !pending_system.is_empty() {
        out.push(ChatMessage::user(format!(
            "SYSTEM: {}",
            pending_system.join("\n\n")
        )));
    }
    out
}

/// Merge runs of plain-text messages that share a role and speaker.
fn group_messages(messages: Vec<ChatMessage>) -> Vec<AnthropicMessage> {
    let mut out = Vec::new();
    let mut group: Vec<ChatMessage> = Vec::new();

    for m in messages {
        let structured = m.role == Role::Tool || !m.tool_calls.is_empty();
        let same_run = group
            .first()
            .map(|g| g.role == m.role && g.name == m.name)
            .unwrap_or(false);
        if structured || !same_run {
            flush_group(&mut group, &mut out);
        }
        if structured {
            out.push(to_structured_message(&m));
        } else {
            group.push(m);
        }
    }
    flush_group(&mut group, &mut out);
    out
}

fn flush_group(group: &mut Vec<ChatMessage>, out: &mut Vec<AnthropicMessage>) {
    let Some(first) = group.first() else {
        return;
    };
    let role = first.role;
    let name = first.name.clone();
    let contents: Vec<&str> = group
        .iter()
        .map(|m| m.content.as_str())
        .filter(|c| !c.trim().is_empty())
        .collect();
    if !contents.is_empty() {
        let mut text = contents.join("\n\n");
        if role == Role::Assistant {
            if let Some(name) = name {
                text = format!("{}: {text}", name.to_uppercase());
            }
        }
        out.push(AnthropicMessage {
            role: wire_role(role).to_string(),
            content: vec![AnthropicContentBlock::Text { text }],
        });
    }
    group.clear();
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::Assistant => "assistant",
        _ => "user",
    }
}

/// The messages API requires a leading user turn and strict alternation.
fn enforce_alternation(messages: Vec<AnthropicMessage>) -> Vec<AnthropicMessage> {
    let mut out: Vec<AnthropicMessage> = Vec::with_capacity(messages.len());
    for m in messages {
        let prev = out.last().map(|p| p.role.clone());
        match prev {
            None if m.role == "assistant" => out.push(filler("user")),
            Some(prev) if prev == m.role => {
                let other = if m.role == "user" { "assistant" } else { "user" };
                out.push(filler(other));
            }
            _ => {}
        }
        out.push(m);
    }
    out
}

fn filler(role: &str) -> AnthropicMessage {
    AnthropicMessage {
        role: role.to_string(),
        content: vec![AnthropicContentBlock::Text {
            text: " ".to_string(),
        }],
    }
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

fn to_anthropic_tool(t: &ToolDefinition) -> AnthropicTool {
    AnthropicTool {
        name: t.name.clone(),
        description: t.description.clone(),
        input_schema: t.parameters.clone(),
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

fn to_structured_message(m: &ChatMessage) -> AnthropicMessage {
    if m.role == Role::Tool {
        return AnthropicMessage {
            role: "user".to_string(),
            content: vec![AnthropicContentBlock::ToolResult {
                tool_use_id: m.tool_call_id.clone().unwrap_or_default(),
                content: m.content.clone(),
            }],
        };
    }

    let mut blocks = Vec::new();
    if !m.content.trim().is_empty() {
        blocks.push(AnthropicContentBlock::Text {
            text: m.content.clone(),
        });
    }
    for tc in &m.tool_calls {
        let input = serde_json::from_str(&tc.arguments).unwrap_or_else(|_| serde_json::json!({}));
        blocks.push(AnthropicContentBlock::ToolUse {
            id: tc.id.clone(),
            name: tc.name.clone(),
            input,
        });
    }
    AnthropicMessage {
        role: wire_role(m.role).to_string(),
        content: blocks,
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl TryFrom<AnthropicResponse> for ChatResponse {
    type Error = LlmError;

    fn try_from(v: AnthropicResponse) -> Result<Self> {
        let usage = v
            .usage
            .ok_or_else(|| LlmError::MissingUsage("anthropic response has no usage".to_string()))?;

        let mut content = String::new();
        let mut tool_calls = BTreeMap::new();
        for block in v.content {
            match block {
                AnthropicContentBlock::Text { text } => content.push_str(&text),
                AnthropicContentBlock::ToolUse { id, name, input } => {
                    tool_calls.insert(
                        id,
                        ToolCallResult {
                            tool_name: name,
                            arguments: input,
                        },
                    );
                }
                AnthropicContentBlock::ToolResult { .. } => {}
            }
        }

        Ok(ChatResponse {
            content,
            usage: Usage::new(usage.input_tokens, usage.output_tokens),
            tool_call_results: Some(tool_calls).filter(|m| !m.is_empty()),
            finish_reason: v.stop_reason.unwrap_or_else(|| "unknown".to_string()),
        })
    }
}
