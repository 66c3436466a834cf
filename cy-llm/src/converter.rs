use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, ChatRequest, ChatResponse, ToolDefinition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Anthropic,
    Local,
    Mock,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Local => "local",
            Provider::Mock => "mock",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Translates between [`ChatRequest`]/[`ChatResponse`] and one provider's wire format.
///
/// The wire format is carried as JSON so the queue can hold converters for
/// different providers behind one trait object.
#[async_trait]
pub trait ProviderConverter: Send + Sync {
    fn provider(&self) -> Provider;

    fn convert_request(&self, model: &str, request: &ChatRequest) -> Result<serde_json::Value>;

    async fn invoke(&self, wire: serde_json::Value) -> Result<serde_json::Value>;

    fn convert_response(
        &self,
        raw: serde_json::Value,
        request: &ChatRequest,
    ) -> Result<ChatResponse>;

    async fn complete(&self, model: &str, request: &ChatRequest) -> Result<ChatResponse> {
        let wire = self.convert_request(model, request)?;
        let raw = self.invoke(wire).await?;
        self.convert_response(raw, request)
    }
}

pub fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(%e, "reqwest client build failed; falling back to default client");
            reqwest::Client::new()
        })
}

/// POST `body` and return the decoded JSON body, mapping non-2xx to [`LlmError::Http`].
pub(crate) async fn post_json(
    request: reqwest::RequestBuilder,
    body: &serde_json::Value,
    label: &str,
) -> Result<serde_json::Value> {
    let response = request.json(body).send().await?;
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(LlmError::Http(format!(
            "{label} status={status} body={text}"
        )));
    }
    Ok(serde_json::from_str(&text)?)
}

/// Tool names accepted by every provider: `^[a-zA-Z0-9_-]{1,64}$`.
pub fn validate_tool_name_all_providers(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(LlmError::InvalidInput(format!(
            "tool name must be 1-64 characters, got {} ({name:?})",
            name.len()
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(LlmError::InvalidInput(format!(
            "tool name {name:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

pub(crate) struct ToolNameMap {
    pub tools: Vec<ToolDefinition>,
    /// original -> sanitized
    pub forward: HashMap<String, String>,
    /// sanitized -> original
    pub reverse: HashMap<String, String>,
}

pub(crate) fn sanitize_tools_for_openai(tools: &[ToolDefinition]) -> ToolNameMap {
    let mut used: HashMap<String, usize> = HashMap::new();
    let mut forward = HashMap::new();
    let mut reverse = HashMap::new();
    let mut out = Vec::with_capacity(tools.len());

    for t in tools {
        let mut name = sanitize_openai_tool_name(&t.name);
        if let Some(n) = used.get_mut(&name) {
            *n += 1;
            name = format!("{name}_{}", *n);
        } else {
            used.insert(name.clone(), 0);
        }
        forward.insert(t.name.clone(), name.clone());
        reverse.insert(name.clone(), t.name.clone());
        out.push(ToolDefinition {
            name,
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        });
    }

    ToolNameMap {
        tools: out,
        forward,
        reverse,
    }
}

pub(crate) fn sanitize_messages_for_openai(
    messages: &[ChatMessage],
    forward: &HashMap<String, String>,
) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        let mut m2 = m.clone();
        for tc in m2.tool_calls.iter_mut() {
            if let Some(s) = forward.get(&tc.name) {
                tc.name = s.clone();
            } else {
                // Not in the current tool list; still has to pass OpenAI validation.
                tc.name = sanitize_openai_tool_name(&tc.name);
            }
        }
        out.push(m2);
    }
    out
}

pub(crate) fn sanitize_openai_tool_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        "tool".to_string()
    } else {
        out
    }
}
