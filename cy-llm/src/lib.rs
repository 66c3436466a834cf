//! Provider converters for Cymbiont.
//!
//! Pure HTTP + serde: each converter maps a provider-neutral [`ChatRequest`]
//! onto one vendor's wire format and back into a [`ChatResponse`].

mod anthropic;
mod converter;
mod error;
mod local;
mod mock;
mod openai;
mod types;

pub use anthropic::AnthropicConverter;
pub use converter::{Provider, ProviderConverter, http_client, validate_tool_name_all_providers};
pub use error::{LlmError, Result};
pub use local::{DEFAULT_LOCAL_BASE_URL, LocalModelConverter};
pub use mock::{MockConverter, MockSpec, POISON_CONTENT};
pub use openai::{OPENAI_BASE_URL, OpenAiConverter};
pub use types::{
    ChatMessage, ChatRequest, ChatResponse, Role, ToolCall, ToolCallResult, ToolChoice,
    ToolDefinition, Usage,
};
