use crate::handle::ResultHandle;
use crate::models::{ModelConfig, ModelTable};
use crate::queue::{ApiQueue, ConverterSet};
use crate::scheduler::QueueSettings;
use async_trait::async_trait;
use cy_llm::{
    ChatMessage, ChatRequest, ChatResponse, LlmError, Provider, ProviderConverter, Usage,
};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// 2700 rpm at 15 ticks/s: three calls per tick.
pub(crate) const TEST_MODEL: &str = "test-model";
/// 900 rpm at 15 ticks/s: one call per tick.
pub(crate) const SLOW_MODEL: &str = "slow-model";
pub(crate) const SPLIT_MODEL: &str = "split-model";

pub(crate) fn test_table() -> ModelTable {
    ModelTable::new()
        .with_model(
            TEST_MODEL,
            ModelConfig::combined(Provider::Local, 1024, 2700, 100_000),
        )
        .with_model(
            SLOW_MODEL,
            ModelConfig::combined(Provider::Local, 1024, 900, 100_000),
        )
        .with_model(
            SPLIT_MODEL,
            ModelConfig::split(Provider::Local, 1024, 2700, 100_000, 10_000),
        )
}

pub(crate) fn test_queue(converters: ConverterSet) -> ApiQueue {
    ApiQueue::new(test_table(), converters, QueueSettings::default()).unwrap()
}

pub(crate) fn request(i: usize) -> ChatRequest {
    ChatRequest::new(vec![ChatMessage::user(format!("Test message {i}"))])
}

pub(crate) fn resolved(handles: &mut [ResultHandle]) -> usize {
    handles.iter_mut().map(|h| h.is_resolved()).filter(|r| *r).count()
}

/// Local-provider stand-in that fails a set number of times before answering.
#[derive(Default)]
pub(crate) struct ScriptedConverter {
    fail_first: u32,
    omit_usage: bool,
    calls: AtomicU32,
    max_tokens_seen: Mutex<Vec<Option<u32>>>,
}

impl ScriptedConverter {
    pub(crate) fn succeeding() -> Self {
        Self::default()
    }

    pub(crate) fn failing_first(n: u32) -> Self {
        Self {
            fail_first: n,
            ..Self::default()
        }
    }

    pub(crate) fn always_failing() -> Self {
        Self::failing_first(u32::MAX)
    }

    pub(crate) fn missing_usage() -> Self {
        Self {
            omit_usage: true,
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_tokens_seen(&self) -> Vec<Option<u32>> {
        self.max_tokens_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderConverter for ScriptedConverter {
    fn provider(&self) -> Provider {
        Provider::Local
    }

    fn convert_request(
        &self,
        model: &str,
        request: &ChatRequest,
    ) -> cy_llm::Result<serde_json::Value> {
        self.max_tokens_seen
            .lock()
            .unwrap()
            .push(request.max_output_tokens);
        let content = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(serde_json::json!({ "model": model, "content": content }))
    }

    async fn invoke(&self, wire: serde_json::Value) -> cy_llm::Result<serde_json::Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_first {
            return Err(LlmError::Http("scripted status=503".to_string()));
        }
        Ok(wire)
    }

    fn convert_response(
        &self,
        raw: serde_json::Value,
        _request: &ChatRequest,
    ) -> cy_llm::Result<ChatResponse> {
        if self.omit_usage {
            return Err(LlmError::MissingUsage("scripted".to_string()));
        }
        Ok(ChatResponse {
            content: raw["content"].as_str().unwrap_or_default().to_string(),
            usage: Usage::new(10, 5),
            tool_call_results: None,
            finish_reason: "stop".to_string(),
        })
    }
}
