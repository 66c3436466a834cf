//! Runs one released call and routes its outcome: deliver, retry, or fail.

use crate::error::QueueError;
use crate::handle::ResultSlot;
use crate::history::TokenUsageSample;
use crate::queue::Shared;
use chrono::{DateTime, Utc};
use cy_llm::{ChatRequest, ChatResponse, LlmError, MockConverter, MockSpec, ProviderConverter};
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

/// Total attempts per logical call, the first one included.
pub const MAX_ATTEMPTS: u32 = 3;

/// One logical call. Immutable once enqueued; retries share it through [`CallAttempt`].
#[derive(Debug)]
pub struct CallRequest {
    pub id: Uuid,
    pub model: String,
    pub payload: ChatRequest,
    /// `Some` bypasses the provider entirely.
    pub mock: Option<MockSpec>,
    pub enqueued_at: DateTime<Utc>,
    pub(crate) slot: ResultSlot,
}

#[derive(Debug, Clone)]
pub struct CallAttempt {
    pub call: Arc<CallRequest>,
    /// 1-based.
    pub attempt: u32,
}

impl CallAttempt {
    pub(crate) fn first(call: Arc<CallRequest>) -> Self {
        Self { call, attempt: 1 }
    }

    /// The follow-up attempt, or `None` once [`MAX_ATTEMPTS`] is spent.
    pub(crate) fn next(&self) -> Option<Self> {
        if self.attempt >= MAX_ATTEMPTS {
            return None;
        }
        Some(Self {
            call: Arc::clone(&self.call),
            attempt: self.attempt + 1,
        })
    }

    pub fn model(&self) -> &str {
        &self.call.model
    }
}

#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(call_id = %attempt.call.id, model = %attempt.call.model, attempt = attempt.attempt)
)]
pub(crate) async fn execute(shared: Arc<Shared>, attempt: CallAttempt) {
    let result = complete(&shared, &attempt.call).await;
    let call = &attempt.call;

    match result {
        Ok(response) => {
            {
                let mut state = shared.state.lock().await;
                let sample = TokenUsageSample::from_usage(&response.usage, Instant::now());
                state.history.record(&call.model, sample);
                state.ledger.record(&call.model, &response.usage);
            }
            tracing::debug!(
                prompt_tokens = response.usage.prompt_tokens,
                completion_tokens = response.usage.completion_tokens,
                "call completed"
            );
            call.slot.resolve(Ok(response));
        }
        Err(error) if error.is_protocol_violation() => {
            tracing::error!(%error, "provider response violated contract; not retrying");
            call.slot.resolve(Err(QueueError::ProtocolViolation(error)));
        }
        Err(error) => match attempt.next() {
            Some(retry) => {
                tracing::warn!(
                    %error,
                    attempt = attempt.attempt,
                    max_attempts = MAX_ATTEMPTS,
                    "call failed; re-queueing"
                );
                shared.state.lock().await.pending.push_back(retry);
            }
            None => {
                tracing::error!(%error, attempts = attempt.attempt, "call failed permanently");
                call.slot.resolve(Err(QueueError::Exhausted {
                    attempts: attempt.attempt,
                    source: error,
                }));
            }
        },
    }
}

async fn complete(shared: &Shared, call: &CallRequest) -> cy_llm::Result<ChatResponse> {
    if let Some(spec) = call.mock.as_ref() {
        return MockConverter::new(spec.clone())
            .complete(&call.model, &call.payload)
            .await;
    }
    let converter = shared
        .converter_for(&call.model)
        .map_err(|e| LlmError::InvalidInput(e.to_string()))?;
    converter.complete(&call.model, &call.payload).await
}
