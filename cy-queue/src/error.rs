use cy_llm::LlmError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("call failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: LlmError,
    },

    #[error("provider broke its response contract: {0}")]
    ProtocolViolation(#[source] LlmError),

    #[error("call was dropped before it resolved")]
    Abandoned,

    #[error("outcome was already taken from this handle")]
    AlreadyTaken,

    #[error("scheduler failure: {0}")]
    Scheduler(String),
}
