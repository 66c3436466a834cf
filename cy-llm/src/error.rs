use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    /// The provider reported success but omitted token accounting.
    #[error("response missing usage: {0}")]
    MissingUsage(String),

    #[error("provider failure: {0}")]
    Provider(String),
}

impl LlmError {
    /// Contract breaches are not worth retrying; everything else might be transient.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::MissingUsage(_))
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}
