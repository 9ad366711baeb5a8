use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    /// Retriable: timeouts, 429, 5xx, dropped connections.
    #[error("transient LLM failure: {0}")]
    Transient(String),

    /// Non-retriable: bad request, auth failure, unparseable response.
    #[error("permanent LLM failure: {0}")]
    Permanent(String),

    /// The caller cancelled the request; never logged as a failure.
    #[error("LLM request cancelled")]
    Cancelled,
}

impl LlmError {
    /// Classify an HTTP status: 429 and 5xx are worth retrying.
    pub fn from_status(status: u16, body: String) -> Self {
        if status == 429 || status >= 500 {
            LlmError::Transient(format!("API error {status}: {body}"))
        } else {
            LlmError::Permanent(format!("API error {status}: {body}"))
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        // Network-level failures are transient by nature; response decoding
        // problems are not.
        if err.is_decode() {
            LlmError::Permanent(err.to_string())
        } else {
            LlmError::Transient(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingErrorKind {
    Transient,
    Permanent,
}

impl std::fmt::Display for EmbeddingErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

/// Embedding failure carrying enough context to decide on a retry without
/// logging the text itself.
#[derive(Debug, Error)]
#[error("{kind} embedding failure for {model} ({text_len} chars): {message}")]
pub struct EmbeddingError {
    pub kind: EmbeddingErrorKind,
    pub model: String,
    pub text_len: usize,
    pub message: String,
}

impl EmbeddingError {
    pub fn transient(model: &str, text_len: usize, message: impl Into<String>) -> Self {
        Self {
            kind: EmbeddingErrorKind::Transient,
            model: model.to_string(),
            text_len,
            message: message.into(),
        }
    }

    pub fn permanent(model: &str, text_len: usize, message: impl Into<String>) -> Self {
        Self {
            kind: EmbeddingErrorKind::Permanent,
            model: model.to_string(),
            text_len,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == EmbeddingErrorKind::Transient
    }
}
