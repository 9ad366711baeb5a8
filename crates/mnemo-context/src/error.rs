use thiserror::Error;

use mnemo_llm::LlmError;
use mnemo_store::StoreError;

#[derive(Debug, Error)]
pub enum ContextError {
    /// The session would exceed the absolute token cap even after a full
    /// reduction. The session itself stays usable.
    #[error("session {session} over token cap: {tokens} > {cap}")]
    Overflow {
        session: String,
        tokens: u32,
        cap: u32,
    },

    #[error("session not found: {session}")]
    NotFound { session: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

pub type Result<T> = std::result::Result<T, ContextError>;
