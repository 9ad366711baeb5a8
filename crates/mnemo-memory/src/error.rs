use thiserror::Error;

use mnemo_llm::EmbeddingError;
use mnemo_store::StoreError;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("memory entry not found: {key}")]
    NotFound { key: String },

    #[error("invalid memory input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
