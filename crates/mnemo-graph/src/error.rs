use thiserror::Error;

use mnemo_llm::EmbeddingError;
use mnemo_store::StoreError;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("graph entity not found: {id}")]
    NotFound { id: String },

    /// Cross-user access attempt. Always surfaced, never retried.
    #[error("not authorized to touch graph entity {id}")]
    Unauthorized { id: String },

    #[error("invalid graph input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;
