use thiserror::Error;

use mnemo_llm::EmbeddingError;

#[derive(Debug, Error)]
pub enum IntentError {
    /// The classifier could not load or query its centroid embeddings.
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

pub type Result<T> = std::result::Result<T, IntentError>;
