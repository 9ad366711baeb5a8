pub mod embed;
pub mod error;
pub mod openai;
pub mod provider;
pub mod stream;
pub mod tokens;

pub use embed::Embedder;
pub use error::{EmbeddingError, EmbeddingErrorKind, LlmError};
pub use openai::OpenAiClient;
pub use provider::{ChatMessage, ChatRequest, ChatResponse, LlmClient, Role};
pub use stream::StreamEvent;
