use thiserror::Error;

use mnemo_agents::AgentError;
use mnemo_context::ContextError;
use mnemo_graph::GraphError;
use mnemo_intent::IntentError;
use mnemo_llm::LlmError;
use mnemo_memory::MemoryError;
use mnemo_store::StoreError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Intent(#[from] IntentError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Cooperative cancellation (deadline hit or caller gone). Never logged
    /// as a failure.
    #[error("request cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled
                | PipelineError::Llm(LlmError::Cancelled)
                | PipelineError::Agent(AgentError::Llm(LlmError::Cancelled))
        )
    }
}
