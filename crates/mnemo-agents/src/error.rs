use thiserror::Error;

use mnemo_llm::LlmError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// One or more agents failed a lifecycle operation. Every individual
    /// failure is listed; none is masked by the others.
    #[error("agent lifecycle failed: {}", format_failures(.0))]
    Lifecycle(Vec<(String, String)>),

    #[error("no agent registered with id {id}")]
    UnknownAgent { id: String },
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(id, err)| format!("{id}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, AgentError>;
