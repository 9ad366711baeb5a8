pub mod agent;
pub mod citations;
pub mod error;
pub mod hints;
pub mod runtime;
pub mod variant;

pub use agent::Agent;
pub use error::AgentError;
pub use hints::{MemoryHints, SourceRef};
pub use runtime::{AgentRuntime, STUDY_AGENT_ID};
pub use variant::AgentVariant;
