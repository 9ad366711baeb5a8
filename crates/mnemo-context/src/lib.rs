pub mod engine;
pub mod error;
pub mod offload;
pub mod reduce;
pub mod types;

pub use engine::{ContextEngine, SessionStats};
pub use error::ContextError;
pub use offload::{OffloadCache, OffloadKey};
pub use types::{ContentPart, MessageContent, ReductionMode, SessionKey, SessionMessage};
