pub mod app;
pub mod error;
pub mod limiter;
pub mod orchestrator;
pub mod pipeline;
pub mod tasks;

pub use app::{App, InitError};
pub use error::PipelineError;
pub use limiter::RateLimiter;
pub use orchestrator::{Orchestrator, ReplySink, TurnOutcome};
pub use pipeline::MessagePipeline;
pub use tasks::TaskRegistry;
