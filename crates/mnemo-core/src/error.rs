use thiserror::Error;

/// Fatal configuration problem. Only ever raised at startup; the process
/// exits with code 64 when one reaches the composition root.
#[derive(Debug, Error)]
#[error("configuration error: {message}")]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Process exit codes used by the gateway binary.
pub mod exit {
    /// Clean shutdown.
    pub const OK: i32 = 0;
    /// Invalid or missing configuration.
    pub const CONFIG: i32 = 64;
    /// Unexpected runtime failure.
    pub const RUNTIME: i32 = 70;
    /// A required dependency (store, LLM endpoint) is unavailable.
    pub const UNAVAILABLE: i32 = 75;
}
