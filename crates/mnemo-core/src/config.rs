use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Vector dimension for every embedding column in the store.
pub const EMBEDDING_DIM: usize = 1536;

/// Hard ceiling on a session's token count. Reductions aim for
/// `context.max_context_tokens`; crossing this value even after a full
/// reduction is a `ContextError`.
pub const ABSOLUTE_TOKEN_CAP_FACTOR: u32 = 4;

/// Top-level config (mnemo.toml + MNEMO_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MnemoConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. `:memory:` is only valid in tests.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key for the OpenAI-compatible provider. Usually supplied via
    /// MNEMO_LLM_API_KEY rather than the TOML file.
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            embedding_dim: default_embedding_dim(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Maximum core facts per user before eviction kicks in.
    #[serde(default = "default_core_memory_max")]
    pub core_memory_max: usize,
    #[serde(default = "default_embedding_cache_size")]
    pub embedding_cache_size: usize,
    #[serde(default = "default_embedding_cache_ttl_s")]
    pub embedding_cache_ttl_s: u64,
    /// Minimum similarity for recall search hits.
    #[serde(default = "default_recall_threshold")]
    pub recall_threshold: f32,
    /// When true, the curator task promotes hot recall items to archival.
    #[serde(default)]
    pub curator_enabled: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            core_memory_max: default_core_memory_max(),
            embedding_cache_size: default_embedding_cache_size(),
            embedding_cache_ttl_s: default_embedding_cache_ttl_s(),
            recall_threshold: default_recall_threshold(),
            curator_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u32,
    #[serde(default = "default_session_idle_ttl_s")]
    pub session_idle_ttl_s: u64,
    /// Automatically reduce a session that grows past the budget.
    #[serde(default = "bool_true")]
    pub auto_reduce: bool,
    /// Offload cache capacity (messages across all sessions).
    #[serde(default = "default_offload_capacity")]
    pub offload_capacity: usize,
    #[serde(default = "default_offload_ttl_s")]
    pub offload_ttl_s: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            session_idle_ttl_s: default_session_idle_ttl_s(),
            auto_reduce: true,
            offload_capacity: default_offload_capacity(),
            offload_ttl_s: default_offload_ttl_s(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    /// Global tokens per second; bucket capacity equals the rate.
    #[serde(default = "default_rate_limit_global")]
    pub rate_limit_global: u32,
    /// Per-channel tokens per second; bucket capacity equals the rate.
    #[serde(default = "default_rate_limit_per_channel")]
    pub rate_limit_per_channel: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            rate_limit_global: default_rate_limit_global(),
            rate_limit_per_channel: default_rate_limit_per_channel(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_request_timeout_s")]
    pub request_timeout_s: u64,
    #[serde(default = "default_intent_confidence_threshold")]
    pub intent_confidence_threshold: f32,
    /// Messages starting with this prefix are dispatched to the command
    /// handler instead of the orchestrator.
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    /// Persist canned out-of-scope replies to session storage.
    #[serde(default)]
    pub persist_out_of_scope: bool,
    /// Minimum cosine similarity for graph node search.
    #[serde(default = "default_graph_min_similarity")]
    pub graph_min_similarity: f32,
    /// Salt for the HMAC user-id hash used in logs and metrics.
    #[serde(default = "default_metrics_salt")]
    pub metrics_salt: String,
    /// Seconds a destructive action waits for approval before timing out.
    #[serde(default = "default_approval_timeout_s")]
    pub approval_timeout_s: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_timeout_s: default_request_timeout_s(),
            intent_confidence_threshold: default_intent_confidence_threshold(),
            command_prefix: default_command_prefix(),
            persist_out_of_scope: false,
            graph_min_similarity: default_graph_min_similarity(),
            metrics_salt: default_metrics_salt(),
            approval_timeout_s: default_approval_timeout_s(),
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mnemo/mnemo.db", home)
}
fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_embedding_dim() -> usize {
    EMBEDDING_DIM
}
fn default_core_memory_max() -> usize {
    100
}
fn default_embedding_cache_size() -> usize {
    256
}
fn default_embedding_cache_ttl_s() -> u64 {
    300
}
fn default_recall_threshold() -> f32 {
    0.7
}
fn default_max_context_tokens() -> u32 {
    8000
}
fn default_session_idle_ttl_s() -> u64 {
    1800
}
fn default_offload_capacity() -> usize {
    512
}
fn default_offload_ttl_s() -> u64 {
    3600
}
fn default_rate_limit_global() -> u32 {
    10
}
fn default_rate_limit_per_channel() -> u32 {
    5
}
fn default_request_timeout_s() -> u64 {
    30
}
fn default_intent_confidence_threshold() -> f32 {
    0.5
}
fn default_command_prefix() -> String {
    "!".to_string()
}
fn default_graph_min_similarity() -> f32 {
    0.3
}
fn default_metrics_salt() -> String {
    "mnemo-metrics".to_string()
}
fn default_approval_timeout_s() -> u64 {
    60
}
fn bool_true() -> bool {
    true
}

impl MnemoConfig {
    /// Load config from a TOML file with MNEMO_* env var overrides,
    /// e.g. MNEMO_CONTEXT__MAX_CONTEXT_TOKENS=16000.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: MnemoConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("MNEMO_").split("__"))
            .extract()
            .map_err(|e| ConfigError::new(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Exhaustive startup validation. Every violation is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.path.is_empty() {
            return Err(ConfigError::new("store.path must not be empty"));
        }
        if self.llm.embedding_dim == 0 {
            return Err(ConfigError::new("llm.embedding_dim must be positive"));
        }
        if self.memory.core_memory_max == 0 {
            return Err(ConfigError::new("memory.core_memory_max must be positive"));
        }
        if !(0.0..=1.0).contains(&self.memory.recall_threshold) {
            return Err(ConfigError::new("memory.recall_threshold must be in [0, 1]"));
        }
        if self.context.max_context_tokens == 0 {
            return Err(ConfigError::new("context.max_context_tokens must be positive"));
        }
        if self.rate.rate_limit_global == 0 || self.rate.rate_limit_per_channel == 0 {
            return Err(ConfigError::new("rate limits must be positive"));
        }
        if !(0.0..=1.0).contains(&self.pipeline.intent_confidence_threshold) {
            return Err(ConfigError::new(
                "pipeline.intent_confidence_threshold must be in [0, 1]",
            ));
        }
        if !(-1.0..=1.0).contains(&self.pipeline.graph_min_similarity) {
            return Err(ConfigError::new(
                "pipeline.graph_min_similarity must be in [-1, 1]",
            ));
        }
        if self.pipeline.request_timeout_s == 0 {
            return Err(ConfigError::new("pipeline.request_timeout_s must be positive"));
        }
        Ok(())
    }

    /// The absolute token ceiling derived from the working budget.
    pub fn absolute_token_cap(&self) -> u32 {
        self.context.max_context_tokens * ABSOLUTE_TOKEN_CAP_FACTOR
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mnemo/mnemo.toml", home)
}
