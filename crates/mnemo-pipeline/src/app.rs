use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::info;

use mnemo_agents::AgentRuntime;
use mnemo_context::ContextEngine;
use mnemo_core::config::MnemoConfig;
use mnemo_core::error::ConfigError;
use mnemo_core::types::InboundEvent;
use mnemo_graph::KnowledgeGraph;
use mnemo_intent::IntentClassifier;
use mnemo_llm::{Embedder, LlmClient, OpenAiClient};
use mnemo_memory::{curator::Curator, AccessBatcher, ArchivalMemory, CoreMemory, RecallMemory};
use mnemo_store::StorePool;

use crate::limiter::RateLimiter;
use crate::orchestrator::{Orchestrator, ReplySink};
use crate::pipeline::{MessagePipeline, PipelineStats};
use crate::tasks::TaskRegistry;

/// How often the access-count batcher flushes.
const ACCESS_FLUSH_PERIOD: Duration = Duration::from_secs(5);
/// How often the idle/TTL sweepers run.
const SWEEP_PERIOD: Duration = Duration::from_secs(60);
/// Curator promotion cadence.
const CURATOR_PERIOD: Duration = Duration::from_secs(900);

static APP: OnceCell<Arc<App>> = OnceCell::const_new();

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A required dependency could not be reached at startup (exit 75).
    #[error("dependency unavailable: {0}")]
    Unavailable(String),
}

/// Aggregate health snapshot for the admin surface.
#[derive(Debug, Clone)]
pub struct Health {
    pub store_ok: bool,
    pub llm_configured: bool,
    pub classifier_loaded: bool,
    pub background_tasks: Vec<String>,
    pub background_failures: usize,
}

/// Admin stats snapshot.
#[derive(Debug, Clone)]
pub struct Stats {
    pub pipeline: PipelineStats,
    pub live_sessions: usize,
    pub offloaded_messages: usize,
    pub offload_hits: u64,
    pub rate_limited_channels: usize,
    pub pending_approvals: usize,
}

/// The composition root: owns every singleton and their lifecycle.
///
/// `init` is guarded and idempotent (a second call returns the same
/// instance); `close` flushes batches, cancels background tasks, and
/// releases the pool, and is safe to call twice.
pub struct App {
    pool: StorePool,
    batcher: Arc<AccessBatcher>,
    core: Arc<CoreMemory>,
    recall: Arc<RecallMemory>,
    archival: Arc<ArchivalMemory>,
    graph: Arc<KnowledgeGraph>,
    classifier: Arc<IntentClassifier>,
    context: Arc<ContextEngine>,
    limiter: Arc<RateLimiter>,
    orchestrator: Arc<Orchestrator>,
    pipeline: Arc<MessagePipeline>,
    tasks: TaskRegistry,
}

impl App {
    /// Process-wide guarded initialization (cooperative lock with
    /// double-check via OnceCell).
    pub async fn init(config: MnemoConfig) -> Result<Arc<App>, InitError> {
        APP.get_or_try_init(|| Self::build(config)).await.cloned()
    }

    /// Build an isolated instance (tests; multiple apps in one process).
    pub async fn init_standalone(config: MnemoConfig) -> Result<Arc<App>, InitError> {
        Self::build(config).await
    }

    async fn build(config: MnemoConfig) -> Result<Arc<App>, InitError> {
        config.validate()?;

        let api_key = config
            .llm
            .api_key
            .clone()
            .ok_or_else(|| ConfigError::new("llm.api_key is required"))?;
        let client: Arc<dyn LlmClient> =
            Arc::new(OpenAiClient::new(api_key, config.llm.base_url.clone()));

        Self::build_with_client(config, client).await
    }

    /// Wiring shared by production and tests; tests inject a scripted
    /// client instead of the HTTP one.
    pub async fn build_with_client(
        config: MnemoConfig,
        client: Arc<dyn LlmClient>,
    ) -> Result<Arc<App>, InitError> {
        config.validate()?;

        let pool = if config.store.path == ":memory:" {
            StorePool::open_in_memory()
        } else {
            StorePool::open(&config.store.path)
        }
        .map_err(|e| InitError::Unavailable(e.to_string()))?;
        pool.init()
            .await
            .map_err(|e| InitError::Unavailable(e.to_string()))?;

        let embedder = Arc::new(Embedder::new(
            client.clone(),
            config.llm.embedding_model.clone(),
            config.llm.embedding_dim,
            config.memory.embedding_cache_size,
            config.memory.embedding_cache_ttl_s,
        ));

        let batcher = Arc::new(AccessBatcher::new(pool.clone()));
        let core = Arc::new(CoreMemory::new(
            pool.clone(),
            batcher.clone(),
            config.memory.core_memory_max,
        ));
        let recall = Arc::new(RecallMemory::new(
            pool.clone(),
            embedder.clone(),
            batcher.clone(),
        ));
        let archival = Arc::new(ArchivalMemory::new(pool.clone()));
        let graph = Arc::new(KnowledgeGraph::new(pool.clone(), embedder.clone()));

        let classifier = Arc::new(IntentClassifier::new(
            embedder.clone(),
            config.pipeline.intent_confidence_threshold,
        ));

        let context = Arc::new(ContextEngine::new(
            pool.clone(),
            client.clone(),
            config.llm.chat_model.clone(),
            config.context.max_context_tokens,
            config.absolute_token_cap(),
            config.context.auto_reduce,
            config.context.offload_capacity,
            config.context.offload_ttl_s,
        ));

        let runtime = Arc::new(
            AgentRuntime::with_defaults(client.clone(), &config.llm.chat_model)
                .map_err(InitError::Config)?,
        );
        runtime
            .start_all()
            .await
            .map_err(|e| InitError::Unavailable(e.to_string()))?;

        let orchestrator = Arc::new(Orchestrator::new(
            classifier.clone(),
            runtime.clone(),
            core.clone(),
            recall.clone(),
            archival.clone(),
            graph.clone(),
            context.clone(),
            config.memory.recall_threshold,
            config.pipeline.graph_min_similarity,
            config.pipeline.persist_out_of_scope,
            Duration::from_secs(config.pipeline.approval_timeout_s),
        ));

        let limiter = Arc::new(RateLimiter::new(
            config.rate.rate_limit_global,
            config.rate.rate_limit_per_channel,
        ));

        let pipeline = Arc::new(MessagePipeline::new(
            limiter.clone(),
            orchestrator.clone(),
            config.pipeline.command_prefix.clone(),
            Duration::from_secs(config.pipeline.request_timeout_s),
            config.pipeline.metrics_salt.clone(),
        ));

        let tasks = TaskRegistry::new();
        Self::register_background_tasks(
            &tasks,
            &config,
            batcher.clone(),
            context.clone(),
            limiter.clone(),
            pool.clone(),
        );

        info!("mnemo initialized");
        Ok(Arc::new(App {
            pool,
            batcher,
            core,
            recall,
            archival,
            graph,
            classifier,
            context,
            limiter,
            orchestrator,
            pipeline,
            tasks,
        }))
    }

    fn register_background_tasks(
        tasks: &TaskRegistry,
        config: &MnemoConfig,
        batcher: Arc<AccessBatcher>,
        context: Arc<ContextEngine>,
        limiter: Arc<RateLimiter>,
        pool: StorePool,
    ) {
        {
            let batcher = batcher.clone();
            tasks.spawn_interval("access-flush", ACCESS_FLUSH_PERIOD, move || {
                let batcher = batcher.clone();
                async move { batcher.flush().await.map_err(|e| e.to_string()) }
            });
        }
        {
            let context = context.clone();
            let ttl = Duration::from_secs(config.context.session_idle_ttl_s);
            tasks.spawn_interval("session-idle-sweep", SWEEP_PERIOD, move || {
                let context = context.clone();
                async move {
                    context.sweep_idle(ttl);
                    Ok(())
                }
            });
        }
        {
            let context = context.clone();
            tasks.spawn_interval("offload-ttl-sweep", SWEEP_PERIOD, move || {
                let context = context.clone();
                async move {
                    context.sweep_offload();
                    Ok(())
                }
            });
        }
        {
            let limiter = limiter.clone();
            let ttl = Duration::from_secs(config.context.session_idle_ttl_s);
            tasks.spawn_interval("channel-bucket-sweep", SWEEP_PERIOD, move || {
                let limiter = limiter.clone();
                async move {
                    limiter.sweep_idle(ttl);
                    Ok(())
                }
            });
        }
        if config.memory.curator_enabled {
            let curator = Arc::new(Curator::new(pool));
            tasks.spawn_interval("recall-curator", CURATOR_PERIOD, move || {
                let curator = curator.clone();
                async move { curator.run_once().await.map(|_| ()).map_err(|e| e.to_string()) }
            });
        }
    }

    /// The single inbound entry point.
    pub async fn handle(&self, event: InboundEvent, reply: Arc<dyn ReplySink>) {
        self.pipeline.handle(event, reply).await;
    }

    /// Resolve a pending destructive-action approval.
    pub fn approve(&self, request_id: &str, approved: bool) -> bool {
        self.orchestrator.approve(request_id, approved)
    }

    /// Pending approval request ids (admin surface).
    pub fn pending_approvals(&self) -> Vec<String> {
        self.orchestrator.pending_approvals()
    }

    /// Direct access to the memory tiers and graph for administrative and
    /// library callers.
    pub fn core_memory(&self) -> &CoreMemory {
        &self.core
    }

    pub fn recall_memory(&self) -> &RecallMemory {
        &self.recall
    }

    pub fn archival_memory(&self) -> &ArchivalMemory {
        &self.archival
    }

    pub fn knowledge_graph(&self) -> &KnowledgeGraph {
        &self.graph
    }

    pub fn stats(&self) -> Stats {
        let (live_sessions, offloaded_messages, offload_hits) = self.context.cache_stats();
        Stats {
            pipeline: self.pipeline.stats(),
            live_sessions,
            offloaded_messages,
            offload_hits,
            rate_limited_channels: self.limiter.channel_count(),
            pending_approvals: self.orchestrator.pending_approvals().len(),
        }
    }

    pub async fn health(&self) -> Health {
        let store_ok = self
            .pool
            .run(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .await
            .is_ok();
        Health {
            store_ok,
            // Construction requires a wired client, so this only flips when
            // a future provider supports hot-unloading credentials.
            llm_configured: true,
            classifier_loaded: self.classifier.is_loaded(),
            background_tasks: self.tasks.task_names(),
            background_failures: self.tasks.failures().len(),
        }
    }

    /// Shut everything down: flush pending access counters, cancel and
    /// await background tasks, release the pool. Idempotent.
    pub async fn close(&self) {
        let _ = self.batcher.flush().await;
        self.tasks.close().await;
        self.pool.close();
        info!("mnemo closed");
    }
}
