use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mnemo_agents::{AgentRuntime, MemoryHints, SourceRef, STUDY_AGENT_ID};
use mnemo_context::{ContextEngine, MessageContent, SessionKey};
use mnemo_core::types::IntentCategory;
use mnemo_graph::KnowledgeGraph;
use mnemo_intent::{Classification, ExtractedEntities, IntentClassifier};
use mnemo_llm::{ChatMessage, Role, StreamEvent};
use mnemo_memory::{ArchivalMemory, CoreMemory, RecallMemory};

use crate::error::PipelineError;

/// Canned reply for out-of-scope intents.
pub const CANNED_OUT_OF_SCOPE: &str =
    "That's outside what I can help with. Ask me about your memories, notes, or topics.";
/// Reply when a destructive request is denied or times out.
pub const CANNED_NOT_APPROVED: &str = "That action wasn't approved, so nothing was deleted.";
/// Acknowledgement after an approved bulk delete.
pub const CANNED_DELETED: &str = "Done. I've forgotten everything I had stored for you.";

static BULK_DELETE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(forget everything|delete all my (memories|data))\s*!*\s*$")
        .expect("bulk delete pattern compiles")
});

/// Characters of a retrieved item kept in a citable source entry.
const SOURCE_EXCERPT_CHARS: usize = 240;

fn excerpt(content: &str) -> String {
    content.chars().take(SOURCE_EXCERPT_CHARS).collect()
}

/// Downstream reply surface. `send` applies backpressure: the pipeline does
/// not read further chunks until the sink accepts the current one.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send(&self, chunk: &str);
    async fn finish(&self);
}

/// Per-message state machine stages, logged at each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Received,
    Classified,
    Routed,
    Enriched,
    Generating,
    Persisted,
    Done,
    PendingApproval,
    Failed,
}

/// Final disposition of one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Complete,
    Partial,
    OutOfScope,
    Approved,
    Denied,
    ApprovalTimeout,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::OutOfScope => "out_of_scope",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::ApprovalTimeout => "timeout",
        }
    }
}

/// Everything the pipeline needs for end-of-turn metrics.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub request_id: String,
    pub intent: IntentCategory,
    pub confidence: f32,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub sources_count: usize,
    pub reply_len: usize,
    pub status: TurnStatus,
}

/// Routes a classified message to an agent, assembles memory, streams the
/// response, and persists the exchange.
pub struct Orchestrator {
    classifier: Arc<IntentClassifier>,
    runtime: Arc<AgentRuntime>,
    core: Arc<CoreMemory>,
    recall: Arc<RecallMemory>,
    archival: Arc<ArchivalMemory>,
    graph: Arc<KnowledgeGraph>,
    context: Arc<ContextEngine>,
    recall_threshold: f32,
    graph_min_similarity: f32,
    persist_out_of_scope: bool,
    approval_timeout: Duration,
    approvals: DashMap<String, oneshot::Sender<bool>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        classifier: Arc<IntentClassifier>,
        runtime: Arc<AgentRuntime>,
        core: Arc<CoreMemory>,
        recall: Arc<RecallMemory>,
        archival: Arc<ArchivalMemory>,
        graph: Arc<KnowledgeGraph>,
        context: Arc<ContextEngine>,
        recall_threshold: f32,
        graph_min_similarity: f32,
        persist_out_of_scope: bool,
        approval_timeout: Duration,
    ) -> Self {
        Self {
            classifier,
            runtime,
            core,
            recall,
            archival,
            graph,
            context,
            recall_threshold,
            graph_min_similarity,
            persist_out_of_scope,
            approval_timeout,
            approvals: DashMap::new(),
        }
    }

    /// Resolve a pending approval. Returns false when the request id is
    /// unknown (already resolved or timed out).
    pub fn approve(&self, request_id: &str, approved: bool) -> bool {
        match self.approvals.remove(request_id) {
            Some((_, tx)) => tx.send(approved).is_ok(),
            None => false,
        }
    }

    /// Pending approval request ids.
    pub fn pending_approvals(&self) -> Vec<String> {
        self.approvals.iter().map(|e| e.key().clone()).collect()
    }

    /// Run the full state machine for one inbound message.
    pub async fn handle(
        &self,
        user_id: &str,
        channel_id: &str,
        text: &str,
        reply: &dyn ReplySink,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let request_id = Uuid::new_v4().to_string();
        let mut stage = Stage::Received;
        debug!(request_id = %request_id, ?stage, "turn started");

        // RECEIVED -> CLASSIFIED. Classifier failures degrade to `unknown`.
        let classification = match self.classifier.classify(text).await {
            Ok(c) => c,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "classification failed, treating as unknown");
                Classification {
                    category: IntentCategory::Unknown,
                    confidence: 0.0,
                    entities: ExtractedEntities::default(),
                }
            }
        };
        stage = Stage::Classified;
        debug!(request_id = %request_id, ?stage, intent = %classification.category, "classified");

        // Destructive requests detour through the approval sub-state.
        if BULK_DELETE_RE.is_match(text) {
            return self
                .approval_flow(&request_id, user_id, &classification, reply, cancel)
                .await;
        }

        // CLASSIFIED -> ROUTED. out_of_scope takes the canned path.
        if classification.category == IntentCategory::OutOfScope {
            reply.send(CANNED_OUT_OF_SCOPE).await;
            reply.finish().await;
            if self.persist_out_of_scope {
                self.persist_canned(user_id, channel_id, text, CANNED_OUT_OF_SCOPE)
                    .await?;
            }
            return Ok(TurnOutcome {
                request_id,
                intent: classification.category,
                confidence: classification.confidence,
                tokens_in: 0,
                tokens_out: 0,
                sources_count: 0,
                reply_len: CANNED_OUT_OF_SCOPE.len(),
                status: TurnStatus::OutOfScope,
            });
        }

        let agent = self.runtime.select(classification.category)?;
        stage = Stage::Routed;
        debug!(request_id = %request_id, ?stage, agent = agent.id(), "routed");

        // Explicit memory stores happen before generation so the fact is
        // already retrievable while the reply streams.
        if classification.category == IntentCategory::MemoryStore {
            if let (Some(key), Some(value)) = (
                classification.entities.memory_key.as_deref(),
                classification.entities.memory_value.as_deref(),
            ) {
                self.core.add(user_id, key, value, Some(0.8), None).await?;
                info!(request_id = %request_id, "core fact stored");
            }
        }

        // ROUTED -> ENRICHED: recall and core retrieval run concurrently;
        // failures degrade to empty hints.
        let hints = self
            .enrich(user_id, text, &classification)
            .await;
        stage = Stage::Enriched;
        debug!(request_id = %request_id, ?stage, sources = hints.sources_count(), "enriched");

        // Retrieval-grounded knowledge turns run on the citation-validated
        // study agent; without citable sources the registry's knowledge
        // agent answers directly.
        let agent = if classification.category == IntentCategory::KnowledgeQuery
            && !hints.sources.is_empty()
        {
            match self.runtime.get(STUDY_AGENT_ID) {
                Some(study) => {
                    debug!(request_id = %request_id, sources = hints.sources.len(), "rerouted to study agent");
                    study
                }
                None => agent,
            }
        } else {
            agent
        };

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // Session bookkeeping for the inbound turn.
        let session_key = SessionKey::new(user_id, channel_id);
        let user_content = MessageContent::Text(text.to_string());
        let (user_seq, _) = self
            .context
            .add_message(&session_key, Role::User, user_content.clone())
            .await?;

        let history: Vec<ChatMessage> = self
            .context
            .get_context(&session_key)
            .await?
            .iter()
            .filter(|m| m.seq != user_seq)
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content.as_text(),
            })
            .collect();

        // ENRICHED -> GENERATING: stream chunks to the sink, honoring its
        // backpressure, while accumulating the full reply for persistence.
        stage = Stage::Generating;
        debug!(request_id = %request_id, ?stage, "generating");
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(16);
        let producer = {
            let agent = agent.clone();
            let hints = hints.clone();
            let message = text.to_string();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                agent
                    .process(&message, &history, &hints, tx, &cancel)
                    .await
            })
        };

        let mut reply_text = String::new();
        let mut tokens_in = 0;
        let mut tokens_out = 0;
        let mut stream_error: Option<String> = None;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::TextDelta { text } => {
                    reply.send(&text).await;
                    reply_text.push_str(&text);
                }
                StreamEvent::Done {
                    tokens_in: ti,
                    tokens_out: to,
                    ..
                } => {
                    tokens_in = ti;
                    tokens_out = to;
                }
                StreamEvent::Error { message } => stream_error = Some(message),
            }
        }
        let produced = producer
            .await
            .map_err(|e| PipelineError::Llm(mnemo_llm::LlmError::Permanent(e.to_string())))?;

        let status = if produced.is_ok() && stream_error.is_none() {
            TurnStatus::Complete
        } else if !reply_text.is_empty() {
            // Interrupted stream with output: keep what was produced.
            TurnStatus::Partial
        } else if let Err(e) = produced {
            stage = Stage::Failed;
            debug!(request_id = %request_id, ?stage, "generation failed with no output");
            return Err(e.into());
        } else {
            TurnStatus::Partial
        };

        // GENERATING -> PERSISTED: the exchange lands in one transaction;
        // interrupted streams persist what was produced, flagged partial.
        let assistant_content = MessageContent::Text(reply_text.clone());
        let (assistant_seq, _) = self
            .context
            .add_message(&session_key, Role::Assistant, assistant_content.clone())
            .await?;
        self.context
            .persist_exchange(
                &session_key,
                (user_seq, user_content),
                (assistant_seq, assistant_content),
                if status == TurnStatus::Partial {
                    "partial"
                } else {
                    "complete"
                },
            )
            .await?;
        stage = Stage::Persisted;
        debug!(request_id = %request_id, ?stage, "persisted");

        // Episodic write: best effort, the turn does not fail on it.
        if status == TurnStatus::Complete && !reply_text.is_empty() {
            if let Err(e) = self.recall.add(user_id, text, None).await {
                warn!(request_id = %request_id, error = %e, "recall write failed");
            }
        }

        reply.finish().await;
        stage = Stage::Done;
        debug!(request_id = %request_id, ?stage, "turn finished");

        Ok(TurnOutcome {
            request_id,
            intent: classification.category,
            confidence: classification.confidence,
            tokens_in,
            tokens_out,
            sources_count: hints.sources_count(),
            reply_len: reply_text.len(),
            status,
        })
    }

    /// Concurrent memory retrieval. Any failing leg logs and contributes
    /// nothing; the turn proceeds with whatever was retrieved.
    async fn enrich(
        &self,
        user_id: &str,
        text: &str,
        classification: &Classification,
    ) -> MemoryHints {
        let recall_fut = self.recall.search(user_id, text, 5, self.recall_threshold, 0.0);

        let core_fut = async {
            let mut facts = Vec::new();
            if let Some(key) = classification.entities.memory_key.as_deref() {
                if let Some(value) = self.core.get(user_id, key).await? {
                    facts.push((key.to_string(), value));
                }
            } else if classification.category == IntentCategory::MemoryRetrieve {
                for fact in self.core.list(user_id, None).await?.into_iter().take(10) {
                    facts.push((fact.key, fact.value));
                }
            }
            Ok::<_, PipelineError>(facts)
        };

        let graph_fut = async {
            if classification.category != IntentCategory::GraphQuery {
                return Ok::<_, PipelineError>(Vec::new());
            }
            let nodes = self
                .graph
                .search_nodes(user_id, text, None, 5, self.graph_min_similarity)
                .await?;
            Ok(nodes.into_iter().map(|n| n.label).collect())
        };

        // Archival matches for knowledge questions, looked up by the
        // extracted entity labels. These become citable sources.
        let archival_fut = async {
            if classification.category != IntentCategory::KnowledgeQuery {
                return Ok::<_, PipelineError>(Vec::new());
            }
            let mut items = Vec::new();
            for label in classification.entities.node_labels.iter().take(3) {
                items.extend(self.archival.search_by_content(user_id, label, 2).await?);
            }
            Ok(items)
        };

        let (recall_result, core_result, graph_result, archival_result) =
            tokio::join!(recall_fut, core_fut, graph_fut, archival_fut);

        let mut hints = MemoryHints::default();
        match recall_result {
            Ok(items) => {
                hints.recall = items
                    .into_iter()
                    .map(|i| (i.content, i.similarity.unwrap_or(0.0)))
                    .collect();
            }
            Err(e) => warn!(error = %e, "recall enrichment failed"),
        }
        match core_result {
            Ok(facts) => hints.core_facts = facts,
            Err(e) => warn!(error = %e, "core enrichment failed"),
        }
        match graph_result {
            Ok(labels) => hints.graph_labels = labels,
            Err(e) => warn!(error = %e, "graph enrichment failed"),
        }

        // Knowledge turns promote their retrieval hits into the numbered
        // source list the study agent validates citations against.
        if classification.category == IntentCategory::KnowledgeQuery {
            hints.sources = hints
                .recall
                .iter()
                .map(|(content, _)| SourceRef {
                    title: "conversation recall".to_string(),
                    content: excerpt(content),
                })
                .collect();
            match archival_result {
                Ok(items) => {
                    hints.sources.extend(items.into_iter().map(|item| SourceRef {
                        title: item.source,
                        content: excerpt(&item.content),
                    }));
                }
                Err(e) => warn!(error = %e, "archival enrichment failed"),
            }
        }
        hints
    }

    /// PENDING_APPROVAL sub-state: wait for an operator decision with a
    /// finite timeout, then act on it.
    async fn approval_flow(
        &self,
        request_id: &str,
        user_id: &str,
        classification: &Classification,
        reply: &dyn ReplySink,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, PipelineError> {
        let stage = Stage::PendingApproval;
        info!(request_id = %request_id, ?stage, "destructive request awaiting approval");

        let (tx, rx) = oneshot::channel();
        self.approvals.insert(request_id.to_string(), tx);
        reply
            .send(&format!(
                "This will permanently delete everything I remember about you. \
                 Awaiting approval (request {request_id})."
            ))
            .await;

        let decision = tokio::select! {
            result = rx => match result {
                Ok(true) => TurnStatus::Approved,
                Ok(false) => TurnStatus::Denied,
                Err(_) => TurnStatus::Denied,
            },
            _ = tokio::time::sleep(self.approval_timeout) => TurnStatus::ApprovalTimeout,
            _ = cancel.cancelled() => TurnStatus::ApprovalTimeout,
        };
        self.approvals.remove(request_id);

        let message = if decision == TurnStatus::Approved {
            for fact in self.core.list(user_id, None).await? {
                self.core.delete(user_id, &fact.key).await?;
            }
            info!(request_id = %request_id, "bulk delete executed");
            CANNED_DELETED
        } else {
            CANNED_NOT_APPROVED
        };
        reply.send(message).await;
        reply.finish().await;

        Ok(TurnOutcome {
            request_id: request_id.to_string(),
            intent: classification.category,
            confidence: classification.confidence,
            tokens_in: 0,
            tokens_out: 0,
            sources_count: 0,
            reply_len: message.len(),
            status: decision,
        })
    }

    /// Persist a canned exchange (used for out_of_scope when enabled).
    async fn persist_canned(
        &self,
        user_id: &str,
        channel_id: &str,
        text: &str,
        canned: &str,
    ) -> Result<(), PipelineError> {
        let session_key = SessionKey::new(user_id, channel_id);
        let user_content = MessageContent::Text(text.to_string());
        let canned_content = MessageContent::Text(canned.to_string());
        let (user_seq, _) = self
            .context
            .add_message(&session_key, Role::User, user_content.clone())
            .await?;
        let (canned_seq, _) = self
            .context
            .add_message(&session_key, Role::Assistant, canned_content.clone())
            .await?;
        self.context
            .persist_exchange(
                &session_key,
                (user_seq, user_content),
                (canned_seq, canned_content),
                "complete",
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_delete_patterns_match() {
        assert!(BULK_DELETE_RE.is_match("forget everything"));
        assert!(BULK_DELETE_RE.is_match("Forget everything!"));
        assert!(BULK_DELETE_RE.is_match("delete all my memories"));
        assert!(!BULK_DELETE_RE.is_match("forget my timezone"));
        assert!(!BULK_DELETE_RE.is_match("don't forget everything I told you"));
    }
}
