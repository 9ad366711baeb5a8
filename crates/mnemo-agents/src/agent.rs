use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use mnemo_llm::{ChatMessage, ChatRequest, LlmClient, StreamEvent};

use crate::citations::invalid_citations;
use crate::error::{AgentError, Result};
use crate::hints::MemoryHints;
use crate::variant::AgentVariant;

/// Refusal emitted when a Study answer carries citations that do not
/// validate against the retrieved sources.
const STUDY_REFUSAL: &str =
    "I can't answer that reliably: my draft cited sources that aren't in the \
     retrieved material.";

/// One configured agent: a variant over the shared LLM client.
pub struct Agent {
    id: String,
    variant: AgentVariant,
    client: Arc<dyn LlmClient>,
    model: String,
    started: AtomicBool,
}

impl Agent {
    pub fn new(
        id: impl Into<String>,
        variant: AgentVariant,
        client: Arc<dyn LlmClient>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            variant,
            client,
            model: model.into(),
            started: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn variant(&self) -> AgentVariant {
        self.variant
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Bring the agent up. Idempotent; fails when the agent is misconfigured.
    pub async fn start(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(AgentError::Llm(mnemo_llm::LlmError::Permanent(format!(
                "agent {} has no model configured",
                self.id
            ))));
        }
        self.started.store(true, Ordering::SeqCst);
        info!(agent = %self.id, variant = %self.variant, "agent started");
        Ok(())
    }

    /// Tear the agent down. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        self.started.store(false, Ordering::SeqCst);
        info!(agent = %self.id, "agent stopped");
        Ok(())
    }

    /// Process one message: stream text chunks to `tx`.
    ///
    /// Streaming variants forward deltas as they arrive. Study buffers the
    /// whole answer, validates its citations against the retrieved sources,
    /// and emits either the validated answer or an explicit refusal.
    #[instrument(skip(self, context, hints, tx, cancel), fields(agent = %self.id))]
    pub async fn process(
        &self,
        message: &str,
        context: &[ChatMessage],
        hints: &MemoryHints,
        tx: mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let req = self.build_request(message, context, hints);

        if self.variant.streams() {
            self.client.chat_stream(&req, tx, cancel).await?;
            return Ok(());
        }

        // Study path: full response first, then citation validation.
        let response = tokio::select! {
            r = self.client.chat(&req) => r?,
            _ = cancel.cancelled() => return Err(AgentError::Llm(mnemo_llm::LlmError::Cancelled)),
        };

        let invalid = invalid_citations(&response.content, hints.sources.len());
        let text = if invalid.is_empty() {
            response.content
        } else {
            info!(agent = %self.id, ?invalid, "citations failed validation, refusing");
            STUDY_REFUSAL.to_string()
        };

        let _ = tx.send(StreamEvent::TextDelta { text }).await;
        let _ = tx
            .send(StreamEvent::Done {
                model: response.model,
                tokens_in: response.tokens_in,
                tokens_out: response.tokens_out,
                stop_reason: response.stop_reason,
            })
            .await;
        Ok(())
    }

    fn build_request(
        &self,
        message: &str,
        context: &[ChatMessage],
        hints: &MemoryHints,
    ) -> ChatRequest {
        let mut system = self.variant.instructions().to_string();
        system.push_str(&hints.render());

        let mut messages = context.to_vec();
        messages.push(ChatMessage {
            role: mnemo_llm::Role::User,
            content: message.to_string(),
        });

        ChatRequest {
            model: self.model.clone(),
            system,
            messages,
            temperature: self.variant.temperature(),
            max_tokens: self.variant.max_tokens(),
            stream: self.variant.streams(),
        }
    }
}
