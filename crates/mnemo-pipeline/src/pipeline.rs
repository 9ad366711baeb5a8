use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mnemo_core::hash::user_hash;
use mnemo_core::types::InboundEvent;

use crate::limiter::RateLimiter;
use crate::orchestrator::{Orchestrator, ReplySink};

/// Canned reply for an empty inbound message.
pub const CANNED_HELP: &str =
    "Send me a message and I'll answer. I can also remember things for you: \
     try \"remember that my timezone is UTC\".";
/// Short, non-revealing reply for internal failures.
pub const CANNED_FAILURE: &str = "Something went wrong on my side. Please try again.";

/// Aggregate counters exposed through the admin surface.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub handled: u64,
    pub failed: u64,
    pub dropped_bot: u64,
    pub commands: u64,
}

/// The boundary-facing coordinator: one call per inbound event.
pub struct MessagePipeline {
    limiter: Arc<RateLimiter>,
    orchestrator: Arc<Orchestrator>,
    command_prefix: String,
    request_timeout: Duration,
    metrics_salt: String,
    handled: AtomicU64,
    failed: AtomicU64,
    dropped_bot: AtomicU64,
    commands: AtomicU64,
}

impl MessagePipeline {
    pub fn new(
        limiter: Arc<RateLimiter>,
        orchestrator: Arc<Orchestrator>,
        command_prefix: impl Into<String>,
        request_timeout: Duration,
        metrics_salt: impl Into<String>,
    ) -> Self {
        Self {
            limiter,
            orchestrator,
            command_prefix: command_prefix.into(),
            request_timeout,
            metrics_salt: metrics_salt.into(),
            handled: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped_bot: AtomicU64::new(0),
            commands: AtomicU64::new(0),
        }
    }

    /// Handle one inbound event end to end.
    ///
    /// Bot authors are dropped, rate limits are awaited (not errored), a
    /// command prefix short-circuits to the command handler, and everything
    /// else goes through the orchestrator under a per-request deadline.
    pub async fn handle(&self, event: InboundEvent, reply: Arc<dyn ReplySink>) {
        if event.is_bot {
            self.dropped_bot.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let hashed_user = user_hash(&self.metrics_salt, &event.author_id);

        // Empty input: canned help, no classification, no store writes.
        if event.text.trim().is_empty() {
            reply.send(CANNED_HELP).await;
            reply.finish().await;
            debug!(user_id_hash = %hashed_user, "empty message, sent help");
            return;
        }

        self.limiter.acquire(&event.channel_id).await;

        if let Some(rest) = event.text.strip_prefix(&self.command_prefix) {
            self.commands.fetch_add(1, Ordering::Relaxed);
            self.handle_command(rest.trim(), &reply).await;
            return;
        }

        // Per-request deadline: the watchdog cancels the token so downstream
        // work stops cooperatively (and partial output gets persisted).
        let cancel = CancellationToken::new();
        let watchdog = {
            let cancel = cancel.clone();
            let timeout = self.request_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel();
            })
        };

        let started = Instant::now();
        let result = self
            .orchestrator
            .handle(
                &event.author_id,
                &event.channel_id,
                &event.text,
                reply.as_ref(),
                &cancel,
            )
            .await;
        watchdog.abort();
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(outcome) => {
                self.handled.fetch_add(1, Ordering::Relaxed);
                // Structured turn metrics. User content is never logged;
                // the author id appears only as its salted hash.
                info!(
                    user_id_hash = %hashed_user,
                    intent = %outcome.intent,
                    confidence = outcome.confidence,
                    latency_ms,
                    tokens_in = outcome.tokens_in,
                    tokens_out = outcome.tokens_out,
                    sources_count = outcome.sources_count,
                    status = outcome.status.as_str(),
                    "turn complete"
                );
            }
            Err(e) if e.is_cancellation() => {
                self.handled.fetch_add(1, Ordering::Relaxed);
                info!(user_id_hash = %hashed_user, latency_ms, "turn cancelled");
                reply.send(CANNED_FAILURE).await;
                reply.finish().await;
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    user_id_hash = %hashed_user,
                    latency_ms,
                    error = %e,
                    "turn failed"
                );
                reply.send(CANNED_FAILURE).await;
                reply.finish().await;
            }
        }
    }

    /// Minimal built-in command handler; commands short-circuit the
    /// orchestrator entirely.
    async fn handle_command(&self, command: &str, reply: &Arc<dyn ReplySink>) {
        let response = match command.split_whitespace().next() {
            Some("help") | None => CANNED_HELP.to_string(),
            Some("ping") => "pong".to_string(),
            Some(other) => format!("Unknown command: {other}. Try {}help.", self.command_prefix),
        };
        reply.send(&response).await;
        reply.finish().await;
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped_bot: self.dropped_bot.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
        }
    }
}
