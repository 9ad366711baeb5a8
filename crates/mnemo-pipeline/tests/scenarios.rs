//! End-to-end pipeline scenarios over an in-memory store and a scripted
//! LLM client. The client echoes injected memory context back, so these
//! tests observe the full path: classify -> route -> enrich -> generate ->
//! persist.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use mnemo_core::config::MnemoConfig;
use mnemo_core::types::InboundEvent;
use mnemo_llm::{ChatRequest, ChatResponse, EmbeddingError, LlmClient, LlmError};
use mnemo_pipeline::orchestrator::CANNED_OUT_OF_SCOPE;
use mnemo_pipeline::pipeline::CANNED_HELP;
use mnemo_pipeline::{App, ReplySink};

const VOCAB: &[&str] = &[
    "hello", "hi", "morning", "goodbye", "bye", "thank", "thanks", "help", "commands", "status",
    "online", "explain", "what", "history", "remember", "save", "timezone", "favorite",
    "schedule", "related", "path", "connects", "joke", "weather", "pizza", "money", "call",
    "order", "transfer", "editor", "shifts", "did", "tell", "you",
];

/// Deterministic bag-of-words embeddings plus a chat that echoes any
/// injected user facts, so replies prove hint injection happened.
struct ScriptedClient;

#[async_trait]
impl LlmClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let reply = if req.system.contains("Sources:") {
            // Citation-grounded answer: references the first source.
            "Based on [1], we've covered this before.".to_string()
        } else if let Some(pos) = req.system.find("Known facts about the user:") {
            let facts = req.system[pos..]
                .lines()
                .skip(1)
                .take_while(|l| l.starts_with("- "))
                .collect::<Vec<_>>()
                .join("; ");
            format!("Here's what I know: {facts}")
        } else {
            "Happy to help!".to_string()
        };
        Ok(ChatResponse {
            content: reply,
            model: req.model.clone(),
            tokens_in: 12,
            tokens_out: 6,
            stop_reason: "stop".to_string(),
        })
    }

    async fn embed(&self, text: &str, _model: &str) -> Result<Vec<f32>, EmbeddingError> {
        let lower = text.to_lowercase();
        let mut v = vec![0.0_f32; VOCAB.len()];
        for (i, word) in VOCAB.iter().enumerate() {
            if lower.contains(word) {
                v[i] = 1.0;
            }
        }
        if v.iter().all(|x| *x == 0.0) {
            v[0] = 0.01;
        }
        Ok(v)
    }
}

#[derive(Default)]
struct CollectingSink {
    text: Mutex<String>,
    finished: AtomicBool,
}

#[async_trait]
impl ReplySink for CollectingSink {
    async fn send(&self, chunk: &str) {
        self.text.lock().await.push_str(chunk);
    }

    async fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

impl CollectingSink {
    async fn text(&self) -> String {
        self.text.lock().await.clone()
    }
}

fn test_config() -> MnemoConfig {
    let mut config = MnemoConfig::default();
    config.store.path = ":memory:".to_string();
    config.llm.embedding_dim = VOCAB.len();
    config.pipeline.intent_confidence_threshold = 0.2;
    config.pipeline.approval_timeout_s = 1;
    config
}

async fn app() -> Arc<App> {
    App::build_with_client(test_config(), Arc::new(ScriptedClient))
        .await
        .expect("app builds")
}

fn event(author: &str, text: &str) -> InboundEvent {
    InboundEvent {
        author_id: author.to_string(),
        channel_id: "chan-1".to_string(),
        is_dm: false,
        text: text.to_string(),
        is_bot: false,
    }
}

async fn send(app: &App, author: &str, text: &str) -> String {
    let sink = Arc::new(CollectingSink::default());
    app.handle(event(author, text), sink.clone()).await;
    assert!(sink.finished.load(Ordering::SeqCst), "sink must be finished");
    sink.text().await
}

#[tokio::test]
async fn scenario_store_then_retrieve_timezone() {
    let app = app().await;

    send(&app, "U1", "remember that my timezone is America/Sao_Paulo").await;

    // The fact is in core memory under the extracted key.
    let value = app
        .core_memory()
        .get("U1", "timezone")
        .await
        .expect("get");
    assert_eq!(value.as_deref(), Some("America/Sao_Paulo"));

    // Retrieval injects the fact and the reply carries it.
    let reply = send(&app, "U1", "what's my timezone?").await;
    assert!(
        reply.contains("America/Sao_Paulo"),
        "reply must contain the stored value, got: {reply}"
    );

    app.close().await;
}

#[tokio::test]
async fn scenario_no_cross_user_leakage() {
    let app = app().await;

    send(&app, "U1", "remember that my timezone is America/Sao_Paulo").await;
    send(&app, "U2", "remember that my timezone is Europe/Lisbon").await;

    let reply = send(&app, "U1", "what's my timezone?").await;
    assert!(reply.contains("America/Sao_Paulo"));
    assert!(
        !reply.contains("Europe/Lisbon"),
        "U2's data must never reach U1"
    );

    app.close().await;
}

#[tokio::test]
async fn empty_message_gets_help_without_store_writes() {
    let app = app().await;

    let reply = send(&app, "U1", "   ").await;
    assert_eq!(reply, CANNED_HELP);

    let facts = app.core_memory().list("U1", None).await.expect("list");
    assert!(facts.is_empty(), "no store writes for empty input");

    app.close().await;
}

#[tokio::test]
async fn bot_authors_are_dropped() {
    let app = app().await;
    let sink = Arc::new(CollectingSink::default());
    let mut bot_event = event("bot-1", "hello");
    bot_event.is_bot = true;

    app.handle(bot_event, sink.clone()).await;
    assert!(!sink.finished.load(Ordering::SeqCst), "no reply for bots");
    assert!(sink.text().await.is_empty());

    app.close().await;
}

#[tokio::test]
async fn out_of_scope_takes_the_canned_path() {
    let app = app().await;
    let reply = send(&app, "U1", "order me a pizza with extra money transfer").await;
    assert_eq!(reply, CANNED_OUT_OF_SCOPE);
    app.close().await;
}

#[tokio::test]
async fn command_prefix_short_circuits() {
    let app = app().await;
    let reply = send(&app, "U1", "!ping").await;
    assert_eq!(reply, "pong");
    assert_eq!(app.stats().pipeline.commands, 1);
    app.close().await;
}

#[tokio::test]
async fn bulk_delete_requires_approval_and_deletes_on_yes() {
    let app = app().await;
    send(&app, "U1", "remember that my timezone is America/Sao_Paulo").await;

    let handle = {
        let app = app.clone();
        tokio::spawn(async move { send(&app, "U1", "forget everything").await })
    };

    // Wait for the approval request to register, then grant it.
    let request_id = loop {
        let pending = app.pending_approvals();
        if let Some(id) = pending.first() {
            break id.clone();
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    };
    assert!(app.approve(&request_id, true));

    let reply = handle.await.expect("join");
    assert!(reply.contains("forgotten"), "got: {reply}");

    let facts = app.core_memory().list("U1", None).await.expect("list");
    assert!(facts.is_empty(), "approved bulk delete clears core memory");

    app.close().await;
}

#[tokio::test]
async fn bulk_delete_times_out_into_refusal() {
    let app = app().await;
    send(&app, "U1", "remember that my timezone is America/Sao_Paulo").await;

    // Nobody approves; the 1s timeout elapses.
    let reply = send(&app, "U1", "forget everything").await;
    assert!(reply.contains("wasn't approved"), "got: {reply}");

    let facts = app.core_memory().list("U1", None).await.expect("list");
    assert_eq!(facts.len(), 1, "nothing deleted without approval");

    app.close().await;
}

#[tokio::test]
async fn sourced_knowledge_query_routes_through_study() {
    let app = app().await;

    // First knowledge turn has nothing to cite; the plain knowledge agent
    // answers, and the turn's text lands in recall memory.
    let first = send(&app, "U1", "tell me about the history of Unix").await;
    assert!(!first.contains("[1]"), "no sources yet, got: {first}");

    // The follow-up retrieves the first turn as a source, so the study
    // agent answers with a citation that validates against it.
    let reply = send(&app, "U1", "tell me the history again").await;
    assert!(
        reply.contains("[1]"),
        "study agent answers sourced knowledge turns, got: {reply}"
    );

    app.close().await;
}

#[tokio::test]
async fn exchanges_are_persisted_per_session() {
    let app = app().await;
    send(&app, "U1", "remember that my timezone is America/Sao_Paulo").await;

    let stats = app.stats();
    assert_eq!(stats.pipeline.handled, 1);
    assert_eq!(stats.pipeline.failed, 0);
    assert_eq!(stats.live_sessions, 1);

    let health = app.health().await;
    assert!(health.store_ok);
    assert!(health.classifier_loaded);
    assert_eq!(health.background_failures, 0);
    assert!(health
        .background_tasks
        .iter()
        .any(|t| t == "access-flush"));

    app.close().await;
}
