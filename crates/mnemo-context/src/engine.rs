use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rusqlite::params;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use mnemo_llm::{ChatMessage, ChatRequest, LlmClient, Role};
use mnemo_store::StorePool;

use crate::error::{ContextError, Result};
use crate::offload::{OffloadCache, OffloadKey};
use crate::reduce;
use crate::types::{MessageContent, ReductionMode, SessionKey, SessionMessage};

/// Offload priority for system messages vs conversational ones.
const PRIORITY_SYSTEM: u8 = 5;
const PRIORITY_CONVERSATIONAL: u8 = 1;
/// Output cap for the summarization call.
const SUMMARY_MAX_TOKENS: u32 = 512;

struct SessionState {
    id: String,
    messages: Vec<SessionMessage>,
    token_count: u32,
    next_seq: u64,
    offloaded: HashSet<u64>,
    last_active: Instant,
    reductions: u32,
}

/// Point-in-time stats for one session.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub session_id: String,
    pub message_count: usize,
    pub token_count: u32,
    pub offloaded_count: usize,
    pub reductions: u32,
}

/// Tracks per-session token budgets; reduces, offloads, and restores.
///
/// The per-session lock covers the message log and token count only. Every
/// I/O call (store, LLM) happens outside the lock: snapshot under lock, act,
/// reconcile under lock.
pub struct ContextEngine {
    pool: StorePool,
    llm: Arc<dyn LlmClient>,
    chat_model: String,
    max_tokens: u32,
    absolute_cap: u32,
    auto_reduce: bool,
    sessions: DashMap<String, Arc<tokio::sync::Mutex<SessionState>>>,
    offload: OffloadCache,
}

impl ContextEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: StorePool,
        llm: Arc<dyn LlmClient>,
        chat_model: impl Into<String>,
        max_tokens: u32,
        absolute_cap: u32,
        auto_reduce: bool,
        offload_capacity: usize,
        offload_ttl_s: u64,
    ) -> Self {
        Self {
            pool,
            llm,
            chat_model: chat_model.into(),
            max_tokens,
            absolute_cap,
            auto_reduce,
            sessions: DashMap::new(),
            offload: OffloadCache::new(offload_capacity, offload_ttl_s),
        }
    }

    /// Get or lazily create the session for a key. The session row is
    /// persisted on creation; the insert is idempotent so a racing creator
    /// just reads the same row back.
    async fn session(&self, key: &SessionKey) -> Result<Arc<tokio::sync::Mutex<SessionState>>> {
        let map_key = key.format();
        if let Some(existing) = self.sessions.get(&map_key) {
            return Ok(existing.clone());
        }

        let user = key.user_id.clone();
        let channel = key.channel_id.clone();
        let new_id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let session_id: String = self
            .pool
            .run(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO sessions
                     (id, user_id, channel_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![new_id, user, channel, now],
                )?;
                conn.query_row(
                    "SELECT id FROM sessions WHERE user_id = ?1 AND channel_id = ?2",
                    params![user, channel],
                    |row| row.get(0),
                )
            })
            .await?;

        let entry = self
            .sessions
            .entry(map_key)
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(SessionState {
                    id: session_id,
                    messages: Vec::new(),
                    token_count: 0,
                    next_seq: 0,
                    offloaded: HashSet::new(),
                    last_active: Instant::now(),
                    reductions: 0,
                }))
            })
            .clone();
        Ok(entry)
    }

    /// Append a message. Token counting runs on a blocking worker; the
    /// session lock is taken only for the in-memory bookkeeping.
    ///
    /// Returns the assigned sequence number and token count.
    #[instrument(skip(self, content), fields(key = %key))]
    pub async fn add_message(
        &self,
        key: &SessionKey,
        role: Role,
        content: MessageContent,
    ) -> Result<(u64, u32)> {
        let counted = content.clone();
        let tokens = tokio::task::spawn_blocking(move || counted.count_tokens())
            .await
            .map_err(|e| ContextError::Llm(mnemo_llm::LlmError::Permanent(e.to_string())))?;

        let session = self.session(key).await?;
        let mut state = session.lock().await;

        // A message that cannot fit even after a full reduction (which keeps
        // at most `max_tokens`) pushes the session over the absolute cap.
        if tokens > self.absolute_cap
            || (!self.auto_reduce && state.token_count + tokens > self.absolute_cap)
        {
            return Err(ContextError::Overflow {
                session: state.id.clone(),
                tokens: state.token_count + tokens,
                cap: self.absolute_cap,
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.messages.push(SessionMessage {
            seq,
            role,
            content,
            tokens,
        });
        state.token_count += tokens;
        state.last_active = Instant::now();

        if self.auto_reduce && state.token_count > self.max_tokens {
            self.reduce_locked(&mut state, ReductionMode::Full);
        }

        Ok((seq, tokens))
    }

    /// Run one reduction pass with an explicit mode.
    pub async fn reduce(&self, key: &SessionKey, mode: ReductionMode) -> Result<()> {
        let session = self.session(key).await?;
        let mut state = session.lock().await;
        self.reduce_locked(&mut state, mode);
        Ok(())
    }

    fn reduce_locked(&self, state: &mut SessionState, mode: ReductionMode) {
        let messages = std::mem::take(&mut state.messages);
        let reduced = reduce::reduce(messages, mode, self.max_tokens);

        for msg in reduced.dropped {
            let priority = if msg.role == Role::System {
                PRIORITY_SYSTEM
            } else {
                PRIORITY_CONVERSATIONAL
            };
            let offload_key = OffloadKey {
                session_id: state.id.clone(),
                index: msg.seq,
            };
            state.offloaded.insert(msg.seq);
            self.offload.insert(offload_key, msg, priority);
        }

        state.messages = reduced.kept;
        state.token_count = state.messages.iter().map(|m| m.tokens).sum();
        state.reductions += 1;
        debug!(
            session = %state.id,
            tokens = state.token_count,
            mode = ?mode,
            "session reduced"
        );
    }

    /// Snapshot of the live message log, oldest first.
    pub async fn get_context(&self, key: &SessionKey) -> Result<Vec<SessionMessage>> {
        let session = self.session(key).await?;
        let state = session.lock().await;
        Ok(state.messages.clone())
    }

    /// Bring an offloaded message back into the live log.
    pub async fn load_offloaded(&self, key: &SessionKey, index: u64) -> Result<bool> {
        let session = self.session(key).await?;
        let mut state = session.lock().await;

        let offload_key = OffloadKey {
            session_id: state.id.clone(),
            index,
        };
        let Some(message) = self.offload.load(&offload_key) else {
            return Ok(false);
        };

        state.offloaded.remove(&index);
        state.token_count += message.tokens;
        state.messages.push(message);
        state.messages.sort_by_key(|m| m.seq);
        Ok(true)
    }

    /// Summarize the conversation so far into one system message.
    ///
    /// Snapshot under the lock, call the LLM with the lock released, then
    /// reconcile: only messages captured in the snapshot are replaced, so
    /// turns that arrive mid-summarization survive untouched.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn summarize(&self, key: &SessionKey) -> Result<String> {
        let session = self.session(key).await?;

        let (transcript, last_seq) = {
            let state = session.lock().await;
            let transcript: String = state
                .messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(|m| format!("{}: {}", m.role, m.content.as_text()))
                .collect::<Vec<_>>()
                .join("\n");
            let last_seq = state.messages.last().map(|m| m.seq).unwrap_or(0);
            (transcript, last_seq)
        };

        if transcript.is_empty() {
            return Ok(String::new());
        }

        let req = ChatRequest {
            model: self.chat_model.clone(),
            system: "Summarize the conversation below in a short paragraph. \
                     Keep facts the user stated about themselves."
                .to_string(),
            messages: vec![ChatMessage {
                role: Role::User,
                content: transcript,
            }],
            temperature: 0.2,
            max_tokens: SUMMARY_MAX_TOKENS,
            stream: false,
        };
        let response = self.llm.chat(&req).await?;
        let summary = response.content;

        let mut state = session.lock().await;
        let mut replaced_seq: Option<u64> = None;
        state.messages.retain(|m| {
            let replace = m.seq <= last_seq && m.role != Role::System;
            if replace {
                replaced_seq = Some(replaced_seq.map_or(m.seq, |s| s.min(m.seq)));
            }
            !replace
        });
        if let Some(seq) = replaced_seq {
            let content = MessageContent::Text(summary.clone());
            let tokens = content.count_tokens();
            state.messages.push(SessionMessage {
                seq,
                role: Role::System,
                content,
                tokens,
            });
            state.messages.sort_by_key(|m| m.seq);
        }
        state.token_count = state.messages.iter().map(|m| m.tokens).sum();

        info!(session = %state.id, tokens = state.token_count, "session summarized");
        Ok(summary)
    }

    /// Persist one user/assistant exchange and the session's token count in
    /// a single transaction. `assistant_status` is `"complete"` or
    /// `"partial"` (interrupted stream).
    #[instrument(skip(self, user_msg, assistant_msg), fields(key = %key, assistant_status))]
    pub async fn persist_exchange(
        &self,
        key: &SessionKey,
        user_msg: (u64, MessageContent),
        assistant_msg: (u64, MessageContent),
        assistant_status: &str,
    ) -> Result<()> {
        let session = self.session(key).await?;
        let (session_id, token_count) = {
            let state = session.lock().await;
            (state.id.clone(), state.token_count)
        };

        let user_id = key.user_id.clone();
        let now = chrono::Utc::now().to_rfc3339();
        let status = assistant_status.to_string();
        let (user_seq, user_content) = user_msg;
        let (asst_seq, asst_content) = assistant_msg;
        let user_json = serde_json::to_string(&user_content).unwrap_or_default();
        let asst_json = serde_json::to_string(&asst_content).unwrap_or_default();

        self.pool
            .transaction(move |tx| {
                tx.execute(
                    "INSERT INTO messages (id, session_id, user_id, seq, role, content, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, 'user', ?5, 'complete', ?6)",
                    params![Uuid::new_v4().to_string(), session_id, user_id, user_seq as i64, user_json, now],
                )?;
                tx.execute(
                    "INSERT INTO messages (id, session_id, user_id, seq, role, content, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, 'assistant', ?5, ?6, ?7)",
                    params![Uuid::new_v4().to_string(), session_id, user_id, asst_seq as i64, asst_json, status, now],
                )?;
                tx.execute(
                    "UPDATE sessions SET token_count = ?1, updated_at = ?2 WHERE id = ?3",
                    params![token_count as i64, now, session_id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Stats snapshot for one session.
    pub async fn session_stats(&self, key: &SessionKey) -> Result<SessionStats> {
        let session = self.session(key).await?;
        let state = session.lock().await;
        Ok(SessionStats {
            session_id: state.id.clone(),
            message_count: state.messages.len(),
            token_count: state.token_count,
            offloaded_count: state.offloaded.len(),
            reductions: state.reductions,
        })
    }

    /// Drop in-memory state for sessions idle longer than `ttl`. Persisted
    /// rows survive; the session reloads lazily on the next message.
    pub fn sweep_idle(&self, ttl: Duration) -> usize {
        let mut stale = Vec::new();
        for entry in self.sessions.iter() {
            if let Ok(state) = entry.value().try_lock() {
                if state.last_active.elapsed() >= ttl {
                    stale.push(entry.key().clone());
                }
            }
        }
        for key in &stale {
            self.sessions.remove(key);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "idle sessions expired");
        }
        stale.len()
    }

    /// TTL sweep of the offload cache (registered background task).
    pub fn sweep_offload(&self) -> usize {
        self.offload.sweep_expired()
    }

    /// (live sessions, offloaded messages, offload cache hits)
    pub fn cache_stats(&self) -> (usize, usize, u64) {
        (self.sessions.len(), self.offload.len(), self.offload.hits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mnemo_llm::{ChatResponse, EmbeddingError, LlmError};

    struct CannedClient;

    #[async_trait]
    impl LlmClient for CannedClient {
        fn name(&self) -> &str {
            "canned"
        }

        async fn chat(&self, req: &ChatRequest) -> std::result::Result<ChatResponse, LlmError> {
            Ok(ChatResponse {
                content: "the user talked about their timezone".to_string(),
                model: req.model.clone(),
                tokens_in: 10,
                tokens_out: 8,
                stop_reason: "stop".to_string(),
            })
        }

        async fn embed(
            &self,
            _text: &str,
            model: &str,
        ) -> std::result::Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::permanent(model, 0, "not used"))
        }
    }

    async fn engine(max_tokens: u32, auto_reduce: bool) -> ContextEngine {
        let pool = StorePool::open_in_memory().expect("open");
        pool.init().await.expect("init");
        ContextEngine::new(
            pool,
            Arc::new(CannedClient),
            "test-model",
            max_tokens,
            max_tokens * 4,
            auto_reduce,
            64,
            3600,
        )
    }

    fn text(content: &str) -> MessageContent {
        MessageContent::Text(content.to_string())
    }

    fn key() -> SessionKey {
        SessionKey::new("u1", "c1")
    }

    #[tokio::test]
    async fn token_count_matches_sum_of_messages() {
        let engine = engine(8000, true).await;
        let key = key();

        engine.add_message(&key, Role::User, text("hello there")).await.expect("add");
        engine
            .add_message(&key, Role::Assistant, text("hi, how can I help you"))
            .await
            .expect("add");

        let stats = engine.session_stats(&key).await.expect("stats");
        let context = engine.get_context(&key).await.expect("context");
        let sum: u32 = context.iter().map(|m| m.content.count_tokens()).sum();
        assert_eq!(stats.token_count, sum);
    }

    #[tokio::test]
    async fn sequence_numbers_strictly_increase() {
        let engine = engine(8000, true).await;
        let key = key();
        let mut last = None;
        for i in 0..5 {
            let (seq, _) = engine
                .add_message(&key, Role::User, text(&format!("message {i}")))
                .await
                .expect("add");
            if let Some(prev) = last {
                assert!(seq > prev);
            }
            last = Some(seq);
        }
    }

    #[tokio::test]
    async fn auto_reduce_offloads_and_restores_invariant() {
        let engine = engine(40, true).await;
        let key = key();

        for i in 0..20 {
            engine
                .add_message(&key, Role::User, text(&format!("padding filler message number {i}")))
                .await
                .expect("add");
        }

        let stats = engine.session_stats(&key).await.expect("stats");
        assert!(stats.token_count <= 40, "budget enforced");
        assert!(stats.reductions > 0);
        assert!(stats.offloaded_count > 0, "dropped messages were offloaded");

        let context = engine.get_context(&key).await.expect("context");
        let sum: u32 = context.iter().map(|m| m.content.count_tokens()).sum();
        assert_eq!(stats.token_count, sum, "invariant re-holds after reduction");
    }

    #[tokio::test]
    async fn explicit_compact_reduction_shrinks_tokens_in_place() {
        let engine = engine(8000, false).await;
        let key = key();
        engine
            .add_message(&key, Role::User, text("too   many      spaces   here"))
            .await
            .expect("add");
        let before = engine.session_stats(&key).await.expect("stats").token_count;

        engine.reduce(&key, ReductionMode::Compact).await.expect("reduce");

        let stats = engine.session_stats(&key).await.expect("stats");
        assert!(stats.token_count < before, "whitespace collapsed");
        assert_eq!(stats.message_count, 1, "compact drops nothing");
        assert_eq!(stats.reductions, 1);
    }

    #[tokio::test]
    async fn oversized_message_is_overflow_and_session_stays_usable() {
        let engine = engine(10, true).await;
        let key = key();

        let huge = "word ".repeat(500);
        let err = engine
            .add_message(&key, Role::User, text(&huge))
            .await
            .expect_err("overflow");
        assert!(matches!(err, ContextError::Overflow { .. }));

        // Session still accepts normal messages afterwards.
        engine.add_message(&key, Role::User, text("hi")).await.expect("add");
        let stats = engine.session_stats(&key).await.expect("stats");
        assert_eq!(stats.message_count, 1);
    }

    #[tokio::test]
    async fn offloaded_message_can_be_loaded_back() {
        let engine = engine(30, true).await;
        let key = key();

        for i in 0..10 {
            engine
                .add_message(&key, Role::User, text(&format!("some long filler message {i}")))
                .await
                .expect("add");
        }
        let stats = engine.session_stats(&key).await.expect("stats");
        assert!(stats.offloaded_count > 0);

        let before = engine.get_context(&key).await.expect("context").len();
        let restored = engine.load_offloaded(&key, 0).await.expect("load");
        assert!(restored, "seq 0 was offloaded first");
        let after = engine.get_context(&key).await.expect("context");
        assert_eq!(after.len(), before + 1);
        assert_eq!(after[0].seq, 0, "restored message sorts back into place");

        let (_, _, hits) = engine.cache_stats();
        assert_eq!(hits, 1);
    }

    #[tokio::test]
    async fn persist_exchange_writes_both_rows_atomically() {
        let pool = StorePool::open_in_memory().expect("open");
        pool.init().await.expect("init");
        let engine = ContextEngine::new(
            pool.clone(),
            Arc::new(CannedClient),
            "test-model",
            8000,
            32_000,
            true,
            64,
            3600,
        );
        let key = key();

        let (user_seq, _) = engine.add_message(&key, Role::User, text("hi")).await.expect("add");
        let (asst_seq, _) = engine
            .add_message(&key, Role::Assistant, text("hello"))
            .await
            .expect("add");
        engine
            .persist_exchange(&key, (user_seq, text("hi")), (asst_seq, text("hello")), "partial")
            .await
            .expect("persist");

        let rows: Vec<(String, String)> = pool
            .run(|conn| {
                let mut stmt =
                    conn.prepare("SELECT role, status FROM messages ORDER BY seq")?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect()
            })
            .await
            .expect("read");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], ("user".to_string(), "complete".to_string()));
        assert_eq!(rows[1], ("assistant".to_string(), "partial".to_string()));
    }

    #[tokio::test]
    async fn summarize_replaces_old_turns_with_system_message() {
        let engine = engine(8000, true).await;
        let key = key();

        engine
            .add_message(&key, Role::User, text("my timezone is UTC"))
            .await
            .expect("add");
        engine
            .add_message(&key, Role::Assistant, text("noted!"))
            .await
            .expect("add");

        let summary = engine.summarize(&key).await.expect("summarize");
        assert!(!summary.is_empty());

        let context = engine.get_context(&key).await.expect("context");
        assert_eq!(context.len(), 1);
        assert_eq!(context[0].role, Role::System);

        let stats = engine.session_stats(&key).await.expect("stats");
        assert_eq!(stats.token_count, context[0].content.count_tokens());
    }

    #[tokio::test]
    async fn idle_sweep_drops_only_stale_sessions() {
        let engine = engine(8000, true).await;
        engine
            .add_message(&key(), Role::User, text("hi"))
            .await
            .expect("add");

        assert_eq!(engine.sweep_idle(Duration::from_secs(3600)), 0);
        assert_eq!(engine.sweep_idle(Duration::from_secs(0)), 1);

        // Session reloads lazily afterwards.
        engine
            .add_message(&key(), Role::User, text("back again"))
            .await
            .expect("add");
    }
}
