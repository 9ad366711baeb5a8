use std::sync::Arc;

use rusqlite::params;
use tracing::instrument;
use uuid::Uuid;

use mnemo_llm::Embedder;
use mnemo_store::vector::{distance_to_similarity, embedding_to_bytes};
use mnemo_store::StorePool;

use crate::access::AccessBatcher;
use crate::error::{MemoryError, Result};
use crate::types::RecallItem;

/// Default minimum similarity for a search hit.
pub const DEFAULT_THRESHOLD: f32 = 0.7;
/// Default result count.
pub const DEFAULT_LIMIT: usize = 5;

/// Append-only vector-indexed episodic memory per user.
pub struct RecallMemory {
    pool: StorePool,
    embedder: Arc<Embedder>,
    batcher: Arc<AccessBatcher>,
}

impl RecallMemory {
    pub fn new(pool: StorePool, embedder: Arc<Embedder>, batcher: Arc<AccessBatcher>) -> Self {
        Self {
            pool,
            embedder,
            batcher,
        }
    }

    /// Embed and append one item. The row is never mutated afterwards except
    /// for its access counters.
    #[instrument(skip(self, content), fields(user_id))]
    pub async fn add(
        &self,
        user_id: &str,
        content: &str,
        importance: Option<f64>,
    ) -> Result<String> {
        if content.trim().is_empty() {
            return Err(MemoryError::InvalidInput(
                "recall content must be non-empty".to_string(),
            ));
        }
        let importance = importance.unwrap_or(0.5).clamp(0.0, 1.0);

        // Embedding happens before any store work; no lock is held here.
        let embedding = self.embedder.embed(content).await?;

        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let user = user_id.to_string();
        let content_owned = content.to_string();
        let blob = embedding_to_bytes(&embedding);
        let row_id = id.clone();

        self.pool
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO recall_memories
                     (id, user_id, content, embedding, importance, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![row_id, user, content_owned, blob, importance, now],
                )
                .map(|_| ())
            })
            .await?;

        Ok(id)
    }

    /// Nearest-neighbor search inside the user's partition, cosine
    /// similarity descending, ties by id. Results below `threshold` are
    /// omitted; matches get their access counters batched, one update per
    /// user, not one per match.
    #[instrument(skip(self, query), fields(user_id, limit))]
    pub async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
        threshold: f32,
        min_importance: f64,
    ) -> Result<Vec<RecallItem>> {
        let query_embedding = self.embedder.embed(query).await?;

        let user = user_id.to_string();
        let blob = embedding_to_bytes(&query_embedding);
        let rows: Vec<(RecallItem, f32)> = self
            .pool
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, content, importance, access_count, created_at,
                            vec_distance_cosine(embedding, ?1) AS distance
                     FROM recall_memories
                     WHERE user_id = ?2 AND importance >= ?3
                     ORDER BY distance ASC, id ASC
                     LIMIT ?4",
                )?;
                let rows = stmt.query_map(
                    params![blob, user, min_importance, limit as i64],
                    |row| {
                        let distance: f32 = row.get(6)?;
                        Ok((
                            RecallItem {
                                id: row.get(0)?,
                                user_id: row.get(1)?,
                                content: row.get(2)?,
                                importance: row.get(3)?,
                                access_count: row.get(4)?,
                                similarity: None,
                                created_at: row.get(5)?,
                            },
                            distance,
                        ))
                    },
                )?;
                rows.collect::<std::result::Result<Vec<_>, _>>()
            })
            .await?;

        let items: Vec<RecallItem> = rows
            .into_iter()
            .filter_map(|(mut item, distance)| {
                let similarity = distance_to_similarity(distance);
                (similarity >= threshold).then(|| {
                    item.similarity = Some(similarity);
                    item
                })
            })
            .collect();

        if !items.is_empty() {
            self.batcher
                .note_recall(user_id, items.iter().map(|i| i.id.as_str()));
        }
        Ok(items)
    }

    /// Delete an item; ownership is enforced in the predicate.
    pub async fn delete(&self, user_id: &str, id: &str) -> Result<bool> {
        let user = user_id.to_string();
        let id_owned = id.to_string();
        let removed = self
            .pool
            .run(move |conn| {
                conn.execute(
                    "DELETE FROM recall_memories WHERE id = ?1 AND user_id = ?2",
                    params![id_owned, user],
                )
            })
            .await?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mnemo_llm::{ChatRequest, ChatResponse, EmbeddingError, LlmClient, LlmError};

    /// Embeds along fixed axes so similarities are predictable:
    /// texts containing "cat" point one way, "car" another.
    struct AxisClient;

    #[async_trait]
    impl LlmClient for AxisClient {
        fn name(&self) -> &str {
            "axis"
        }

        async fn chat(&self, _req: &ChatRequest) -> std::result::Result<ChatResponse, LlmError> {
            unimplemented!("not used")
        }

        async fn embed(
            &self,
            text: &str,
            _model: &str,
        ) -> std::result::Result<Vec<f32>, EmbeddingError> {
            let mut v = vec![0.0_f32; 4];
            if text.contains("cat") {
                v[0] = 1.0;
            }
            if text.contains("car") {
                v[1] = 1.0;
            }
            if text.contains("sky") {
                v[2] = 1.0;
            }
            if v.iter().all(|x| *x == 0.0) {
                v[3] = 1.0;
            }
            Ok(v)
        }
    }

    async fn recall() -> (RecallMemory, StorePool) {
        let pool = StorePool::open_in_memory().expect("open");
        pool.init().await.expect("init");
        let embedder = Arc::new(Embedder::new(Arc::new(AxisClient), "axis", 4, 16, 300));
        let batcher = Arc::new(AccessBatcher::new(pool.clone()));
        (RecallMemory::new(pool.clone(), embedder, batcher), pool)
    }

    #[tokio::test]
    async fn add_then_search_finds_itself() {
        let (mem, _pool) = recall().await;
        mem.add("u1", "the cat sat", None).await.expect("add");

        let hits = mem
            .search("u1", "cat photos", 5, DEFAULT_THRESHOLD, 0.0)
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].similarity.unwrap() >= 0.99, "identical axis");
    }

    #[tokio::test]
    async fn search_never_crosses_user_partitions() {
        let (mem, _pool) = recall().await;
        mem.add("u1", "cat facts", None).await.expect("add");
        mem.add("u2", "cat pictures", None).await.expect("add");

        let hits = mem
            .search("u1", "cat", 10, 0.0, 0.0)
            .await
            .expect("search");
        assert!(hits.iter().all(|h| h.user_id == "u1"));
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn low_similarity_is_filtered() {
        let (mem, _pool) = recall().await;
        mem.add("u1", "car maintenance", None).await.expect("add");

        let hits = mem
            .search("u1", "cat", 5, DEFAULT_THRESHOLD, 0.0)
            .await
            .expect("search");
        assert!(hits.is_empty(), "orthogonal content filtered by threshold");
    }

    #[tokio::test]
    async fn min_importance_filters_rows() {
        let (mem, _pool) = recall().await;
        mem.add("u1", "cat one", Some(0.2)).await.expect("add");
        mem.add("u1", "cat two", Some(0.9)).await.expect("add");

        let hits = mem.search("u1", "cat", 10, 0.0, 0.5).await.expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "cat two");
    }

    #[tokio::test]
    async fn delete_requires_ownership() {
        let (mem, _pool) = recall().await;
        let id = mem.add("u1", "cat", None).await.expect("add");

        assert!(!mem.delete("u2", &id).await.expect("foreign delete"));
        assert!(mem.delete("u1", &id).await.expect("owner delete"));
    }

    #[tokio::test]
    async fn empty_content_rejected() {
        let (mem, _pool) = recall().await;
        let err = mem.add("u1", "", None).await.expect_err("empty");
        assert!(matches!(err, MemoryError::InvalidInput(_)));
    }
}
