use rusqlite::params;
use tracing::{info, instrument};
use uuid::Uuid;

use mnemo_store::StorePool;

use crate::error::Result;

/// Recall items at or above this importance are promotion candidates.
const PROMOTE_MIN_IMPORTANCE: f64 = 0.8;
/// ... when they have also been recalled at least this often.
const PROMOTE_MIN_ACCESS: i64 = 3;

/// Promotes hot recall items into archival storage.
///
/// Runs as a registered background task. A promoted item keeps its recall
/// row; the archival copy records the origin id in its metadata so the same
/// item is never promoted twice.
pub struct Curator {
    pool: StorePool,
}

impl Curator {
    pub fn new(pool: StorePool) -> Self {
        Self { pool }
    }

    /// One promotion sweep across all users. Returns how many items were
    /// promoted.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        let promoted = self
            .pool
            .transaction(move |tx| {
                let mut stmt = tx.prepare(
                    "SELECT r.id, r.user_id, r.content, r.importance
                     FROM recall_memories r
                     WHERE r.importance >= ?1
                       AND r.access_count >= ?2
                       AND NOT EXISTS (
                           SELECT 1 FROM archival_memories a
                           WHERE a.user_id = r.user_id
                             AND a.source = 'curator'
                             AND json_extract(a.metadata, '$.recall_id') = r.id
                       )",
                )?;
                let candidates: Vec<(String, String, String, f64)> = stmt
                    .query_map(params![PROMOTE_MIN_IMPORTANCE, PROMOTE_MIN_ACCESS], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                drop(stmt);

                for (recall_id, user_id, content, importance) in &candidates {
                    let metadata = serde_json::json!({
                        "recall_id": recall_id,
                        "importance": importance,
                    })
                    .to_string();
                    tx.execute(
                        "INSERT INTO archival_memories
                         (id, user_id, content, source, metadata, created_at, updated_at)
                         VALUES (?1, ?2, ?3, 'curator', ?4, ?5, ?5)",
                        params![Uuid::new_v4().to_string(), user_id, content, metadata, now],
                    )?;
                }

                Ok(candidates.len())
            })
            .await?;

        if promoted > 0 {
            info!(promoted, "curator promoted recall items to archival");
        }
        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_pool() -> StorePool {
        let pool = StorePool::open_in_memory().expect("open");
        pool.init().await.expect("init");
        pool.run(|conn| {
            conn.execute_batch(
                "INSERT INTO recall_memories
                   (id, user_id, content, embedding, importance, access_count, created_at, updated_at)
                 VALUES
                   ('hot', 'u1', 'hot item', x'00000000', 0.9, 5, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z'),
                   ('cold', 'u1', 'cold item', x'00000000', 0.9, 1, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z'),
                   ('weak', 'u1', 'weak item', x'00000000', 0.2, 9, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z');",
            )
        })
        .await
        .expect("seed");
        pool
    }

    #[tokio::test]
    async fn promotes_only_hot_and_important_items() {
        let pool = seeded_pool().await;
        let curator = Curator::new(pool.clone());

        assert_eq!(curator.run_once().await.expect("sweep"), 1);

        let (count, content): (i64, String) = pool
            .run(|conn| {
                let count = conn.query_row(
                    "SELECT COUNT(*) FROM archival_memories WHERE source='curator'",
                    [],
                    |r| r.get(0),
                )?;
                let content = conn.query_row(
                    "SELECT content FROM archival_memories WHERE source='curator'",
                    [],
                    |r| r.get(0),
                )?;
                Ok((count, content))
            })
            .await
            .expect("read");
        assert_eq!(count, 1);
        assert_eq!(content, "hot item");
    }

    #[tokio::test]
    async fn second_sweep_is_idempotent() {
        let pool = seeded_pool().await;
        let curator = Curator::new(pool.clone());

        curator.run_once().await.expect("first");
        assert_eq!(curator.run_once().await.expect("second"), 0);
    }
}
