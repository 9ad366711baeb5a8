use std::collections::HashMap;
use std::sync::Mutex;

use dashmap::DashMap;
use rusqlite::params;
use tracing::{debug, warn};

use mnemo_store::{StoreError, StorePool};

/// Which table an access note belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Tier {
    Core,
    Recall,
}

impl Tier {
    fn table(self) -> &'static str {
        match self {
            Tier::Core => "core_memories",
            Tier::Recall => "recall_memories",
        }
    }
}

#[derive(Default)]
struct Pending {
    /// (tier, row id) -> increment.
    counts: HashMap<(Tier, String), i64>,
}

/// Batches access-count increments so reads never cause write storms.
///
/// Notes accumulate in memory; `flush` writes one transaction per user with
/// at most one in-flight update per user at any time. Rows touched by a
/// flush get `last_accessed` refreshed by the store triggers.
pub struct AccessBatcher {
    pool: StorePool,
    pending: Mutex<HashMap<String, Pending>>,
    in_flight: DashMap<String, ()>,
}

impl AccessBatcher {
    pub fn new(pool: StorePool) -> Self {
        Self {
            pool,
            pending: Mutex::new(HashMap::new()),
            in_flight: DashMap::new(),
        }
    }

    /// Record one access of a core fact.
    pub fn note_core(&self, user_id: &str, id: &str) {
        self.note(user_id, Tier::Core, std::iter::once(id));
    }

    /// Record one access for each recall item in a search result set.
    pub fn note_recall<'a>(&self, user_id: &str, ids: impl IntoIterator<Item = &'a str>) {
        self.note(user_id, Tier::Recall, ids);
    }

    fn note<'a>(&self, user_id: &str, tier: Tier, ids: impl IntoIterator<Item = &'a str>) {
        let mut pending = self.pending.lock().unwrap();
        let entry = pending.entry(user_id.to_string()).or_default();
        for id in ids {
            *entry.counts.entry((tier, id.to_string())).or_insert(0) += 1;
        }
    }

    /// Number of users with unflushed notes (diagnostics).
    pub fn pending_users(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Flush all pending counters. Each user's increments are applied in a
    /// single transaction; users with a flush already in flight are skipped
    /// and picked up by the next sweep.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let users: Vec<String> = {
            let pending = self.pending.lock().unwrap();
            pending.keys().cloned().collect()
        };

        let mut first_err = None;
        for user in users {
            if self.in_flight.insert(user.clone(), ()).is_some() {
                debug!(user = %user, "access flush already in flight, skipping");
                continue;
            }

            let taken = {
                let mut pending = self.pending.lock().unwrap();
                pending.remove(&user)
            };

            let result = match taken {
                Some(batch) if !batch.counts.is_empty() => self.flush_user(batch).await,
                _ => Ok(()),
            };
            self.in_flight.remove(&user);

            if let Err(e) = result {
                warn!(user = %user, error = %e, "access-count flush failed");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn flush_user(&self, batch: Pending) -> Result<(), StoreError> {
        self.pool
            .transaction(move |tx| {
                for ((tier, id), count) in &batch.counts {
                    tx.execute(
                        &format!(
                            "UPDATE {} SET access_count = access_count + ?1 WHERE id = ?2",
                            tier.table()
                        ),
                        params![count, id],
                    )?;
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool_with_rows() -> StorePool {
        let pool = StorePool::open_in_memory().expect("open");
        pool.init().await.expect("init");
        pool.run(|conn| {
            conn.execute_batch(
                "INSERT INTO core_memories (id, user_id, key, value, importance, created_at, updated_at)
                 VALUES ('c1', 'u1', 'k', 'v', 0.5, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z');
                 INSERT INTO recall_memories (id, user_id, content, embedding, importance, created_at, updated_at)
                 VALUES ('r1', 'u1', 'x', x'00000000', 0.5, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z');",
            )
        })
        .await
        .expect("seed");
        pool
    }

    #[tokio::test]
    async fn notes_batch_until_flushed() {
        let pool = pool_with_rows().await;
        let batcher = AccessBatcher::new(pool.clone());

        batcher.note_core("u1", "c1");
        batcher.note_core("u1", "c1");
        batcher.note_recall("u1", ["r1"]);

        let count: i64 = pool
            .run(|conn| {
                conn.query_row("SELECT access_count FROM core_memories WHERE id='c1'", [], |r| {
                    r.get(0)
                })
            })
            .await
            .expect("read");
        assert_eq!(count, 0, "nothing written before flush");

        batcher.flush().await.expect("flush");

        let (core, recall): (i64, i64) = pool
            .run(|conn| {
                let core = conn.query_row(
                    "SELECT access_count FROM core_memories WHERE id='c1'",
                    [],
                    |r| r.get(0),
                )?;
                let recall = conn.query_row(
                    "SELECT access_count FROM recall_memories WHERE id='r1'",
                    [],
                    |r| r.get(0),
                )?;
                Ok((core, recall))
            })
            .await
            .expect("read");
        assert_eq!(core, 2);
        assert_eq!(recall, 1);
        assert_eq!(batcher.pending_users(), 0);
    }

    #[tokio::test]
    async fn flush_refreshes_last_accessed_via_trigger() {
        let pool = pool_with_rows().await;
        let batcher = AccessBatcher::new(pool.clone());
        batcher.note_core("u1", "c1");
        batcher.flush().await.expect("flush");

        let last: Option<String> = pool
            .run(|conn| {
                conn.query_row(
                    "SELECT last_accessed FROM core_memories WHERE id='c1'",
                    [],
                    |r| r.get(0),
                )
            })
            .await
            .expect("read");
        assert!(last.is_some());
    }

    #[tokio::test]
    async fn flush_with_nothing_pending_is_noop() {
        let pool = pool_with_rows().await;
        let batcher = AccessBatcher::new(pool);
        batcher.flush().await.expect("flush");
    }
}
