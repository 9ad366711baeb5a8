use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rusqlite::params;
use tracing::{debug, instrument};
use uuid::Uuid;

use mnemo_store::StorePool;

use crate::access::AccessBatcher;
use crate::error::{MemoryError, Result};
use crate::types::CoreFact;

/// Rendered per-user context expires after this many seconds.
const CONTEXT_CACHE_TTL_SECS: i64 = 300;
/// Half-life horizon for the eviction recency factor (one week, hours).
const RECENCY_HORIZON_HOURS: f64 = 168.0;

#[derive(Clone)]
struct CachedContext {
    rendered: String,
    built_at: chrono::DateTime<chrono::Utc>,
}

/// Keyed, bounded, importance-ranked facts per user.
///
/// One writer at a time per user (async mutex per partition); reads go
/// straight to the pool. Access counters are batched through
/// [`AccessBatcher`] rather than written per read.
pub struct CoreMemory {
    pool: StorePool,
    batcher: Arc<AccessBatcher>,
    max_per_user: usize,
    write_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    context_cache: Mutex<HashMap<String, CachedContext>>,
}

impl CoreMemory {
    pub fn new(pool: StorePool, batcher: Arc<AccessBatcher>, max_per_user: usize) -> Self {
        Self {
            pool,
            batcher,
            max_per_user,
            write_locks: DashMap::new(),
            context_cache: Mutex::new(HashMap::new()),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Store or update a fact (upsert on `(user_id, key)`). When the
    /// partition would exceed its cap, the entry with the lowest composite
    /// score is evicted in the same transaction.
    #[instrument(skip(self, value, metadata), fields(user_id))]
    pub async fn add(
        &self,
        user_id: &str,
        key: &str,
        value: &str,
        importance: Option<f64>,
        metadata: Option<serde_json::Value>,
    ) -> Result<String> {
        if key.trim().is_empty() || value.trim().is_empty() {
            return Err(MemoryError::InvalidInput(
                "core fact key and value must be non-empty".to_string(),
            ));
        }
        let importance = importance.unwrap_or(0.5).clamp(0.0, 1.0);

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let user = user_id.to_string();
        let key_owned = key.to_string();
        let value_owned = value.to_string();
        let metadata_json = metadata.map(|m| m.to_string());
        let max = self.max_per_user;

        let stored_id = self
            .pool
            .transaction(move |tx| {
                tx.execute(
                    "INSERT INTO core_memories
                     (id, user_id, key, value, importance, metadata, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                     ON CONFLICT(user_id, key) DO UPDATE SET
                        value = excluded.value,
                        importance = excluded.importance,
                        metadata = excluded.metadata,
                        updated_at = excluded.updated_at",
                    params![id, user, key_owned, value_owned, importance, metadata_json, now],
                )?;

                // The upsert may have updated an existing row; read back the
                // surviving id for this key.
                let actual_id: String = tx.query_row(
                    "SELECT id FROM core_memories WHERE user_id = ?1 AND key = ?2",
                    params![user, key_owned],
                    |row| row.get(0),
                )?;

                let count: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM core_memories WHERE user_id = ?1",
                    params![user],
                    |row| row.get(0),
                )?;

                if count as usize > max {
                    evict_lowest(tx, &user, &key_owned)?;
                }

                Ok(actual_id)
            })
            .await?;

        self.invalidate_context(user_id);
        Ok(stored_id)
    }

    /// Look up a fact by key. Access counting is batched, not per-read.
    pub async fn get(&self, user_id: &str, key: &str) -> Result<Option<String>> {
        let user = user_id.to_string();
        let key_owned = key.to_string();
        let row: Option<(String, String)> = self
            .pool
            .run(move |conn| {
                match conn.query_row(
                    "SELECT id, value FROM core_memories WHERE user_id = ?1 AND key = ?2",
                    params![user, key_owned],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                ) {
                    Ok(v) => Ok(Some(v)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await?;

        Ok(row.map(|(id, value)| {
            self.batcher.note_core(user_id, &id);
            value
        }))
    }

    /// List facts, optionally filtered by a key substring, importance
    /// descending.
    pub async fn list(&self, user_id: &str, filter: Option<&str>) -> Result<Vec<CoreFact>> {
        let user = user_id.to_string();
        let pattern = filter.map(|f| format!("%{}%", escape_like(f)));
        let facts = self
            .pool
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, key, value, importance, metadata,
                            access_count, last_accessed, created_at, updated_at
                     FROM core_memories
                     WHERE user_id = ?1
                       AND (?2 IS NULL OR key LIKE ?2 ESCAPE '\\')
                     ORDER BY importance DESC, key ASC",
                )?;
                let rows = stmt.query_map(params![user, pattern], row_to_fact)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()
            })
            .await?;
        Ok(facts)
    }

    /// Delete a fact. Returns whether a row was removed.
    #[instrument(skip(self), fields(user_id, key))]
    pub async fn delete(&self, user_id: &str, key: &str) -> Result<bool> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let user = user_id.to_string();
        let key_owned = key.to_string();
        let removed = self
            .pool
            .run(move |conn| {
                conn.execute(
                    "DELETE FROM core_memories WHERE user_id = ?1 AND key = ?2",
                    params![user, key_owned],
                )
            })
            .await?;
        if removed > 0 {
            self.invalidate_context(user_id);
        }
        Ok(removed > 0)
    }

    /// Substring search across keys and values; returns matching keys.
    pub async fn search_substring(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let user = user_id.to_string();
        let pattern = format!("%{}%", escape_like(query));
        let keys = self
            .pool
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key FROM core_memories
                     WHERE user_id = ?1
                       AND (key LIKE ?2 ESCAPE '\\' OR value LIKE ?2 ESCAPE '\\')
                     ORDER BY importance DESC
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![user, pattern, limit as i64], |row| {
                    row.get::<_, String>(0)
                })?;
                rows.collect::<std::result::Result<Vec<_>, _>>()
            })
            .await?;
        Ok(keys)
    }

    /// Render the user's facts into a prompt block, cached for a few minutes.
    ///
    /// The per-user write lock doubles as the load guard so two concurrent
    /// callers cannot both rebuild the same context.
    pub async fn render_context(&self, user_id: &str) -> Result<String> {
        if let Some(cached) = self.cached_context(user_id) {
            return Ok(cached);
        }

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        // Re-check after acquiring the lock; another caller may have loaded.
        if let Some(cached) = self.cached_context(user_id) {
            debug!(user = user_id, "context loaded while waiting for lock");
            return Ok(cached);
        }

        let facts = self.list(user_id, None).await?;
        let mut rendered = String::new();
        for fact in &facts {
            rendered.push_str(&format!("- {}: {}\n", fact.key, fact.value));
        }

        let mut cache = self.context_cache.lock().unwrap();
        cache.insert(
            user_id.to_string(),
            CachedContext {
                rendered: rendered.clone(),
                built_at: chrono::Utc::now(),
            },
        );
        Ok(rendered)
    }

    fn cached_context(&self, user_id: &str) -> Option<String> {
        let cache = self.context_cache.lock().unwrap();
        let ctx = cache.get(user_id)?;
        let age = chrono::Utc::now()
            .signed_duration_since(ctx.built_at)
            .num_seconds();
        (age < CONTEXT_CACHE_TTL_SECS).then(|| ctx.rendered.clone())
    }

    fn invalidate_context(&self, user_id: &str) {
        let mut cache = self.context_cache.lock().unwrap();
        cache.remove(user_id);
    }
}

/// Delete the entry with the lowest composite score, keeping the key that
/// was just written.
///
/// Score: `importance * recency_factor + ln(1 + access_count)` where the
/// recency factor decays exponentially over a one-week horizon.
fn evict_lowest(
    tx: &rusqlite::Transaction<'_>,
    user_id: &str,
    keep_key: &str,
) -> std::result::Result<(), rusqlite::Error> {
    let now = chrono::Utc::now();
    let mut stmt = tx.prepare(
        "SELECT id, key, importance, access_count, COALESCE(last_accessed, updated_at)
         FROM core_memories WHERE user_id = ?1 AND key != ?2",
    )?;
    let rows: Vec<(String, String, f64, i64, String)> = stmt
        .query_map(params![user_id, keep_key], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    drop(stmt);

    let victim = rows
        .iter()
        .min_by(|a, b| {
            let score_a = eviction_score(a.2, a.3, &a.4, now);
            let score_b = eviction_score(b.2, b.3, &b.4, now);
            score_a.partial_cmp(&score_b).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(id, key, ..)| (id.clone(), key.clone()));

    if let Some((id, key)) = victim {
        debug!(user = user_id, key = %key, "evicting lowest-scored core fact");
        tx.execute("DELETE FROM core_memories WHERE id = ?1", params![id])?;
    }
    Ok(())
}

fn eviction_score(
    importance: f64,
    access_count: i64,
    last_touched: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> f64 {
    let age_hours = chrono::DateTime::parse_from_rfc3339(last_touched)
        .map(|dt| {
            now.signed_duration_since(dt.with_timezone(&chrono::Utc))
                .num_minutes() as f64
                / 60.0
        })
        .unwrap_or(RECENCY_HORIZON_HOURS);
    let recency_factor = (-age_hours.max(0.0) / RECENCY_HORIZON_HOURS).exp();
    importance * recency_factor + (1.0 + access_count as f64).ln()
}

/// Escape `%` and `_` so user input cannot act as LIKE wildcards.
pub(crate) fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<CoreFact> {
    let metadata: Option<String> = row.get(5)?;
    Ok(CoreFact {
        id: row.get(0)?,
        user_id: row.get(1)?,
        key: row.get(2)?,
        value: row.get(3)?,
        importance: row.get(4)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        access_count: row.get(6)?,
        last_accessed: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory(max: usize) -> CoreMemory {
        let pool = StorePool::open_in_memory().expect("open");
        pool.init().await.expect("init");
        let batcher = Arc::new(AccessBatcher::new(pool.clone()));
        CoreMemory::new(pool, batcher, max)
    }

    #[tokio::test]
    async fn add_then_get_roundtrips() {
        let mem = memory(10).await;
        mem.add("u1", "timezone", "America/Sao_Paulo", None, None)
            .await
            .expect("add");
        let value = mem.get("u1", "timezone").await.expect("get");
        assert_eq!(value.as_deref(), Some("America/Sao_Paulo"));
    }

    #[tokio::test]
    async fn restore_updates_instead_of_duplicating() {
        let mem = memory(10).await;
        let id1 = mem.add("u1", "city", "Lisbon", None, None).await.expect("add");
        let id2 = mem.add("u1", "city", "Porto", None, None).await.expect("re-add");
        assert_eq!(id1, id2, "upsert keeps the original row");

        let facts = mem.list("u1", None).await.expect("list");
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].value, "Porto");
    }

    #[tokio::test]
    async fn users_are_isolated() {
        let mem = memory(10).await;
        mem.add("u1", "timezone", "America/Sao_Paulo", None, None)
            .await
            .expect("add u1");
        mem.add("u2", "timezone", "Europe/Lisbon", None, None)
            .await
            .expect("add u2");

        assert_eq!(
            mem.get("u1", "timezone").await.expect("get").as_deref(),
            Some("America/Sao_Paulo")
        );
        assert_eq!(
            mem.get("u2", "timezone").await.expect("get").as_deref(),
            Some("Europe/Lisbon")
        );
    }

    #[tokio::test]
    async fn cap_evicts_lowest_scored_entry() {
        let mem = memory(2).await;
        mem.add("u1", "low", "x", Some(0.1), None).await.expect("add");
        mem.add("u1", "high", "y", Some(0.9), None).await.expect("add");
        mem.add("u1", "mid", "z", Some(0.5), None).await.expect("add");

        let facts = mem.list("u1", None).await.expect("list");
        assert_eq!(facts.len(), 2, "partition stays at cap");
        assert!(
            facts.iter().all(|f| f.key != "low"),
            "lowest-importance entry evicted"
        );
    }

    #[tokio::test]
    async fn empty_key_rejected() {
        let mem = memory(10).await;
        let err = mem.add("u1", "  ", "v", None, None).await.expect_err("invalid");
        assert!(matches!(err, MemoryError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let mem = memory(10).await;
        mem.add("u1", "k", "v", None, None).await.expect("add");
        assert!(mem.delete("u1", "k").await.expect("delete"));
        assert!(!mem.delete("u1", "k").await.expect("second delete"));
    }

    #[tokio::test]
    async fn substring_search_is_wildcard_safe() {
        let mem = memory(10).await;
        mem.add("u1", "100%_done", "yes", None, None).await.expect("add");
        mem.add("u1", "other", "no", None, None).await.expect("add");

        let keys = mem
            .search_substring("u1", "100%_", 10)
            .await
            .expect("search");
        assert_eq!(keys, vec!["100%_done".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_adds_to_same_key_keep_one_value() {
        let mem = Arc::new(memory(10).await);
        let a = {
            let mem = mem.clone();
            tokio::spawn(async move { mem.add("u1", "k", "v1", None, None).await })
        };
        let b = {
            let mem = mem.clone();
            tokio::spawn(async move { mem.add("u1", "k", "v2", None, None).await })
        };
        a.await.expect("join").expect("add v1");
        b.await.expect("join").expect("add v2");

        let facts = mem.list("u1", None).await.expect("list");
        assert_eq!(facts.len(), 1);
        assert!(facts[0].value == "v1" || facts[0].value == "v2");
    }

    #[test]
    fn eviction_score_prefers_recent_and_important() {
        let now = chrono::Utc::now();
        let fresh = now.to_rfc3339();
        let stale = (now - chrono::Duration::days(30)).to_rfc3339();

        let important_fresh = eviction_score(0.9, 0, &fresh, now);
        let unimportant_stale = eviction_score(0.1, 0, &stale, now);
        assert!(important_fresh > unimportant_stale);

        let heavily_accessed = eviction_score(0.1, 50, &stale, now);
        assert!(heavily_accessed > important_fresh, "access count dominates");
    }
}
