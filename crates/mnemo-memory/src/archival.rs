use rusqlite::params;
use tracing::{info, instrument};
use uuid::Uuid;

use mnemo_store::StorePool;

use crate::core::escape_like;
use crate::error::{MemoryError, Result};
use crate::types::ArchivalItem;

/// Characters of each source item kept in a compression summary.
const SUMMARY_EXCERPT_CHARS: usize = 160;

/// Long-form memory with metadata filtering and transactional compression.
pub struct ArchivalMemory {
    pool: StorePool,
}

impl ArchivalMemory {
    pub fn new(pool: StorePool) -> Self {
        Self { pool }
    }

    /// Store content verbatim.
    #[instrument(skip(self, content, metadata), fields(user_id, source))]
    pub async fn archive(
        &self,
        user_id: &str,
        content: &str,
        source: &str,
        metadata: Option<serde_json::Value>,
        session_id: Option<&str>,
    ) -> Result<String> {
        if content.is_empty() {
            return Err(MemoryError::InvalidInput(
                "archival content must be non-empty".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let user = user_id.to_string();
        let content_owned = content.to_string();
        let source_owned = source.to_string();
        let metadata_json = metadata.map(|m| m.to_string());
        let session = session_id.map(String::from);
        let row_id = id.clone();

        self.pool
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO archival_memories
                     (id, user_id, content, source, metadata, session_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    params![row_id, user, content_owned, source_owned, metadata_json, session, now],
                )
                .map(|_| ())
            })
            .await?;
        Ok(id)
    }

    /// Fold every uncompressed item of a session into one summary item.
    ///
    /// Runs as a single transaction: the summary insert and the source
    /// updates either all commit or none do. Sources end up with
    /// `compressed = true` and `compressed_into_id` pointing at the summary.
    #[instrument(skip(self), fields(user_id, session_id))]
    pub async fn compress(&self, user_id: &str, session_id: &str) -> Result<String> {
        let user = user_id.to_string();
        let session = session_id.to_string();
        let summary_id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let new_id = summary_id.clone();

        let compressed_count = self
            .pool
            .transaction(move |tx| {
                let mut stmt = tx.prepare(
                    "SELECT id, content FROM archival_memories
                     WHERE user_id = ?1 AND session_id = ?2 AND compressed = 0
                     ORDER BY created_at ASC, id ASC",
                )?;
                let sources: Vec<(String, String)> = stmt
                    .query_map(params![user, session], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                drop(stmt);

                if sources.is_empty() {
                    return Err(rusqlite::Error::QueryReturnedNoRows);
                }

                let summary = summarize(&sources);
                // The summary records its session in metadata, not in
                // session_id, so a later compress of the same session does
                // not fold earlier summaries back in.
                let metadata = serde_json::json!({
                    "source_count": sources.len(),
                    "session_id": session,
                })
                .to_string();
                tx.execute(
                    "INSERT INTO archival_memories
                     (id, user_id, content, source, metadata, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'compression', ?4, ?5, ?5)",
                    params![new_id, user, summary, metadata, now],
                )?;

                for (source_id, _) in &sources {
                    tx.execute(
                        "UPDATE archival_memories
                         SET compressed = 1, compressed_into_id = ?1
                         WHERE id = ?2",
                        params![new_id, source_id],
                    )?;
                }

                Ok(sources.len())
            })
            .await
            .map_err(|e| match e {
                mnemo_store::StoreError::Query(rusqlite::Error::QueryReturnedNoRows) => {
                    MemoryError::NotFound {
                        key: session_id.to_string(),
                    }
                }
                other => MemoryError::Store(other),
            })?;

        info!(session = session_id, sources = compressed_count, "session compressed");
        Ok(summary_id)
    }

    /// Filter by metadata fields. Dotted keys become JSON path arrays bound
    /// as parameters; nothing is ever interpolated into the SQL text.
    pub async fn search_by_metadata(
        &self,
        user_id: &str,
        filters: &[(String, serde_json::Value)],
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ArchivalItem>> {
        let user = user_id.to_string();
        let bound: Vec<(String, rusqlite::types::Value)> = filters
            .iter()
            .map(|(key, value)| (json_path(key), json_value_to_sql(value)))
            .collect();

        let items = self
            .pool
            .run(move |conn| {
                let mut sql = String::from(
                    "SELECT id, user_id, content, source, metadata, session_id,
                            compressed, compressed_into_id, created_at
                     FROM archival_memories
                     WHERE user_id = ?1",
                );
                let mut params_vec: Vec<rusqlite::types::Value> =
                    vec![rusqlite::types::Value::Text(user)];
                for (path, value) in bound {
                    sql.push_str(&format!(
                        " AND json_extract(metadata, ?{}) = ?{}",
                        params_vec.len() + 1,
                        params_vec.len() + 2
                    ));
                    params_vec.push(rusqlite::types::Value::Text(path));
                    params_vec.push(value);
                }
                sql.push_str(&format!(
                    " ORDER BY created_at DESC, id ASC LIMIT ?{} OFFSET ?{}",
                    params_vec.len() + 1,
                    params_vec.len() + 2
                ));
                params_vec.push(rusqlite::types::Value::Integer(limit as i64));
                params_vec.push(rusqlite::types::Value::Integer(offset as i64));

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(params_vec), row_to_item)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()
            })
            .await?;
        Ok(items)
    }

    /// Substring search over content; `%` and `_` in the query are literal.
    pub async fn search_by_content(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ArchivalItem>> {
        let user = user_id.to_string();
        let pattern = format!("%{}%", escape_like(query));
        let items = self
            .pool
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, content, source, metadata, session_id,
                            compressed, compressed_into_id, created_at
                     FROM archival_memories
                     WHERE user_id = ?1 AND content LIKE ?2 ESCAPE '\\'
                     ORDER BY created_at DESC, id ASC
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![user, pattern, limit as i64], row_to_item)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()
            })
            .await?;
        Ok(items)
    }

    /// Fetch a single item inside the user's partition.
    pub async fn get(&self, user_id: &str, id: &str) -> Result<Option<ArchivalItem>> {
        let user = user_id.to_string();
        let id_owned = id.to_string();
        let item = self
            .pool
            .run(move |conn| {
                match conn.query_row(
                    "SELECT id, user_id, content, source, metadata, session_id,
                            compressed, compressed_into_id, created_at
                     FROM archival_memories WHERE id = ?1 AND user_id = ?2",
                    params![id_owned, user],
                    row_to_item,
                ) {
                    Ok(item) => Ok(Some(item)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await?;
        Ok(item)
    }

    /// Delete an item. Rows that were compressed into it survive with their
    /// link cleared, in the same transaction.
    pub async fn delete(&self, user_id: &str, id: &str) -> Result<bool> {
        let user = user_id.to_string();
        let id_owned = id.to_string();
        let removed = self
            .pool
            .transaction(move |tx| {
                tx.execute(
                    "UPDATE archival_memories SET compressed_into_id = NULL
                     WHERE compressed_into_id = ?1 AND user_id = ?2",
                    params![id_owned, user],
                )?;
                tx.execute(
                    "DELETE FROM archival_memories WHERE id = ?1 AND user_id = ?2",
                    params![id_owned, user],
                )
            })
            .await?;
        Ok(removed > 0)
    }
}

/// Deterministic digest of the compressed sources. Compression must stay
/// transactional, so no LLM call happens here; the digest keeps an excerpt
/// of every source in order.
fn summarize(sources: &[(String, String)]) -> String {
    let mut out = format!("Summary of {} archived items:\n", sources.len());
    for (i, (_, content)) in sources.iter().enumerate() {
        let excerpt: String = content.chars().take(SUMMARY_EXCERPT_CHARS).collect();
        out.push_str(&format!("{}. {}\n", i + 1, excerpt));
    }
    out
}

/// Compile a dotted key into a SQLite JSON path: `a.b` -> `$."a"."b"`.
/// The path is bound as a parameter, never spliced into SQL.
fn json_path(dotted: &str) -> String {
    let mut path = String::from("$");
    for part in dotted.split('.') {
        path.push_str(&format!(".\"{}\"", part.replace('"', "")));
    }
    path
}

fn json_value_to_sql(value: &serde_json::Value) -> rusqlite::types::Value {
    match value {
        serde_json::Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        serde_json::Value::Number(n) if n.is_i64() => {
            rusqlite::types::Value::Integer(n.as_i64().unwrap_or(0))
        }
        serde_json::Value::Number(n) => {
            rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))
        }
        serde_json::Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArchivalItem> {
    let metadata: Option<String> = row.get(4)?;
    Ok(ArchivalItem {
        id: row.get(0)?,
        user_id: row.get(1)?,
        content: row.get(2)?,
        source: row.get(3)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        session_id: row.get(5)?,
        compressed: row.get::<_, i64>(6)? != 0,
        compressed_into_id: row.get(7)?,
        created_at: row.get(8)?,
    })
}
