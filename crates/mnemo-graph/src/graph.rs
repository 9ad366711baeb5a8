use std::sync::Arc;

use rusqlite::params;
use tracing::{debug, instrument};
use uuid::Uuid;

use mnemo_llm::Embedder;
use mnemo_store::vector::{distance_to_similarity, embedding_to_bytes};
use mnemo_store::StorePool;

use crate::error::{GraphError, Result};
use crate::types::{Direction, Edge, Node};

/// Per-user typed digraph with embeddings on nodes.
///
/// Nodes and edges live in arena-style tables addressed by id; traversal
/// works on ids inside SQL, never on in-memory pointers.
pub struct KnowledgeGraph {
    pool: StorePool,
    embedder: Arc<Embedder>,
}

impl KnowledgeGraph {
    pub fn new(pool: StorePool, embedder: Arc<Embedder>) -> Self {
        Self { pool, embedder }
    }

    /// Insert a node, embedding `label` (+ type) in one round-trip via
    /// `RETURNING *`.
    #[instrument(skip(self, properties), fields(user_id, label))]
    pub async fn add_node(
        &self,
        user_id: &str,
        label: &str,
        node_type: Option<&str>,
        properties: Option<serde_json::Value>,
    ) -> Result<Node> {
        if label.trim().is_empty() {
            return Err(GraphError::InvalidInput("node label must be non-empty".to_string()));
        }

        let embed_text = match node_type {
            Some(t) => format!("{label} ({t})"),
            None => label.to_string(),
        };
        let embedding = self.embedder.embed(&embed_text).await?;

        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let user = user_id.to_string();
        let label_owned = label.to_string();
        let type_owned = node_type.map(String::from);
        let properties_json = properties.map(|p| p.to_string());
        let blob = embedding_to_bytes(&embedding);

        let node = self
            .pool
            .run(move |conn| {
                conn.query_row(
                    "INSERT INTO knowledge_nodes
                     (id, user_id, label, node_type, properties, embedding, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                     RETURNING id, user_id, label, node_type, properties, created_at, updated_at",
                    params![id, user, label_owned, type_owned, properties_json, blob, now],
                    row_to_node,
                )
            })
            .await?;
        Ok(node)
    }

    /// Replace a node's properties (and optionally its label, which
    /// recomputes the embedding).
    pub async fn update_node(
        &self,
        user_id: &str,
        node_id: &str,
        label: Option<&str>,
        properties: Option<serde_json::Value>,
    ) -> Result<Node> {
        let existing = self
            .get_node(user_id, node_id)
            .await?
            .ok_or_else(|| GraphError::NotFound {
                id: node_id.to_string(),
            })?;

        let new_label = label.unwrap_or(&existing.label).to_string();
        let new_embedding = if label.is_some() {
            let embed_text = match &existing.node_type {
                Some(t) => format!("{new_label} ({t})"),
                None => new_label.clone(),
            };
            Some(embedding_to_bytes(&self.embedder.embed(&embed_text).await?))
        } else {
            None
        };

        let user = user_id.to_string();
        let id_owned = node_id.to_string();
        let properties_json = properties
            .map(|p| p.to_string())
            .or_else(|| existing.properties.as_ref().map(|p| p.to_string()));

        let node = self
            .pool
            .run(move |conn| {
                conn.query_row(
                    "UPDATE knowledge_nodes
                     SET label = ?1,
                         properties = ?2,
                         embedding = COALESCE(?3, embedding)
                     WHERE id = ?4 AND user_id = ?5
                     RETURNING id, user_id, label, node_type, properties, created_at, updated_at",
                    params![new_label, properties_json, new_embedding, id_owned, user],
                    row_to_node,
                )
            })
            .await
            .map_err(|e| not_found_on_no_rows(e, node_id))?;
        Ok(node)
    }

    /// Fetch a node inside the caller's partition.
    pub async fn get_node(&self, user_id: &str, node_id: &str) -> Result<Option<Node>> {
        let user = user_id.to_string();
        let id_owned = node_id.to_string();
        let node = self
            .pool
            .run(move |conn| {
                match conn.query_row(
                    "SELECT id, user_id, label, node_type, properties, created_at, updated_at
                     FROM knowledge_nodes WHERE id = ?1 AND user_id = ?2",
                    params![id_owned, user],
                    row_to_node,
                ) {
                    Ok(node) => Ok(Some(node)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await?;
        Ok(node)
    }

    /// Create an edge. Both endpoints must belong to the caller; the
    /// `(source, target, edge_type)` uniqueness constraint surfaces as a
    /// store conflict.
    #[instrument(skip(self), fields(user_id, edge_type))]
    pub async fn add_edge(
        &self,
        user_id: &str,
        source_id: &str,
        target_id: &str,
        edge_type: &str,
        weight: f64,
    ) -> Result<Edge> {
        let user = user_id.to_string();
        let source = source_id.to_string();
        let target = target_id.to_string();
        let owned: i64 = self
            .pool
            .run({
                let (user, source, target) = (user.clone(), source.clone(), target.clone());
                move |conn| {
                    conn.query_row(
                        "SELECT COUNT(*) FROM knowledge_nodes
                         WHERE user_id = ?1 AND id IN (?2, ?3)",
                        params![user, source, target],
                        |row| row.get(0),
                    )
                }
            })
            .await?;
        let expected = if source_id == target_id { 1 } else { 2 };
        if owned < expected {
            return Err(GraphError::Unauthorized {
                id: format!("{source_id}->{target_id}"),
            });
        }

        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let type_owned = edge_type.to_string();

        let edge = self
            .pool
            .run(move |conn| {
                conn.query_row(
                    "INSERT INTO knowledge_edges
                     (id, source_id, target_id, edge_type, weight, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                     RETURNING id, source_id, target_id, edge_type, weight, properties, created_at",
                    params![id, source, target, type_owned, weight, now],
                    row_to_edge,
                )
            })
            .await?;
        Ok(edge)
    }

    /// Rank the user's nodes by cosine similarity to the query. The
    /// threshold is expressed as similarity in [-1, 1] (not distance);
    /// ties break by id ascending.
    #[instrument(skip(self, query), fields(user_id, limit))]
    pub async fn search_nodes(
        &self,
        user_id: &str,
        query: &str,
        node_type: Option<&str>,
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<Node>> {
        let query_embedding = self.embedder.embed(query).await?;

        let user = user_id.to_string();
        let type_owned = node_type.map(String::from);
        let blob = embedding_to_bytes(&query_embedding);
        let rows: Vec<(Node, f32)> = self
            .pool
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, label, node_type, properties, created_at, updated_at,
                            vec_distance_cosine(embedding, ?1) AS distance
                     FROM knowledge_nodes
                     WHERE user_id = ?2
                       AND embedding IS NOT NULL
                       AND (?3 IS NULL OR node_type = ?3)
                     ORDER BY distance ASC, id ASC
                     LIMIT ?4",
                )?;
                let rows = stmt.query_map(params![blob, user, type_owned, limit as i64], |row| {
                    let node = row_to_node(row)?;
                    let distance: f32 = row.get(7)?;
                    Ok((node, distance))
                })?;
                rows.collect::<std::result::Result<Vec<_>, _>>()
            })
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(mut node, distance)| {
                let similarity = distance_to_similarity(distance);
                (similarity >= min_similarity).then(|| {
                    node.similarity = Some(similarity);
                    node
                })
            })
            .collect())
    }

    /// Neighbor nodes in the given direction, optionally restricted to one
    /// edge type. `Both` runs as a single union query.
    pub async fn get_neighbors(
        &self,
        user_id: &str,
        node_id: &str,
        direction: Direction,
        edge_type: Option<&str>,
    ) -> Result<Vec<Node>> {
        // Ownership gate: a foreign node id yields Unauthorized, not an
        // empty neighbor list.
        if self.get_node(user_id, node_id).await?.is_none() {
            return Err(GraphError::Unauthorized {
                id: node_id.to_string(),
            });
        }

        let out_sql = "SELECT n.id, n.user_id, n.label, n.node_type, n.properties,
                              n.created_at, n.updated_at
                       FROM knowledge_edges e
                       JOIN knowledge_nodes n ON n.id = e.target_id
                       WHERE e.source_id = ?1 AND (?2 IS NULL OR e.edge_type = ?2)";
        let in_sql = "SELECT n.id, n.user_id, n.label, n.node_type, n.properties,
                             n.created_at, n.updated_at
                      FROM knowledge_edges e
                      JOIN knowledge_nodes n ON n.id = e.source_id
                      WHERE e.target_id = ?1 AND (?2 IS NULL OR e.edge_type = ?2)";
        let sql = match direction {
            Direction::Out => out_sql.to_string(),
            Direction::In => in_sql.to_string(),
            Direction::Both => format!("{out_sql} UNION {in_sql}"),
        };

        let id_owned = node_id.to_string();
        let type_owned = edge_type.map(String::from);
        let nodes = self
            .pool
            .run(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![id_owned, type_owned], row_to_node)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()
            })
            .await?;
        Ok(nodes)
    }

    /// BFS in SQL: a recursive CTE over edge ids, bounded by depth and
    /// cycle-guarded through the accumulated path string. Every node on the
    /// path stays inside the caller's partition. Returns the node ids from
    /// source to target, or `None` when no path exists within `max_depth`.
    #[instrument(skip(self), fields(user_id, max_depth))]
    pub async fn find_path(
        &self,
        user_id: &str,
        source_id: &str,
        target_id: &str,
        max_depth: u32,
        edge_types: Option<&[String]>,
    ) -> Result<Option<Vec<String>>> {
        for id in [source_id, target_id] {
            if self.get_node(user_id, id).await?.is_none() {
                return Err(GraphError::Unauthorized { id: id.to_string() });
            }
        }

        let type_filter = match edge_types {
            Some(types) if !types.is_empty() => {
                let placeholders: Vec<String> = (0..types.len())
                    .map(|i| format!("?{}", i + 5))
                    .collect();
                format!("AND e.edge_type IN ({})", placeholders.join(", "))
            }
            _ => String::new(),
        };

        let sql = format!(
            "WITH RECURSIVE walk(node_id, path, depth) AS (
                 SELECT ?1, ?1, 0
                 UNION ALL
                 SELECT e.target_id, walk.path || '>' || e.target_id, walk.depth + 1
                 FROM knowledge_edges e
                 JOIN walk ON e.source_id = walk.node_id
                 JOIN knowledge_nodes n ON n.id = e.target_id AND n.user_id = ?3
                 WHERE walk.depth < ?4
                   AND instr(walk.path, e.target_id) = 0
                   {type_filter}
             )
             SELECT path FROM walk WHERE node_id = ?2 ORDER BY depth ASC LIMIT 1"
        );

        let mut bound: Vec<rusqlite::types::Value> = vec![
            rusqlite::types::Value::Text(source_id.to_string()),
            rusqlite::types::Value::Text(target_id.to_string()),
            rusqlite::types::Value::Text(user_id.to_string()),
            rusqlite::types::Value::Integer(max_depth as i64),
        ];
        if let Some(types) = edge_types {
            for t in types {
                bound.push(rusqlite::types::Value::Text(t.clone()));
            }
        }

        let path: Option<String> = self
            .pool
            .run(move |conn| {
                match conn.query_row(&sql, rusqlite::params_from_iter(bound), |row| {
                    row.get::<_, String>(0)
                }) {
                    Ok(p) => Ok(Some(p)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await?;

        debug!(found = path.is_some(), "path query finished");
        Ok(path.map(|p| p.split('>').map(String::from).collect()))
    }

    /// Delete a node and every incident edge in one transaction.
    pub async fn delete_node(&self, user_id: &str, node_id: &str) -> Result<bool> {
        let user = user_id.to_string();
        let id_owned = node_id.to_string();
        let removed = self
            .pool
            .transaction(move |tx| {
                tx.execute(
                    "DELETE FROM knowledge_edges
                     WHERE source_id = ?1 OR target_id = ?1",
                    params![id_owned],
                )?;
                tx.execute(
                    "DELETE FROM knowledge_nodes WHERE id = ?1 AND user_id = ?2",
                    params![id_owned, user],
                )
            })
            .await?;
        Ok(removed > 0)
    }

    /// Delete an edge after verifying that its endpoints belong to the
    /// caller.
    pub async fn delete_edge(&self, user_id: &str, edge_id: &str) -> Result<bool> {
        let user = user_id.to_string();
        let id_owned = edge_id.to_string();
        let outcome = self
            .pool
            .run(move |conn| {
                let owner: Option<String> = match conn.query_row(
                    "SELECT n.user_id FROM knowledge_edges e
                     JOIN knowledge_nodes n ON n.id = e.source_id
                     WHERE e.id = ?1",
                    params![id_owned],
                    |row| row.get(0),
                ) {
                    Ok(o) => Some(o),
                    Err(rusqlite::Error::QueryReturnedNoRows) => None,
                    Err(e) => return Err(e),
                };

                match owner {
                    None => Ok(DeleteOutcome::Missing),
                    Some(o) if o != user => Ok(DeleteOutcome::Foreign),
                    Some(_) => {
                        conn.execute("DELETE FROM knowledge_edges WHERE id = ?1", params![id_owned])?;
                        Ok(DeleteOutcome::Deleted)
                    }
                }
            })
            .await?;

        match outcome {
            DeleteOutcome::Deleted => Ok(true),
            DeleteOutcome::Missing => Ok(false),
            DeleteOutcome::Foreign => Err(GraphError::Unauthorized {
                id: edge_id.to_string(),
            }),
        }
    }
}

enum DeleteOutcome {
    Deleted,
    Missing,
    Foreign,
}

fn not_found_on_no_rows(err: mnemo_store::StoreError, id: &str) -> GraphError {
    match err {
        mnemo_store::StoreError::Query(rusqlite::Error::QueryReturnedNoRows) => {
            GraphError::NotFound { id: id.to_string() }
        }
        other => GraphError::Store(other),
    }
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<Node> {
    let properties: Option<String> = row.get(4)?;
    Ok(Node {
        id: row.get(0)?,
        user_id: row.get(1)?,
        label: row.get(2)?,
        node_type: row.get(3)?,
        properties: properties.and_then(|p| serde_json::from_str(&p).ok()),
        similarity: None,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<Edge> {
    let properties: Option<String> = row.get(5)?;
    Ok(Edge {
        id: row.get(0)?,
        source_id: row.get(1)?,
        target_id: row.get(2)?,
        edge_type: row.get(3)?,
        weight: row.get(4)?,
        properties: properties.and_then(|p| serde_json::from_str(&p).ok()),
        created_at: row.get(6)?,
    })
}
