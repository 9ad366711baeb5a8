use serde::{Deserialize, Serialize};

/// A labeled, optionally typed graph node with an embedding over
/// `label` + `node_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub user_id: String,
    pub label: String,
    pub node_type: Option<String>,
    pub properties: Option<serde_json::Value>,
    /// Populated only by similarity search.
    pub similarity: Option<f32>,
    pub created_at: String,
    pub updated_at: String,
}

/// A typed, weighted, directed edge. Both endpoints always belong to the
/// same user; `(source, target, edge_type)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub edge_type: String,
    pub weight: f64,
    pub properties: Option<serde_json::Value>,
    pub created_at: String,
}

/// Traversal direction for neighbor queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Out,
    In,
    Both,
}
