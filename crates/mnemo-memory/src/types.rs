use serde::{Deserialize, Serialize};

/// A keyed fact in core memory, bounded per user and ranked for eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreFact {
    pub id: String,
    pub user_id: String,
    pub key: String,
    pub value: String,
    /// 0.0-1.0; part of the eviction score.
    pub importance: f64,
    pub metadata: Option<serde_json::Value>,
    pub access_count: i64,
    pub last_accessed: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// An episodic entry in recall memory. `similarity` is populated only on
/// search results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallItem {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub importance: f64,
    pub access_count: i64,
    pub similarity: Option<f32>,
    pub created_at: String,
}

/// A long-form archival entry, possibly folded into a compression summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivalItem {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub source: String,
    pub metadata: Option<serde_json::Value>,
    pub session_id: Option<String>,
    pub compressed: bool,
    pub compressed_into_id: Option<String>,
    pub created_at: String,
}
