//! Embedding BLOB helpers shared by every vector-bearing table.

/// Serialize an embedding as the little-endian f32 BLOB sqlite-vec expects.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Deserialize an embedding BLOB back into f32s.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Convert a cosine distance (0..2) into a similarity in [-1, 1].
/// All search thresholds in this workspace are expressed as similarity.
pub fn distance_to_similarity(distance: f32) -> f32 {
    1.0 - distance
}
