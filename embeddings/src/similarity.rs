//! Similarity scores for embeddings.
//!
//! Retrieval standardizes on cosine distance end to end: the store orders by
//! `1 - cos(a, b)` and scores are reported as `similarity = 1 - distance`,
//! clamped to `[-1, 1]`.

/// Convert a raw cosine distance into a similarity score.
///
/// Exact for cosine distance; out-of-range distances (other metrics, float
/// noise) are clamped into `[-1, 1]`.
pub fn similarity_from_distance(distance: f64) -> f64 {
    (1.0 - distance).clamp(-1.0, 1.0)
}
