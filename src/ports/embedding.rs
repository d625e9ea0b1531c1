//! Optional embedding port, behind the `embeddings` feature.
//!
//! Similarity never depends on this being correct: feature-overlap scoring
//! is the fallback and must satisfy the property tests on its own.

use async_trait::async_trait;

use crate::errors::CilResult;

#[async_trait]
pub trait EmbeddingPort: Send + Sync {
    async fn embed(&self, text: &str) -> CilResult<Vec<f32>>;
}

/// Cosine similarity in [0, 1]; `None` when either vector is degenerate.
pub fn cosine(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(((dot / (norm_a * norm_b)) + 1.0) / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_parallel_vectors_is_one() {
        let v = vec![1.0f32, 2.0, 3.0];
        assert!((cosine(&v, &v).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_vectors_yield_none() {
        assert!(cosine(&[], &[]).is_none());
        assert!(cosine(&[0.0, 0.0], &[1.0, 1.0]).is_none());
    }
}
