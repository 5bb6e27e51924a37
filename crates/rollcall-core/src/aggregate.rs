//! Component-wise averaging of embeddings.

use crate::types::Embedding;

/// Component-wise arithmetic mean.
///
/// # Panics
///
/// Panics if `embeddings` is empty or the vectors do not all share the same
/// length. Callers feed this from a single model, whose output length is
/// validated at extraction time.
pub fn mean_embedding(embeddings: &[Embedding]) -> Embedding {
    assert!(!embeddings.is_empty(), "cannot average an empty embedding set");
    let dim = embeddings[0].len();
    assert!(
        embeddings.iter().all(|e| e.len() == dim),
        "embeddings must share one length ({dim})"
    );

    let mut sum = vec![0.0f64; dim];
    for e in embeddings {
        for (acc, v) in sum.iter_mut().zip(e.values.iter()) {
            *acc += *v as f64;
        }
    }

    let n = embeddings.len() as f64;
    Embedding::new(sum.into_iter().map(|s| (s / n) as f32).collect())
}

/// Collapse the per-step embeddings of an enrollment into one canonical embedding.
///
/// # Panics
///
/// Same contract as [`mean_embedding`].
pub fn aggregate_registration(embeddings: &[Embedding]) -> Embedding {
    let canonical = mean_embedding(embeddings);
    tracing::debug!(samples = embeddings.len(), dim = canonical.len(), "registration aggregated");
    canonical
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EMBEDDING_DIM;

    fn sample(seed: f32) -> Embedding {
        Embedding::new((0..EMBEDDING_DIM).map(|i| (i as f32 * seed).sin()).collect())
    }

    #[test]
    fn test_singleton_is_identity() {
        let v = sample(0.3);
        assert_eq!(aggregate_registration(std::slice::from_ref(&v)), v);
    }

    #[test]
    fn test_identical_vectors_reproduce_vector() {
        let v = sample(0.7);
        let out = aggregate_registration(&[v.clone(), v.clone(), v.clone()]);
        for (a, b) in out.values.iter().zip(v.values.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mean_is_component_wise() {
        let out = mean_embedding(&[
            Embedding::new(vec![1.0, 0.0, -2.0]),
            Embedding::new(vec![3.0, 2.0, 2.0]),
        ]);
        assert_eq!(out.values, vec![2.0, 1.0, 0.0]);
    }

    #[test]
    #[should_panic(expected = "empty")]
    fn test_empty_input_panics() {
        mean_embedding(&[]);
    }

    #[test]
    #[should_panic(expected = "share one length")]
    fn test_mismatched_lengths_panic() {
        mean_embedding(&[Embedding::new(vec![1.0, 2.0]), Embedding::new(vec![1.0])]);
    }
}
