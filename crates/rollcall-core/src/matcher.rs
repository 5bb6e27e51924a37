//! Cosine similarity and best-match selection against a registered set.

use crate::types::{Embedding, Match, RegisteredIdentity};

/// Minimum similarity for a candidate to count as a match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.7;

/// Cosine similarity between two vectors.
///
/// Returns a value in [-1, 1], or 0.0 when either vector has zero norm.
/// When the lengths differ, both are truncated to the shorter length and a
/// warning is logged.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        tracing::warn!(
            left = a.len(),
            right = b.len(),
            "embedding length mismatch; comparing common prefix"
        );
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        dot / denom
    } else {
        0.0
    }
}

/// Pick the candidate with the strictly highest similarity to `query`.
///
/// Returns `None` when the candidate list is empty or the best score is below
/// `threshold`. Ties keep the earliest candidate.
pub fn find_best_match(
    query: &Embedding,
    candidates: &[RegisteredIdentity],
    threshold: f32,
) -> Option<Match> {
    let mut best_sim = f32::NEG_INFINITY;
    let mut best_idx: Option<usize> = None;

    for (i, candidate) in candidates.iter().enumerate() {
        let sim = query.similarity(&candidate.embedding);
        if sim > best_sim {
            best_sim = sim;
            best_idx = Some(i);
        }
    }

    match best_idx {
        Some(idx) if best_sim >= threshold => {
            let winner = &candidates[idx];
            tracing::debug!(
                identity = %winner.id,
                similarity = best_sim,
                candidates = candidates.len(),
                "best match selected"
            );
            Some(Match {
                identity_id: winner.id.clone(),
                name: winner.name.clone(),
                similarity: best_sim,
            })
        }
        _ => {
            tracing::debug!(
                best = if best_idx.is_some() { best_sim } else { 0.0 },
                threshold,
                candidates = candidates.len(),
                "no candidate cleared threshold"
            );
            None
        }
    }
}

/// Strategy for comparing a probe embedding against the registered set.
pub trait Matcher {
    fn best_match(
        &self,
        query: &Embedding,
        candidates: &[RegisteredIdentity],
        threshold: f32,
    ) -> Option<Match>;
}

/// Nearest-neighbour matcher on cosine similarity.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(
        &self,
        query: &Embedding,
        candidates: &[RegisteredIdentity],
        threshold: f32,
    ) -> Option<Match> {
        find_best_match(query, candidates, threshold)
    }
}
