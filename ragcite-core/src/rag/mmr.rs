//! Maximal Marginal Relevance (MMR) for diversity-aware retrieval.
//!
//! MMR reranks candidates to balance relevance and diversity:
//! MMR = λ × similarity(query, doc) - (1-λ) × max(similarity(doc, selected_docs))
//!
//! λ = 1.0: Pure relevance (standard search)
//! λ = 0.5: Balanced relevance + diversity
//! λ = 0.0: Pure diversity

use super::similarity::cosine_similarity;

/// Selects up to `k` candidate indices by Maximal Marginal Relevance.
///
/// # Arguments
/// * `query` - Query vector
/// * `candidates` - Candidate vectors, in descending relevance order
/// * `k` - Number of results to select
/// * `lambda` - Balance factor (0.0 = diversity, 1.0 = relevance), clamped
///
/// # Returns
/// Indices into `candidates`, in selection order. The first pick is always
/// candidate 0; on equal MMR scores the earlier candidate wins.
pub fn mmr_select(query: &[f32], candidates: &[Vec<f32>], k: usize, lambda: f32) -> Vec<usize> {
    if candidates.is_empty() || k == 0 {
        return Vec::new();
    }

    let lambda = lambda.clamp(0.0, 1.0);
    let k = k.min(candidates.len());
    let relevance: Vec<f32> = candidates.iter().map(|c| cosine_similarity(query, c)).collect();

    let mut selected: Vec<usize> = Vec::with_capacity(k);
    let mut remaining: Vec<usize> = (0..candidates.len()).collect();

    selected.push(remaining.remove(0));

    while selected.len() < k && !remaining.is_empty() {
        let mut best_pos = 0;
        let mut best_mmr = f32::NEG_INFINITY;

        for (pos, &idx) in remaining.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|&s| cosine_similarity(&candidates[idx], &candidates[s]))
                .fold(f32::NEG_INFINITY, f32::max);
            let mmr_score = lambda * relevance[idx] - (1.0 - lambda) * redundancy;

            // Strict comparison: ties keep the earlier relevance rank.
            if mmr_score > best_mmr {
                best_mmr = mmr_score;
                best_pos = pos;
            }
        }

        selected.push(remaining.remove(best_pos));
    }

    selected
}
