//! Vector similarity helpers shared by chunking, retrieval and the memory index.

pub fn magnitude(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity in `[-1, 1]`. Zero vectors are treated as dissimilar to
/// everything (similarity 0). Vectors must have equal length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "cosine_similarity on vectors of different length");

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let (ma, mb) = (magnitude(a), magnitude(b));
    if ma == 0.0 || mb == 0.0 {
        return 0.0;
    }

    (dot / (ma * mb)).clamp(-1.0, 1.0)
}

/// `1 - cosine_similarity`, in `[0, 2]`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Percentile with linear interpolation between closest ranks.
///
/// `p` is in `[0, 100]`. Returns `None` for an empty sample.
pub fn percentile(values: &[f32], p: f32) -> Option<f32> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f32;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f32;

    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }

    #[test]
    fn test_percentile_interpolates() {
        let values = [0.1, 0.9];
        let p95 = percentile(&values, 95.0).unwrap();
        assert!((p95 - 0.86).abs() < 1e-6);
        assert_eq!(percentile(&values, 0.0), Some(0.1));
        assert_eq!(percentile(&values, 100.0), Some(0.9));
    }

    #[test]
    fn test_percentile_single_and_empty() {
        assert_eq!(percentile(&[0.4], 95.0), Some(0.4));
        assert_eq!(percentile(&[], 95.0), None);
    }

    #[test]
    fn test_percentile_unsorted_input() {
        let values = [0.5, 0.1, 0.3];
        assert_eq!(percentile(&values, 50.0), Some(0.3));
    }
}
