use super::types::ScoreKind;

/// Cosine similarity of two vectors in `[-1, 1]`; 0 when either has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

/// Convert an engine score into a similarity.
///
/// Distances map to `max(0, 1 - d)`, which lies in `[0, 1]` for every non-negative finite
/// distance; a non-finite distance maps to 0. Similarities pass through unchanged, so a
/// cosine engine can report values in `[-1, 1]`.
pub fn normalize_score(kind: ScoreKind, raw: f32) -> f32 {
    match kind {
        ScoreKind::Distance if !raw.is_finite() => 0.0,
        ScoreKind::Distance => (1.0 - raw).clamp(0.0, 1.0),
        ScoreKind::Similarity => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distances_normalize_into_unit_interval() {
        for raw in [-3.0_f32, -0.0, 0.0, 0.25, 1.0, 1.5, 2.0, 1e9, f32::MIN, f32::MAX] {
            let normalized = normalize_score(ScoreKind::Distance, raw);
            assert!((0.0..=1.0).contains(&normalized), "{raw} -> {normalized}");
        }
        assert_eq!(normalize_score(ScoreKind::Distance, 0.25), 0.75);
        assert_eq!(normalize_score(ScoreKind::Distance, f32::NAN), 0.0);
        assert_eq!(normalize_score(ScoreKind::Distance, f32::INFINITY), 0.0);
    }

    #[test]
    fn cosine_similarity_spans_opposite_to_identical() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 3.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 1.0], &[-1.0, -1.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn similarities_pass_through() {
        assert_eq!(normalize_score(ScoreKind::Similarity, 0.42), 0.42);
        assert_eq!(normalize_score(ScoreKind::Similarity, -0.1), -0.1);
    }

    #[test]
    fn lower_distance_never_ranks_below_higher_distance() {
        let mut previous = f32::INFINITY;
        for step in 0..=40 {
            let normalized = normalize_score(ScoreKind::Distance, step as f32 * 0.05);
            assert!(normalized <= previous);
            previous = normalized;
        }
    }
}
