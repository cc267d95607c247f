//! Lexical boost applied on top of vector similarity.

use std::collections::BTreeSet;

use super::SearchResult;

/// Score multiplier added per distinct query term found in a chunk.
pub const TERM_BOOST: f32 = 0.1;

/// Lowercased distinct terms of a query, ignoring single characters.
pub fn query_terms(query: &str) -> BTreeSet<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|term| term.chars().count() > 1)
        .map(str::to_lowercase)
        .collect()
}

/// Boost each result by `1 + 0.1 * matched_terms`, then re-sort by score.
///
/// The boost applies to the similarity clamped into `[0, 1]`; an anti-correlated chunk ranks
/// at 0 instead of having its negative similarity amplified. The sort is stable, so results
/// with equal boosted scores keep their similarity order.
pub fn rerank(query: &str, results: &mut [SearchResult]) {
    let terms = query_terms(query);
    if terms.is_empty() {
        return;
    }

    for result in results.iter_mut() {
        let text = result.text.to_lowercase();
        let matches = terms.iter().filter(|term| text.contains(term.as_str())).count();
        let base = result.normalized_score.clamp(0.0, 1.0);
        result.score = base * (1.0 + TERM_BOOST * matches as f32);
    }
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use uuid::Uuid;

    fn result(text: &str, similarity: f32) -> SearchResult {
        SearchResult {
            chunk_id: Uuid::new_v4(),
            doc_id: Uuid::new_v4(),
            sequence: 1,
            raw_score: 1.0 - similarity,
            normalized_score: similarity,
            score: similarity,
            text: text.to_string(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn terms_are_lowercased_and_deduplicated() {
        let terms = query_terms("Refund REFUND policy, a?");
        assert_eq!(
            terms.into_iter().collect::<Vec<_>>(),
            vec!["policy".to_string(), "refund".to_string()]
        );
    }

    #[test]
    fn matching_terms_lift_a_result() {
        let mut results = vec![
            result("shipping times vary by region", 0.80),
            result("our refund policy lasts thirty days", 0.75),
        ];
        rerank("refund policy", &mut results);
        assert!(results[0].text.contains("refund"));
        assert!((results[0].score - 0.75 * 1.2).abs() < 1e-6);
        assert!((results[1].score - 0.80).abs() < 1e-6);
    }

    #[test]
    fn ties_keep_their_previous_order() {
        let mut results = vec![result("alpha", 0.5), result("beta", 0.5)];
        let first = results[0].chunk_id;
        rerank("gamma", &mut results);
        assert_eq!(results[0].chunk_id, first);
    }

    #[test]
    fn negative_similarities_are_not_amplified() {
        let mut results = vec![
            result("shipping times vary by region", 0.10),
            result("refund policy exceptions", -0.30),
            result("warehouse locations", -0.05),
        ];
        rerank("refund policy", &mut results);

        assert!(results[0].text.contains("shipping"));
        let refund = results
            .iter()
            .find(|hit| hit.text.contains("refund"))
            .unwrap();
        assert_eq!(refund.score, 0.0);
        assert!(results.iter().all(|hit| hit.score >= hit.normalized_score));
    }
}
