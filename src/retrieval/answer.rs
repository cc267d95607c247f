//! Grounded-answer synthesis over the top search results.

use serde::Serialize;
use uuid::Uuid;

use super::SearchResult;
use crate::generation::{AnswerContext, AnswerGenerator, AnswerRequest, GenerationError};

/// Results handed to the generator.
pub const MAX_CONTEXTS: usize = 4;
/// Characters kept from each context.
pub const CONTEXT_CHAR_BUDGET: usize = 1000;
/// Answers below this confidence carry a disclaimer.
pub const CONFIDENCE_THRESHOLD: f32 = 0.5;

const LOW_CONFIDENCE_DISCLAIMER: &str =
    "Low confidence: the retrieved passages may not fully answer this question.";

/// Answer attached to a search response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizedAnswer {
    /// Generated text.
    pub answer: String,
    /// Chunks the answer was grounded on.
    pub sources: Vec<Uuid>,
    /// Retrieval confidence in `[0, 1]`.
    pub confidence: f32,
    /// Present when `confidence` is below the threshold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disclaimer: Option<String>,
    /// Tokens reported by the provider.
    pub tokens_used: u32,
}

/// `0.7 * mean(similarity) + 0.3 * min(count / 5, 1)`; zero for no results.
pub fn confidence(results: &[SearchResult]) -> f32 {
    if results.is_empty() {
        return 0.0;
    }
    let count = results.len() as f32;
    let mean = results.iter().map(|r| r.normalized_score).sum::<f32>() / count;
    (0.7 * mean + 0.3 * (count / 5.0).min(1.0)).clamp(0.0, 1.0)
}

fn truncate_chars(text: &str, budget: usize) -> String {
    match text.char_indices().nth(budget) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Ask `generator` to answer `query` from the leading results.
pub async fn synthesize(
    generator: &dyn AnswerGenerator,
    query: &str,
    results: &[SearchResult],
) -> Result<SynthesizedAnswer, GenerationError> {
    let contexts = results
        .iter()
        .take(MAX_CONTEXTS)
        .map(|result| AnswerContext {
            chunk_id: result.chunk_id,
            text: truncate_chars(&result.text, CONTEXT_CHAR_BUDGET),
        })
        .collect();

    let generated = generator
        .generate(AnswerRequest {
            query: query.to_string(),
            contexts,
        })
        .await?;

    let confidence = confidence(results);
    Ok(SynthesizedAnswer {
        answer: generated.answer,
        sources: generated.sources,
        confidence,
        disclaimer: (confidence < CONFIDENCE_THRESHOLD)
            .then(|| LOW_CONFIDENCE_DISCLAIMER.to_string()),
        tokens_used: generated.tokens_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::GeneratedAnswer;
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::Mutex;

    fn result(similarity: f32, text: &str) -> SearchResult {
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

    #[derive(Default)]
    struct RecordingGenerator {
        seen: Mutex<Option<AnswerRequest>>,
    }

    #[async_trait]
    impl AnswerGenerator for RecordingGenerator {
        async fn generate(
            &self,
            request: AnswerRequest,
        ) -> Result<GeneratedAnswer, GenerationError> {
            let sources = request.contexts.iter().map(|c| c.chunk_id).collect();
            *self.seen.lock().unwrap() = Some(request);
            Ok(GeneratedAnswer {
                answer: "Thirty days.".into(),
                sources,
                tokens_used: 12,
            })
        }
    }

    #[test]
    fn confidence_blends_similarity_and_coverage() {
        let five: Vec<_> = (0..5).map(|_| result(0.8, "x")).collect();
        assert!((confidence(&five) - (0.7 * 0.8 + 0.3)).abs() < 1e-6);

        let one = vec![result(0.5, "x")];
        assert!((confidence(&one) - (0.35 + 0.06)).abs() < 1e-6);
        assert_eq!(confidence(&[]), 0.0);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }

    #[tokio::test]
    async fn passes_at_most_four_trimmed_contexts() {
        let long = "a".repeat(CONTEXT_CHAR_BUDGET + 50);
        let results: Vec<_> = (0..6).map(|_| result(0.9, &long)).collect();
        let generator = RecordingGenerator::default();

        let answer = synthesize(&generator, "question", &results).await.unwrap();
        let seen = generator.seen.lock().unwrap().take().unwrap();
        assert_eq!(seen.contexts.len(), MAX_CONTEXTS);
        assert!(
            seen.contexts
                .iter()
                .all(|c| c.text.chars().count() == CONTEXT_CHAR_BUDGET)
        );
        assert_eq!(answer.sources.len(), MAX_CONTEXTS);
        assert!(answer.disclaimer.is_none());
    }

    #[tokio::test]
    async fn weak_results_get_a_disclaimer_but_keep_the_answer() {
        let results = vec![result(0.2, "barely related")];
        let answer = synthesize(&RecordingGenerator::default(), "q", &results)
            .await
            .unwrap();
        assert_eq!(answer.answer, "Thirty days.");
        assert!(answer.disclaimer.is_some());
        assert!(answer.confidence < CONFIDENCE_THRESHOLD);
    }
}
