//! Grounded-answer generation through a local model runtime.
//!
//! Generation is optional; when no provider is configured search responses carry results
//! only. The Ollama-backed client issues HTTP requests directly to the runtime.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{Config, GenerationProvider};

const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Errors surfaced while generating an answer.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Provider was unreachable.
    #[error("Answer provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// Provider returned an error response.
    #[error("Failed to generate answer: {0}")]
    GenerationFailed(String),
    /// Provider response could not be parsed.
    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
}

/// Retrieved passage handed to the model.
#[derive(Debug, Clone)]
pub struct AnswerContext {
    /// Chunk the passage came from.
    pub chunk_id: Uuid,
    /// Passage text, already trimmed to its budget.
    pub text: String,
}

/// Question plus the passages the answer must stay within.
#[derive(Debug, Clone)]
pub struct AnswerRequest {
    /// Caller's query.
    pub query: String,
    /// Passages in rank order.
    pub contexts: Vec<AnswerContext>,
}

/// Model output.
#[derive(Debug, Clone)]
pub struct GeneratedAnswer {
    /// Answer text.
    pub answer: String,
    /// Chunks the answer was grounded on.
    pub sources: Vec<Uuid>,
    /// Prompt plus completion tokens reported by the provider.
    pub tokens_used: u32,
}

/// Interface implemented by answer-generation providers.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// Answer `request.query` using only `request.contexts`.
    async fn generate(&self, request: AnswerRequest) -> Result<GeneratedAnswer, GenerationError>;
}

/// Build the generator selected by configuration; `None` when generation is disabled.
pub fn build_answer_generator(
    config: &Config,
) -> Result<Option<Arc<dyn AnswerGenerator>>, GenerationError> {
    match config.generation_provider {
        GenerationProvider::None => Ok(None),
        GenerationProvider::Ollama => {
            let base_url = config
                .ollama_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
            Ok(Some(Arc::new(OllamaAnswerGenerator::new(
                base_url,
                config.generation_model.clone(),
            )?)))
        }
    }
}

/// Prompt instructing the model to answer from numbered passages only.
pub fn build_prompt(request: &AnswerRequest) -> String {
    let mut prompt = String::from(
        "Answer the question using only the numbered passages below. \
         Cite passages as [n]. If the passages do not contain the answer, say so.\n\n",
    );
    for (idx, context) in request.contexts.iter().enumerate() {
        prompt.push_str(&format!("[{}] {}\n\n", idx + 1, context.text));
    }
    prompt.push_str(&format!("Question: {}\nAnswer:", request.query));
    prompt
}

/// Ollama `/api/generate` client.
pub struct OllamaAnswerGenerator {
    http: Client,
    base_url: String,
    model: String,
}

impl OllamaAnswerGenerator {
    /// Client for `model` served at `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, GenerationError> {
        let http = Client::builder()
            .user_agent("ragvault/answer")
            .build()
            .map_err(|err| GenerationError::ProviderUnavailable(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            model: model.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    done: bool,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[async_trait]
impl AnswerGenerator for OllamaAnswerGenerator {
    async fn generate(&self, request: AnswerRequest) -> Result<GeneratedAnswer, GenerationError> {
        let payload = json!({
            "model": self.model,
            "prompt": build_prompt(&request),
            "stream": false,
            "options": {
                "temperature": 0.1,
            }
        });

        let response = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                GenerationError::ProviderUnavailable(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(GenerationError::ProviderUnavailable(format!(
                "Ollama endpoint {} returned 404",
                self.endpoint()
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::GenerationFailed(format!(
                "Ollama returned {status}: {body}"
            )));
        }

        let body: OllamaResponse = response.json().await.map_err(|error| {
            GenerationError::InvalidResponse(format!("failed to decode Ollama response: {error}"))
        })?;

        if !body.done {
            return Err(GenerationError::InvalidResponse(
                "Ollama response incomplete (streaming not supported)".into(),
            ));
        }

        Ok(GeneratedAnswer {
            answer: body.response.trim().to_string(),
            sources: request.contexts.iter().map(|c| c.chunk_id).collect(),
            tokens_used: body.prompt_eval_count + body.eval_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    fn request() -> AnswerRequest {
        AnswerRequest {
            query: "What is the refund window?".into(),
            contexts: vec![AnswerContext {
                chunk_id: Uuid::new_v4(),
                text: "Refunds are accepted within 30 days.".into(),
            }],
        }
    }

    #[test]
    fn prompt_numbers_passages_and_ends_with_question() {
        let prompt = build_prompt(&request());
        assert!(prompt.contains("[1] Refunds are accepted within 30 days."));
        assert!(prompt.ends_with("Question: What is the refund window?\nAnswer:"));
    }

    #[tokio::test]
    async fn ollama_generator_handles_successful_response() {
        let server = MockServer::start_async().await;
        let generator = OllamaAnswerGenerator::new(server.base_url(), "llama").unwrap();

        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(200).json_body(json!({
                    "response": " Thirty days [1]. ",
                    "done": true,
                    "prompt_eval_count": 40,
                    "eval_count": 5
                }));
            })
            .await;

        let req = request();
        let expected_source = req.contexts[0].chunk_id;
        let answer = generator.generate(req).await.expect("answer");

        mock.assert();
        assert_eq!(answer.answer, "Thirty days [1].");
        assert_eq!(answer.sources, vec![expected_source]);
        assert_eq!(answer.tokens_used, 45);
    }

    #[tokio::test]
    async fn ollama_generator_handles_error_status() {
        let server = MockServer::start_async().await;
        let generator = OllamaAnswerGenerator::new(server.base_url(), "llama").unwrap();

        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(500).body("boom");
            })
            .await;

        let error = generator.generate(request()).await.expect_err("error response");
        assert!(matches!(error, GenerationError::GenerationFailed(message) if message.contains("500")));
    }
}
