//! Query-time flow: embed, search the tenant namespace, normalise, rehydrate, rerank and
//! optionally synthesise a grounded answer.
//!
//! Chunks whose vectors never reached the index are scored directly from their stored,
//! encrypted embeddings and merged into the same ranking.
//!
//! Callers only ever see [`SearchError`]; the underlying embedding, key, index and store
//! failures are logged and collapsed into [`SearchError::Unavailable`].

pub mod answer;
pub mod rerank;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::context::{AccessDecision, RequestContext, authorize_tenant};
use crate::crypto::{KeyError, SecretKey, TenantKeyManager, VectorCodec};
use crate::embedding::{EmbeddingClient, EmbeddingClientError};
use crate::generation::AnswerGenerator;
use crate::index::{IndexError, IndexGateway, ScoreKind, cosine_similarity, normalize_score};
use crate::metrics::ServiceMetrics;
use crate::models::Chunk;
use crate::store::{ChunkStore, StoreError};

pub use answer::SynthesizedAnswer;

/// Search parameters supplied by the caller.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    /// Natural-language query.
    pub query: String,
    /// Result count; clamped to the configured maximum.
    #[serde(default)]
    pub top_k: Option<usize>,
    /// Apply the lexical term boost.
    #[serde(default)]
    pub rerank: bool,
    /// Synthesise a grounded answer when a generator is configured.
    #[serde(default)]
    pub augment: bool,
}

/// One ranked chunk.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    /// Chunk identifier.
    pub chunk_id: Uuid,
    /// Owning document.
    pub doc_id: Uuid,
    /// Position of the chunk within its document.
    pub sequence: u32,
    /// Engine-native score.
    pub raw_score: f32,
    /// Similarity, higher is better: `[0, 1]` for distance engines, the engine's cosine in
    /// `[-1, 1]` for similarity engines and for chunks scored from stored embeddings.
    pub normalized_score: f32,
    /// Ranking score: `normalized_score`, boosted when reranking.
    pub score: f32,
    /// Chunk text.
    pub text: String,
    /// Page and section of the chunk.
    pub metadata: Map<String, Value>,
}

/// Search output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    /// Results, best first.
    pub results: Vec<SearchResult>,
    /// `results.len()`.
    pub total_results: usize,
    /// Grounded answer, when requested and available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<SynthesizedAnswer>,
    /// Wall-clock time spent serving the request.
    pub latency_ms: u64,
}

/// Caller-facing search failures.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The request itself is unusable.
    #[error("invalid search request: {0}")]
    InvalidRequest(String),
    /// The caller may not search this tenant.
    #[error("search not permitted")]
    Forbidden,
    /// The time budget ran out.
    #[error("search timed out")]
    Timeout,
    /// Something behind the search failed; details are only logged.
    #[error("search unavailable")]
    Unavailable,
}

#[derive(Debug, Error)]
enum RetrievalFailure {
    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbeddingClientError),
    #[error("embedding provider returned no vector")]
    EmptyEmbedding,
    #[error("query embedding has dimension {actual}, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("tenant key unavailable: {0}")]
    Key(#[from] KeyError),
    #[error("index query failed: {0}")]
    Index(#[from] IndexError),
    #[error("chunk lookup failed: {0}")]
    Store(#[from] StoreError),
}

/// Limits applied to every search.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalSettings {
    /// Upper bound for one search, end to end.
    pub timeout: Duration,
    /// Result count when the caller gives none.
    pub default_top_k: usize,
    /// Largest accepted result count.
    pub max_top_k: usize,
}

impl RetrievalSettings {
    /// Settings from the search section of the configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.search_timeout(),
            default_top_k: config.search_default_top_k.max(1),
            max_top_k: config.search_max_top_k.max(1),
        }
    }
}

/// Collaborators used at query time.
#[derive(Clone)]
pub struct RetrievalComponents {
    /// Chunk rows for rehydration.
    pub chunks: Arc<dyn ChunkStore>,
    /// Query embeddings.
    pub embedder: Arc<dyn EmbeddingClient>,
    /// Tenant data keys.
    pub keys: Arc<TenantKeyManager>,
    /// Tenant namespaces.
    pub index: IndexGateway,
    /// Optional answer synthesis.
    pub generator: Option<Arc<dyn AnswerGenerator>>,
    /// Shared counters.
    pub metrics: Arc<ServiceMetrics>,
}

/// Serves tenant-scoped semantic search.
pub struct RetrievalOrchestrator {
    components: RetrievalComponents,
    settings: RetrievalSettings,
}

impl RetrievalOrchestrator {
    /// Orchestrator over `components`.
    pub fn new(components: RetrievalComponents, settings: RetrievalSettings) -> Self {
        Self {
            components,
            settings,
        }
    }

    /// Search the caller's tenant.
    ///
    /// The whole call, including answer synthesis, is bounded by the smaller of the context
    /// deadline and the configured timeout. A tenant without an index namespace only gets
    /// chunks scored from their stored embeddings.
    pub async fn search(
        &self,
        ctx: &RequestContext,
        request: SearchRequest,
    ) -> Result<SearchResponse, SearchError> {
        let started = Instant::now();
        let result = self.search_inner(ctx, request, started).await;
        self.components.metrics.record_search(result.is_ok());
        result
    }

    async fn search_inner(
        &self,
        ctx: &RequestContext,
        request: SearchRequest,
        started: Instant,
    ) -> Result<SearchResponse, SearchError> {
        if let AccessDecision::Denied(reason) = authorize_tenant(ctx) {
            tracing::warn!(request_id = %ctx.request_id, reason = %reason, "Search rejected");
            return Err(SearchError::Forbidden);
        }
        let query = request.query.trim();
        if query.is_empty() {
            return Err(SearchError::InvalidRequest("query must not be empty".into()));
        }
        let top_k = request
            .top_k
            .unwrap_or(self.settings.default_top_k)
            .clamp(1, self.settings.max_top_k);

        let budget = ctx.budget(self.settings.timeout);
        let outcome = tokio::time::timeout(budget, async {
            let mut results = self.retrieve(ctx, query, top_k).await?;
            if request.rerank {
                rerank::rerank(query, &mut results);
            }
            let answer = if request.augment {
                self.answer(ctx, query, &results).await
            } else {
                None
            };
            Ok::<_, RetrievalFailure>((results, answer))
        })
        .await;

        let (results, answer) = match outcome {
            Ok(Ok(found)) => found,
            Ok(Err(failure)) => {
                tracing::error!(
                    tenant_id = %ctx.tenant_id,
                    request_id = %ctx.request_id,
                    error = %failure,
                    "Search failed"
                );
                return Err(SearchError::Unavailable);
            }
            Err(_) => {
                tracing::warn!(
                    tenant_id = %ctx.tenant_id,
                    request_id = %ctx.request_id,
                    budget_ms = budget.as_millis() as u64,
                    "Search timed out"
                );
                return Err(SearchError::Timeout);
            }
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            tenant_id = %ctx.tenant_id,
            user_id = ctx.user_id.as_deref().unwrap_or("-"),
            request_id = %ctx.request_id,
            top_k,
            results = results.len(),
            rerank = request.rerank,
            answered = answer.is_some(),
            latency_ms,
            "Search served"
        );
        Ok(SearchResponse {
            total_results: results.len(),
            results,
            answer,
            latency_ms,
        })
    }

    async fn retrieve(
        &self,
        ctx: &RequestContext,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<SearchResult>, RetrievalFailure> {
        let RetrievalComponents {
            chunks,
            embedder,
            keys,
            index,
            ..
        } = &self.components;
        let tenant_id = ctx.tenant_id.as_str();

        let vector = embedder
            .generate_embeddings(vec![query.to_string()])
            .await?
            .pop()
            .ok_or(RetrievalFailure::EmptyEmbedding)?;
        if vector.len() != embedder.dimension() {
            return Err(RetrievalFailure::DimensionMismatch {
                expected: embedder.dimension(),
                actual: vector.len(),
            });
        }

        let key = keys.get_or_provision(tenant_id).await?;
        let mut matches: Vec<_> = index
            .query(tenant_id, &key, &vector, top_k)
            .await?
            .into_iter()
            .map(|hit| {
                let similarity = normalize_score(hit.score_kind, hit.raw_score);
                (hit, similarity)
            })
            .collect();
        matches.sort_by(|a, b| b.1.total_cmp(&a.1));

        let ids: Vec<Uuid> = matches.iter().map(|(hit, _)| hit.chunk_id).collect();
        let mut rows: HashMap<Uuid, _> = if ids.is_empty() {
            HashMap::new()
        } else {
            chunks
                .get_chunks(tenant_id, &ids)
                .await?
                .into_iter()
                .map(|chunk| (chunk.id, chunk))
                .collect()
        };

        let mut results: Vec<SearchResult> = matches
            .into_iter()
            .filter_map(|(hit, similarity)| {
                let chunk = rows.remove(&hit.chunk_id)?;
                Some(search_result(chunk, hit.raw_score, similarity))
            })
            .collect();

        let stale = ids.len() - results.len();
        if stale > 0 {
            tracing::debug!(tenant_id, stale, "Skipped index hits without chunk rows");
        }

        let unindexed = self.score_unindexed(tenant_id, &key, &vector).await?;
        if !unindexed.is_empty() {
            results.retain(|hit| unindexed.iter().all(|other| other.chunk_id != hit.chunk_id));
            results.extend(unindexed);
            results.sort_by(|a, b| b.normalized_score.total_cmp(&a.normalized_score));
            results.truncate(top_k);
        }
        Ok(results)
    }

    /// Score the tenant's unindexed chunks against `query` by decrypting their stored
    /// embeddings. Embeddings that cannot be opened with the current key are skipped.
    async fn score_unindexed(
        &self,
        tenant_id: &str,
        key: &SecretKey,
        query: &[f32],
    ) -> Result<Vec<SearchResult>, RetrievalFailure> {
        let pending = self.components.chunks.unindexed_chunks(tenant_id).await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let codec = VectorCodec::new(key);
        let mut skipped = 0;
        let mut results = Vec::with_capacity(pending.len());
        for chunk in pending {
            let vector = match codec.decode(&chunk.encrypted_embedding) {
                Ok(vector) if vector.len() == query.len() => vector,
                _ => {
                    skipped += 1;
                    continue;
                }
            };
            let raw_score = cosine_similarity(query, &vector);
            let similarity = normalize_score(ScoreKind::Similarity, raw_score);
            results.push(search_result(chunk, raw_score, similarity));
        }
        if skipped > 0 {
            tracing::warn!(tenant_id, skipped, "Stored embeddings could not be scored");
        }
        tracing::debug!(
            tenant_id,
            scored = results.len(),
            "Scored unindexed chunks from stored embeddings"
        );
        Ok(results)
    }

    async fn answer(
        &self,
        ctx: &RequestContext,
        query: &str,
        results: &[SearchResult],
    ) -> Option<SynthesizedAnswer> {
        let generator = self.components.generator.as_ref()?;
        if results.is_empty() {
            return None;
        }
        match answer::synthesize(generator.as_ref(), query, results).await {
            Ok(answer) => Some(answer),
            Err(error) => {
                tracing::warn!(
                    tenant_id = %ctx.tenant_id,
                    request_id = %ctx.request_id,
                    error = %error,
                    "Answer synthesis failed; returning results only"
                );
                None
            }
        }
    }
}

fn search_result(chunk: Chunk, raw_score: f32, similarity: f32) -> SearchResult {
    let mut metadata = Map::new();
    metadata.insert("page_number".into(), serde_json::json!(chunk.page_number));
    metadata.insert("section".into(), serde_json::json!(chunk.section));
    SearchResult {
        chunk_id: chunk.id,
        doc_id: chunk.doc_id,
        sequence: chunk.sequence,
        raw_score,
        normalized_score: similarity,
        score: similarity,
        text: chunk.text,
        metadata,
    }
}
