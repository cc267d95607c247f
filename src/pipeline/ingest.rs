use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{IngestError, IngestOutcome, RetryPolicy};
use crate::config::Config;
use crate::context::{AccessDecision, RequestContext, authorize_document, authorize_tenant};
use crate::crypto::{SecretKey, TenantKeyManager, VectorCodec};
use crate::embedding::EmbeddingClient;
use crate::extraction::TextExtractor;
use crate::index::{IndexGateway, IndexRecord};
use crate::metrics::ServiceMetrics;
use crate::models::{Chunk, DocType, Document, DocumentStatus, chunk_id, content_hash};
use crate::processing::{
    ChunkPosition, Chunker, ChunkingError, DocumentLayout, TextChunk, build_token_counter,
    clean_text,
};
use crate::storage::BlobStorage;
use crate::store::{ChunkStore, DocumentStore, RunClaim, StoreError};

/// Collaborators the pipeline reads from and writes to.
#[derive(Clone)]
pub struct PipelineComponents {
    /// Document rows.
    pub documents: Arc<dyn DocumentStore>,
    /// Chunk rows.
    pub chunks: Arc<dyn ChunkStore>,
    /// Raw upload bytes.
    pub storage: Arc<dyn BlobStorage>,
    /// Bytes to text.
    pub extractor: Arc<dyn TextExtractor>,
    /// Text to vectors.
    pub embedder: Arc<dyn EmbeddingClient>,
    /// Tenant data keys.
    pub keys: Arc<TenantKeyManager>,
    /// Tenant namespaces in the index engine.
    pub index: IndexGateway,
    /// Shared counters.
    pub metrics: Arc<ServiceMetrics>,
}

/// Tunables of a pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Splitter applied to cleaned text.
    pub chunker: Chunker,
    /// Chunks per embedding request and per index upsert.
    pub batch_size: usize,
}

impl PipelineSettings {
    /// Settings derived from the chunking and batching configuration.
    pub fn from_config(config: &Config) -> Result<Self, ChunkingError> {
        let chunker = Chunker::new(
            config.chunk_max_tokens,
            config.chunk_overlap,
            build_token_counter(&config.chunk_tokenizer),
        )?;
        Ok(Self {
            chunker,
            batch_size: config.embedding_batch_size.max(1),
        })
    }
}

/// Result of registering uploaded bytes.
#[derive(Debug, Clone)]
pub struct RegisteredUpload {
    /// The stored document, or the earlier one with identical content.
    pub document: Document,
    /// Whether the bytes matched an existing document of the tenant.
    pub duplicate: bool,
}

struct PreparedChunk {
    row: Chunk,
    vector: Vec<f32>,
}

/// Moves documents through `uploaded → extracting → chunking → embedding → indexing →
/// completed`, or to `failed` with a reason.
pub struct IngestionPipeline {
    documents: Arc<dyn DocumentStore>,
    chunks: Arc<dyn ChunkStore>,
    storage: Arc<dyn BlobStorage>,
    extractor: Arc<dyn TextExtractor>,
    embedder: Arc<dyn EmbeddingClient>,
    keys: Arc<TenantKeyManager>,
    index: IndexGateway,
    metrics: Arc<ServiceMetrics>,
    settings: PipelineSettings,
}

impl IngestionPipeline {
    /// Assemble a pipeline.
    pub fn new(components: PipelineComponents, settings: PipelineSettings) -> Self {
        let PipelineComponents {
            documents,
            chunks,
            storage,
            extractor,
            embedder,
            keys,
            index,
            metrics,
        } = components;
        Self {
            documents,
            chunks,
            storage,
            extractor,
            embedder,
            keys,
            index,
            metrics,
            settings: PipelineSettings {
                batch_size: settings.batch_size.max(1),
                ..settings
            },
        }
    }

    /// Store uploaded bytes and create an `uploaded` document for the caller's tenant.
    ///
    /// Bytes identical to an existing document of the same tenant are not stored again; the
    /// existing document is returned with `duplicate` set. Concurrent identical uploads
    /// resolve to a single document.
    pub async fn register_upload(
        &self,
        ctx: &RequestContext,
        filename: &str,
        doc_type: Option<DocType>,
        bytes: &[u8],
    ) -> Result<RegisteredUpload, IngestError> {
        if let AccessDecision::Denied(reason) = authorize_tenant(ctx) {
            return Err(IngestError::Forbidden(reason));
        }

        let file_hash = content_hash(bytes);
        if let Some(existing) = self
            .documents
            .find_by_hash(&ctx.tenant_id, &file_hash)
            .await?
        {
            return Ok(Self::duplicate_of(ctx, existing));
        }

        let doc_type = doc_type.unwrap_or_else(|| DocType::from_filename(filename));
        let mut document = Document::new_upload(&ctx.tenant_id, filename, "", doc_type, bytes);
        let tenant_dir = content_hash(ctx.tenant_id.as_bytes());
        document.storage_path = format!("{}/{}", &tenant_dir[..16], document.id);

        self.storage.put_bytes(&document.storage_path, bytes).await?;
        let inserted = self.documents.insert_unique(document.clone()).await;
        let existing = match inserted {
            Ok(existing) => existing,
            Err(error) => {
                self.discard_blob(&document).await;
                return Err(error.into());
            }
        };
        if let Some(existing) = existing {
            self.discard_blob(&document).await;
            return Ok(Self::duplicate_of(ctx, existing));
        }
        tracing::info!(
            tenant_id = %ctx.tenant_id,
            user_id = ctx.user_id.as_deref().unwrap_or("-"),
            document_id = %document.id,
            doc_type = %doc_type,
            size_bytes = document.size_bytes,
            "Registered upload"
        );
        Ok(RegisteredUpload {
            document,
            duplicate: false,
        })
    }

    fn duplicate_of(ctx: &RequestContext, existing: Document) -> RegisteredUpload {
        tracing::info!(
            tenant_id = %ctx.tenant_id,
            user_id = ctx.user_id.as_deref().unwrap_or("-"),
            document_id = %existing.id,
            "Upload matches an existing document"
        );
        RegisteredUpload {
            document: existing,
            duplicate: true,
        }
    }

    async fn discard_blob(&self, document: &Document) {
        if let Err(error) = self.storage.delete_bytes(&document.storage_path).await {
            tracing::warn!(
                tenant_id = %document.tenant_id,
                path = %document.storage_path,
                error = %error,
                "Failed to remove unused upload bytes"
            );
        }
    }

    /// Current state of a document owned by the caller's tenant.
    pub async fn document_for(
        &self,
        ctx: &RequestContext,
        doc_id: Uuid,
    ) -> Result<Document, IngestError> {
        self.authorized_document(ctx, doc_id).await
    }

    /// Run the pipeline inline for a document owned by the caller's tenant.
    pub async fn ingest_for(
        &self,
        ctx: &RequestContext,
        doc_id: Uuid,
    ) -> Result<IngestOutcome, IngestError> {
        self.authorized_document(ctx, doc_id).await?;
        self.ingest(doc_id).await
    }

    /// Run the pipeline inline once; the final status is returned or the run's error.
    pub async fn ingest(&self, doc_id: Uuid) -> Result<IngestOutcome, IngestError> {
        self.ingest_with_retry(doc_id, &RetryPolicy::none()).await
    }

    /// Run the pipeline, re-running retryable failures as `policy` allows.
    ///
    /// Every retry bumps the document's `retry_count`; the failure message of the latest run
    /// stays on the document until the next run starts.
    pub async fn ingest_with_retry(
        &self,
        doc_id: Uuid,
        policy: &RetryPolicy,
    ) -> Result<IngestOutcome, IngestError> {
        let mut retries = 0;
        loop {
            match self.attempt(doc_id).await {
                Ok(outcome) => return Ok(outcome),
                Err(error @ IngestError::InvalidTransition { .. }) => {
                    tracing::warn!(
                        document_id = %doc_id,
                        error = %error,
                        "Ingestion run not started"
                    );
                    return Err(error);
                }
                Err(error) if error.is_retryable() && policy.allows(retries) => {
                    let delay = policy.delay(retries);
                    retries += 1;
                    self.metrics.record_retry();
                    self.bump_retry_count(doc_id).await;
                    tracing::warn!(
                        document_id = %doc_id,
                        retry = retries,
                        max_retries = policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Ingestion run failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    self.metrics.record_failure();
                    tracing::error!(
                        document_id = %doc_id,
                        retries,
                        error = %error,
                        "Ingestion failed"
                    );
                    return Err(error);
                }
            }
        }
    }

    /// Delete a document, its chunk rows and its vectors.
    ///
    /// Vector and byte removal is best-effort; returns `false` when the document does not
    /// exist.
    pub async fn delete_document(
        &self,
        ctx: &RequestContext,
        doc_id: Uuid,
    ) -> Result<bool, IngestError> {
        let document = match self.authorized_document(ctx, doc_id).await {
            Ok(document) => document,
            Err(IngestError::DocumentNotFound(_)) => return Ok(false),
            Err(error) => return Err(error),
        };

        let ids: Vec<Uuid> = self
            .chunks
            .chunks_for_document(doc_id)
            .await?
            .into_iter()
            .map(|chunk| chunk.id)
            .collect();
        if !ids.is_empty()
            && let Err(error) = self.index.delete_points(&document.tenant_id, &ids).await
        {
            tracing::warn!(
                tenant_id = %document.tenant_id,
                document_id = %doc_id,
                error = %error,
                "Failed to remove document vectors from the index"
            );
        }

        let removed = self.documents.delete_document(doc_id).await?;
        self.discard_blob(&document).await;
        tracing::info!(
            tenant_id = %document.tenant_id,
            document_id = %doc_id,
            chunks = ids.len(),
            "Deleted document"
        );
        Ok(removed)
    }

    async fn authorized_document(
        &self,
        ctx: &RequestContext,
        doc_id: Uuid,
    ) -> Result<Document, IngestError> {
        if let AccessDecision::Denied(reason) = authorize_tenant(ctx) {
            return Err(IngestError::Forbidden(reason));
        }
        let document = self.load(doc_id).await?;
        match authorize_document(ctx, &document) {
            AccessDecision::Allowed => Ok(document),
            AccessDecision::Denied(reason) => {
                tracing::warn!(
                    tenant_id = %ctx.tenant_id,
                    request_id = %ctx.request_id,
                    reason = %reason,
                    "Rejected document access"
                );
                Err(IngestError::Forbidden(reason))
            }
        }
    }

    async fn load(&self, doc_id: Uuid) -> Result<Document, IngestError> {
        self.documents
            .get_document(doc_id)
            .await?
            .ok_or(IngestError::DocumentNotFound(doc_id))
    }

    /// Claim the document and run every stage; a document that is already mid-run is left
    /// untouched.
    async fn attempt(&self, doc_id: Uuid) -> Result<IngestOutcome, IngestError> {
        let mut document = match self.documents.claim_run(doc_id).await? {
            RunClaim::Started(document) => document,
            RunClaim::InFlight(status) => {
                return Err(IngestError::InvalidTransition {
                    from: status,
                    to: DocumentStatus::Extracting,
                });
            }
            RunClaim::Missing => return Err(IngestError::DocumentNotFound(doc_id)),
        };
        tracing::info!(
            tenant_id = %document.tenant_id,
            document_id = %document.id,
            status = %document.status,
            "Document status changed"
        );
        match self.run_stages(&mut document).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                self.mark_failed(&mut document, &error).await;
                Err(error)
            }
        }
    }

    async fn run_stages(&self, document: &mut Document) -> Result<IngestOutcome, IngestError> {
        let bytes = self.storage.get_bytes(&document.storage_path).await?;
        let extracted = self.extractor.extract(&bytes, document.doc_type).await?;

        self.advance(document, DocumentStatus::Chunking).await?;
        let layout = DocumentLayout::from_pages(extracted.pages.iter().map(|page| clean_text(page)));
        if layout.is_blank() {
            return Err(IngestError::EmptyContent(
                "No text extracted from document".into(),
            ));
        }
        let text_chunks = self.settings.chunker.chunk(layout.text());
        if text_chunks.is_empty() {
            return Err(IngestError::EmptyContent(
                "Document text could not be split into chunks".into(),
            ));
        }
        let positions = layout.positions(&text_chunks);
        tracing::debug!(
            document_id = %document.id,
            chunks = text_chunks.len(),
            pages = extracted.pages.len(),
            "Chunked document"
        );

        self.advance(document, DocumentStatus::Embedding).await?;
        let key = self.keys.get_or_provision(&document.tenant_id).await?;
        let mut batches = self
            .embed_batches(document, &key, &text_chunks, &positions)
            .await?;

        self.advance(document, DocumentStatus::Indexing).await?;
        let (indexed, index_failures) = self.index_batches(document, &key, &mut batches).await;
        if index_failures > 0 {
            self.metrics.record_upsert_failures(index_failures as u64);
        }

        let rows: Vec<Chunk> = batches
            .into_iter()
            .flatten()
            .map(|prepared| prepared.row)
            .collect();
        let chunk_count = rows.len();
        let upserted: Vec<Uuid> = rows
            .iter()
            .filter(|row| row.indexed)
            .map(|row| row.id)
            .collect();
        self.remove_stale_vectors(document, &rows).await?;
        if let Err(error) = self.chunks.replace_chunks(document.id, rows).await {
            self.retract_vectors(document, &upserted).await;
            return Err(error.into());
        }

        document.chunk_count = chunk_count;
        self.advance(document, DocumentStatus::Completed).await?;
        self.metrics.record_document(chunk_count as u64);
        tracing::info!(
            tenant_id = %document.tenant_id,
            document_id = %document.id,
            chunks = chunk_count,
            indexed,
            index_failures,
            "Document ingested"
        );

        Ok(IngestOutcome {
            document_id: document.id,
            status: document.status,
            chunk_count,
            indexed,
            index_failures,
            degraded: index_failures > 0,
        })
    }

    async fn embed_batches(
        &self,
        document: &Document,
        key: &SecretKey,
        chunks: &[TextChunk],
        positions: &[ChunkPosition],
    ) -> Result<Vec<Vec<PreparedChunk>>, IngestError> {
        let codec = VectorCodec::new(key);
        let dimension = self.embedder.dimension();
        let batch_size = self.settings.batch_size;
        let mut batches = Vec::with_capacity(chunks.len().div_ceil(batch_size));

        for (batch_idx, batch) in chunks.chunks(batch_size).enumerate() {
            let texts = batch.iter().map(|chunk| chunk.text.clone()).collect();
            let vectors = self.embedder.generate_embeddings(texts).await?;
            if vectors.len() != batch.len() {
                return Err(IngestError::InvalidEmbeddings(format!(
                    "expected {} vectors, got {}",
                    batch.len(),
                    vectors.len()
                )));
            }
            if let Some(vector) = vectors.iter().find(|vector| vector.len() != dimension) {
                return Err(IngestError::InvalidEmbeddings(format!(
                    "expected dimension {dimension}, got {}",
                    vector.len()
                )));
            }
            let sealed = codec.encode_batch(&vectors)?;

            let offset = batch_idx * batch_size;
            let prepared = batch
                .iter()
                .zip(&positions[offset..])
                .zip(vectors.into_iter().zip(sealed))
                .map(|((chunk, position), (vector, encrypted_embedding))| PreparedChunk {
                    row: Chunk {
                        id: chunk_id(document.id, chunk.sequence),
                        doc_id: document.id,
                        tenant_id: document.tenant_id.clone(),
                        sequence: chunk.sequence,
                        text: chunk.text.clone(),
                        encrypted_embedding,
                        embedding_dimension: dimension,
                        page_number: position.page_number,
                        section: position.section.clone(),
                        indexed: false,
                    },
                    vector,
                })
                .collect();
            batches.push(prepared);
            tracing::debug!(
                document_id = %document.id,
                batch = batch_idx + 1,
                size = batch.len(),
                "Embedded batch"
            );
        }
        Ok(batches)
    }

    /// Upsert every batch; failures are counted, never raised.
    ///
    /// Rows of accepted batches are flagged `indexed`; the rest stay searchable through their
    /// stored embeddings.
    async fn index_batches(
        &self,
        document: &Document,
        key: &SecretKey,
        batches: &mut [Vec<PreparedChunk>],
    ) -> (usize, usize) {
        let tenant_id = &document.tenant_id;
        if let Err(error) = self
            .index
            .create_namespace(tenant_id, self.embedder.dimension(), key)
            .await
        {
            tracing::warn!(
                tenant_id = %tenant_id,
                document_id = %document.id,
                error = %error,
                "Index namespace unavailable; document is searchable from stored embeddings only"
            );
            return (0, batches.len());
        }

        let mut indexed = 0;
        let mut failures = 0;
        for (batch_idx, batch) in batches.iter_mut().enumerate() {
            let records = batch
                .iter()
                .map(|prepared| IndexRecord {
                    id: prepared.row.id,
                    vector: prepared.vector.clone(),
                    metadata: record_metadata(&prepared.row),
                })
                .collect();
            match self.index.upsert(tenant_id, key, records).await {
                Ok(count) => {
                    indexed += count;
                    for prepared in batch.iter_mut() {
                        prepared.row.indexed = true;
                    }
                }
                Err(error) => {
                    failures += 1;
                    tracing::warn!(
                        tenant_id = %tenant_id,
                        document_id = %document.id,
                        batch = batch_idx + 1,
                        error = %error,
                        "Index upsert failed; continuing without this batch"
                    );
                }
            }
        }
        (indexed, failures)
    }

    /// Drop vectors of chunks a previous run produced but this run did not.
    async fn remove_stale_vectors(
        &self,
        document: &Document,
        rows: &[Chunk],
    ) -> Result<(), IngestError> {
        let current: HashSet<Uuid> = rows.iter().map(|row| row.id).collect();
        let stale: Vec<Uuid> = self
            .chunks
            .chunks_for_document(document.id)
            .await?
            .into_iter()
            .map(|chunk| chunk.id)
            .filter(|id| !current.contains(id))
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        if let Err(error) = self.index.delete_points(&document.tenant_id, &stale).await {
            tracing::warn!(
                tenant_id = %document.tenant_id,
                document_id = %document.id,
                stale = stale.len(),
                error = %error,
                "Failed to remove stale vectors"
            );
        }
        Ok(())
    }

    /// Remove vectors written by a run whose chunk rows could not be saved.
    async fn retract_vectors(&self, document: &Document, ids: &[Uuid]) {
        if ids.is_empty() {
            return;
        }
        match self.index.delete_points(&document.tenant_id, ids).await {
            Ok(()) => tracing::warn!(
                tenant_id = %document.tenant_id,
                document_id = %document.id,
                vectors = ids.len(),
                "Chunk rows not saved; removed this run's vectors"
            ),
            Err(error) => tracing::error!(
                tenant_id = %document.tenant_id,
                document_id = %document.id,
                vectors = ids.len(),
                error = %error,
                "Chunk rows not saved and vectors could not be removed"
            ),
        }
    }

    async fn advance(
        &self,
        document: &mut Document,
        next: DocumentStatus,
    ) -> Result<(), IngestError> {
        let current = document.status;
        if !current.can_transition_to(next) {
            return Err(IngestError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        document.status = next;
        document.updated_at = OffsetDateTime::now_utc();
        self.documents.update_document(document).await?;
        tracing::info!(
            tenant_id = %document.tenant_id,
            document_id = %document.id,
            from = %current,
            status = %next,
            "Document status changed"
        );
        Ok(())
    }

    async fn mark_failed(&self, document: &mut Document, error: &IngestError) {
        if !document.status.can_transition_to(DocumentStatus::Failed) {
            return;
        }
        document.status = DocumentStatus::Failed;
        document.error_message = Some(error.to_string());
        document.updated_at = OffsetDateTime::now_utc();
        match self.documents.update_document(document).await {
            Ok(()) => {}
            Err(StoreError::NotFound { .. }) => {
                tracing::debug!(document_id = %document.id, "Document deleted during its run");
            }
            Err(store_error) => tracing::error!(
                document_id = %document.id,
                error = %store_error,
                "Failed to record ingestion failure"
            ),
        }
    }

    async fn bump_retry_count(&self, doc_id: Uuid) {
        let result = match self.documents.get_document(doc_id).await {
            Ok(Some(mut document)) => {
                document.retry_count += 1;
                document.updated_at = OffsetDateTime::now_utc();
                self.documents.update_document(&document).await
            }
            Ok(None) => return,
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            tracing::warn!(document_id = %doc_id, error = %error, "Failed to record retry");
        }
    }
}

fn record_metadata(row: &Chunk) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("doc_id".into(), json!(row.doc_id));
    metadata.insert("sequence".into(), json!(row.sequence));
    metadata.insert("page_number".into(), json!(row.page_number));
    metadata.insert("section".into(), json!(row.section));
    metadata
}
