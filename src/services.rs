//! Service wiring: builds every component from a [`Config`] and exposes the operations the
//! HTTP surface needs through [`VaultApi`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::context::RequestContext;
use crate::crypto::{CryptoError, SecretKey, TenantKeyManager};
use crate::embedding::{EmbeddingClientError, build_embedding_client};
use crate::extraction::PlainTextExtractor;
use crate::generation::{GenerationError, build_answer_generator};
use crate::index::{IndexError, IndexGateway, build_index_engine};
use crate::metrics::{MetricsSnapshot, ServiceMetrics};
use crate::models::{DocType, Document};
use crate::pipeline::{
    IngestError, IngestOutcome, IngestionPipeline, IngestionWorker, PipelineComponents,
    PipelineSettings, RegisteredUpload, RetryPolicy, WorkerError, WorkerHandle,
};
use crate::processing::ChunkingError;
use crate::retrieval::{
    RetrievalComponents, RetrievalOrchestrator, RetrievalSettings, SearchError, SearchRequest,
    SearchResponse,
};
use crate::storage::LocalFileStorage;
use crate::store::{StoreError, build_stores};

/// Failures while assembling the service graph.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// `MASTER_KEY` is not a base64-encoded 32-byte key.
    #[error("invalid MASTER_KEY: {0}")]
    MasterKey(#[source] CryptoError),
    /// Chunker settings are unusable.
    #[error(transparent)]
    Chunking(#[from] ChunkingError),
    /// Embedding client could not be built.
    #[error(transparent)]
    Embedding(#[from] EmbeddingClientError),
    /// Answer generator could not be built.
    #[error(transparent)]
    Generation(#[from] GenerationError),
    /// Index engine could not be built.
    #[error(transparent)]
    Index(#[from] IndexError),
    /// Persistence backend could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors queueing a document.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The document is missing or not the caller's.
    #[error(transparent)]
    Ingest(#[from] IngestError),
    /// No worker is accepting documents.
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Operations offered to external surfaces.
#[async_trait]
pub trait VaultApi: Send + Sync {
    /// Store uploaded bytes as a new document (or return the duplicate).
    async fn upload(
        &self,
        ctx: &RequestContext,
        filename: &str,
        doc_type: Option<DocType>,
        bytes: Vec<u8>,
    ) -> Result<RegisteredUpload, IngestError>;

    /// Current document state.
    async fn document(&self, ctx: &RequestContext, id: Uuid) -> Result<Document, IngestError>;

    /// Run the pipeline inline.
    async fn ingest(&self, ctx: &RequestContext, id: Uuid) -> Result<IngestOutcome, IngestError>;

    /// Hand the document to the worker pool.
    async fn enqueue(&self, ctx: &RequestContext, id: Uuid) -> Result<(), EnqueueError>;

    /// Delete a document with its chunks and vectors.
    async fn delete(&self, ctx: &RequestContext, id: Uuid) -> Result<bool, IngestError>;

    /// Semantic search over the caller's tenant.
    async fn search(
        &self,
        ctx: &RequestContext,
        request: SearchRequest,
    ) -> Result<SearchResponse, SearchError>;

    /// Counter snapshot.
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

/// Every long-lived component of a running instance.
pub struct Services {
    /// Ingestion pipeline.
    pub pipeline: Arc<IngestionPipeline>,
    /// Query orchestrator.
    pub retrieval: Arc<RetrievalOrchestrator>,
    /// Tenant key manager shared by both.
    pub keys: Arc<TenantKeyManager>,
    /// Shared counters.
    pub metrics: Arc<ServiceMetrics>,
    worker: Option<WorkerHandle>,
    retry_policy: RetryPolicy,
    workers: usize,
}

impl Services {
    /// Build stores, clients, pipeline and orchestrator from configuration.
    pub fn from_config(config: &Config) -> Result<Self, ServiceError> {
        let master = SecretKey::from_base64(&config.master_key).map_err(ServiceError::MasterKey)?;
        let stores = build_stores(config)?;
        let metrics = Arc::new(ServiceMetrics::new());
        let keys = Arc::new(TenantKeyManager::new(
            stores.keys.clone(),
            master,
            config.key_cache_ttl(),
        ));

        tracing::info!(provider = ?config.embedding_provider, "Initializing embedding client");
        let embedder = build_embedding_client(config)?;
        let engine = build_index_engine(config)?;
        let index = IndexGateway::new(engine, config.namespace_prefix.clone());
        let generator = build_answer_generator(config)?;

        let pipeline = IngestionPipeline::new(
            PipelineComponents {
                documents: stores.documents.clone(),
                chunks: stores.chunks.clone(),
                storage: Arc::new(LocalFileStorage::new(&config.storage_root)),
                extractor: Arc::new(PlainTextExtractor),
                embedder: embedder.clone(),
                keys: keys.clone(),
                index: index.clone(),
                metrics: metrics.clone(),
            },
            PipelineSettings::from_config(config)?,
        );
        let retrieval = RetrievalOrchestrator::new(
            RetrievalComponents {
                chunks: stores.chunks,
                embedder,
                keys: keys.clone(),
                index,
                generator,
                metrics: metrics.clone(),
            },
            RetrievalSettings::from_config(config),
        );
        tracing::info!(
            store_backend = ?config.store_backend,
            index_backend = ?config.index_backend,
            generation = ?config.generation_provider,
            "Services ready"
        );

        Ok(Self {
            pipeline: Arc::new(pipeline),
            retrieval: Arc::new(retrieval),
            keys,
            metrics,
            worker: None,
            retry_policy: RetryPolicy::queued(config.ingest_max_retries),
            workers: config.ingest_workers,
        })
    }

    /// Start the queued-ingestion worker; `enqueue` fails until this is called.
    pub fn start_worker(&mut self) -> JoinHandle<()> {
        let (handle, task) =
            IngestionWorker::new(self.pipeline.clone(), self.retry_policy, self.workers).start();
        self.worker = Some(handle);
        task
    }

    /// Handle of the running worker, if started.
    pub fn worker(&self) -> Option<&WorkerHandle> {
        self.worker.as_ref()
    }
}

#[async_trait]
impl VaultApi for Services {
    async fn upload(
        &self,
        ctx: &RequestContext,
        filename: &str,
        doc_type: Option<DocType>,
        bytes: Vec<u8>,
    ) -> Result<RegisteredUpload, IngestError> {
        self.pipeline
            .register_upload(ctx, filename, doc_type, &bytes)
            .await
    }

    async fn document(&self, ctx: &RequestContext, id: Uuid) -> Result<Document, IngestError> {
        self.pipeline.document_for(ctx, id).await
    }

    async fn ingest(&self, ctx: &RequestContext, id: Uuid) -> Result<IngestOutcome, IngestError> {
        self.pipeline.ingest_for(ctx, id).await
    }

    async fn enqueue(&self, ctx: &RequestContext, id: Uuid) -> Result<(), EnqueueError> {
        let worker = self.worker.as_ref().ok_or(WorkerError::Stopped)?;
        self.pipeline.document_for(ctx, id).await?;
        worker.enqueue(id).await?;
        Ok(())
    }

    async fn delete(&self, ctx: &RequestContext, id: Uuid) -> Result<bool, IngestError> {
        self.pipeline.delete_document(ctx, id).await
    }

    async fn search(
        &self,
        ctx: &RequestContext,
        request: SearchRequest,
    ) -> Result<SearchResponse, SearchError> {
        self.retrieval.search(ctx, request).await
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use std::collections::HashMap;

    fn config(extra: &[(&str, &str)]) -> Config {
        let mut map: HashMap<String, String> = HashMap::new();
        map.insert("MASTER_KEY".into(), BASE64.encode([9u8; 32]));
        map.insert(
            "STORAGE_ROOT".into(),
            std::env::temp_dir()
                .join(format!("ragvault-services-{}", Uuid::new_v4()))
                .display()
                .to_string(),
        );
        for (key, value) in extra {
            map.insert(key.to_string(), value.to_string());
        }
        Config::from_lookup(|key| map.get(key).cloned()).unwrap()
    }

    #[test]
    fn rejects_a_short_master_key() {
        let mut cfg = config(&[]);
        cfg.master_key = BASE64.encode([1u8; 8]);
        assert!(matches!(
            Services::from_config(&cfg),
            Err(ServiceError::MasterKey(_))
        ));
    }

    #[tokio::test]
    async fn upload_ingest_and_search_round_trip() {
        let services = Services::from_config(&config(&[("CHUNK_TOKENIZER", "approx")])).unwrap();
        let ctx = RequestContext::new("acme");
        let upload = services
            .upload(
                &ctx,
                "policy.md",
                None,
                b"# Refunds\n\nRefunds are issued within thirty days of purchase.".to_vec(),
            )
            .await
            .unwrap();

        let outcome = services.ingest(&ctx, upload.document.id).await.unwrap();
        assert_eq!(outcome.chunk_count, 1);

        let response = services
            .search(
                &ctx,
                SearchRequest {
                    query: "refunds thirty days".into(),
                    ..SearchRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(response.total_results, 1);
        assert_eq!(
            response.results[0].metadata["section"],
            serde_json::json!("Refunds")
        );
        assert_eq!(services.metrics_snapshot().documents_completed, 1);
    }

    #[tokio::test]
    async fn enqueue_requires_a_running_worker() {
        let mut services = Services::from_config(&config(&[])).unwrap();
        let ctx = RequestContext::new("acme");
        let upload = services
            .upload(&ctx, "a.txt", None, b"queued body text".to_vec())
            .await
            .unwrap();

        assert!(matches!(
            services.enqueue(&ctx, upload.document.id).await,
            Err(EnqueueError::Worker(WorkerError::Stopped))
        ));

        let task = services.start_worker();
        services.enqueue(&ctx, upload.document.id).await.unwrap();
        services.worker().unwrap().shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn sqlite_backend_keeps_documents_and_keys_across_restarts() {
        let database = std::env::temp_dir()
            .join(format!("ragvault-services-{}", Uuid::new_v4()))
            .join("vault.db")
            .display()
            .to_string();
        let cfg = config(&[
            ("CHUNK_TOKENIZER", "approx"),
            ("STORE_BACKEND", "sqlite"),
            ("DATABASE_PATH", &database),
        ]);
        let ctx = RequestContext::new("acme");

        let (document_id, fingerprint) = {
            let services = Services::from_config(&cfg).unwrap();
            let upload = services
                .upload(&ctx, "a.txt", None, b"Badges are renewed every spring.".to_vec())
                .await
                .unwrap();
            services.ingest(&ctx, upload.document.id).await.unwrap();
            let key = services.keys.get_or_provision("acme").await.unwrap();
            (upload.document.id, key.fingerprint())
        };

        let restarted = Services::from_config(&cfg).unwrap();
        let document = restarted.document(&ctx, document_id).await.unwrap();
        assert_eq!(document.status, crate::models::DocumentStatus::Completed);
        assert_eq!(document.chunk_count, 1);
        let key = restarted.keys.get_or_provision("acme").await.unwrap();
        assert_eq!(key.fingerprint(), fingerprint);
    }
}
