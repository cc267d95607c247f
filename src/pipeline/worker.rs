//! Queued ingestion: a bounded pool of tasks pulling document ids from a channel.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use super::{IngestOutcome, IngestionPipeline, RetryPolicy};

const QUEUE_CAPACITY: usize = 1024;
const EVENT_CAPACITY: usize = 256;

/// Progress reported by the worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The dispatch loop is running.
    WorkerStarted,
    /// A document left the queue.
    DocumentStarted {
        /// Document being processed.
        document_id: Uuid,
    },
    /// A document reached `completed`.
    DocumentCompleted(IngestOutcome),
    /// A document ended in `failed` after its retries.
    DocumentFailed {
        /// Failed document.
        document_id: Uuid,
        /// Final error message.
        error: String,
    },
    /// In-flight work drained and the loop exited.
    WorkerStopped,
}

/// Errors talking to a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker no longer accepts work.
    #[error("ingestion worker is not running")]
    Stopped,
}

/// Cloneable control surface of a running [`IngestionWorker`].
#[derive(Clone)]
pub struct WorkerHandle {
    queue_tx: mpsc::Sender<Uuid>,
    shutdown_tx: mpsc::Sender<()>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl WorkerHandle {
    /// Queue a document for ingestion.
    pub async fn enqueue(&self, document_id: Uuid) -> Result<(), WorkerError> {
        self.queue_tx
            .send(document_id)
            .await
            .map_err(|_| WorkerError::Stopped)?;
        tracing::debug!(document_id = %document_id, "Queued document for ingestion");
        Ok(())
    }

    /// Stop taking new documents; documents already running finish first.
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| WorkerError::Stopped)
    }

    /// Subscribe to worker events from now on.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }
}

/// Runs queued documents through the pipeline with retries, `concurrency` at a time.
pub struct IngestionWorker {
    pipeline: Arc<IngestionPipeline>,
    policy: RetryPolicy,
    concurrency: usize,
}

impl IngestionWorker {
    /// Worker over `pipeline`.
    pub fn new(pipeline: Arc<IngestionPipeline>, policy: RetryPolicy, concurrency: usize) -> Self {
        Self {
            pipeline,
            policy,
            concurrency: concurrency.max(1),
        }
    }

    /// Spawn the dispatch loop.
    pub fn start(self) -> (WorkerHandle, JoinHandle<()>) {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let handle = WorkerHandle {
            queue_tx,
            shutdown_tx,
            event_tx: event_tx.clone(),
        };
        let task = tokio::spawn(self.run(queue_rx, shutdown_rx, event_tx));
        (handle, task)
    }

    async fn run(
        self,
        mut queue_rx: mpsc::Receiver<Uuid>,
        mut shutdown_rx: mpsc::Receiver<()>,
        events: broadcast::Sender<WorkerEvent>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let _ = events.send(WorkerEvent::WorkerStarted);
        tracing::info!(
            concurrency = self.concurrency,
            max_retries = self.policy.max_retries,
            "Ingestion worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                next = queue_rx.recv() => {
                    let Some(document_id) = next else { break };
                    let Ok(permit) = semaphore.clone().acquire_owned().await else { break };
                    let pipeline = self.pipeline.clone();
                    let events = events.clone();
                    let policy = self.policy;
                    tasks.spawn(async move {
                        let _permit = permit;
                        let _ = events.send(WorkerEvent::DocumentStarted { document_id });
                        let event = match pipeline.ingest_with_retry(document_id, &policy).await {
                            Ok(outcome) => WorkerEvent::DocumentCompleted(outcome),
                            Err(error) => WorkerEvent::DocumentFailed {
                                document_id,
                                error: error.to_string(),
                            },
                        };
                        let _ = events.send(event);
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(error) = joined {
                        tracing::error!(error = %error, "Ingestion task panicked");
                    }
                }
            }
        }

        tracing::info!(in_flight = tasks.len(), "Ingestion worker draining");
        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                tracing::error!(error = %error, "Ingestion task panicked");
            }
        }
        let _ = events.send(WorkerEvent::WorkerStopped);
        tracing::info!("Ingestion worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::crypto::{SecretKey, TenantKeyManager};
    use crate::embedding::HashEmbeddingClient;
    use crate::extraction::PlainTextExtractor;
    use crate::index::{IndexGateway, MemoryIndex};
    use crate::metrics::ServiceMetrics;
    use crate::models::DocumentStatus;
    use crate::pipeline::{PipelineComponents, PipelineSettings};
    use crate::processing::{Chunker, approx_token_counter};
    use crate::storage::MemoryStorage;
    use crate::store::{DocumentStore, MemoryStore};
    use std::time::Duration;

    fn pipeline(store: Arc<MemoryStore>) -> Arc<IngestionPipeline> {
        let components = PipelineComponents {
            documents: store.clone(),
            chunks: store.clone(),
            storage: Arc::new(MemoryStorage::new()),
            extractor: Arc::new(PlainTextExtractor),
            embedder: Arc::new(HashEmbeddingClient::new(8)),
            keys: Arc::new(TenantKeyManager::new(
                store,
                SecretKey::generate(),
                Duration::from_secs(60),
            )),
            index: IndexGateway::new(Arc::new(MemoryIndex::new()), "tenant"),
            metrics: Arc::new(ServiceMetrics::new()),
        };
        let settings = PipelineSettings {
            chunker: Chunker::new(64, 8, approx_token_counter()).unwrap(),
            batch_size: 4,
        };
        Arc::new(IngestionPipeline::new(components, settings))
    }

    #[tokio::test]
    async fn processes_queued_documents_and_stops_cleanly() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store.clone());
        let ctx = RequestContext::new("acme");

        let mut ids = Vec::new();
        for i in 0..3 {
            let body = format!("Document number {i} describes the quarterly refund process.");
            let upload = pipeline
                .register_upload(&ctx, "doc.txt", None, body.as_bytes())
                .await
                .unwrap();
            ids.push(upload.document.id);
        }

        let (handle, task) = IngestionWorker::new(pipeline, RetryPolicy::none(), 2).start();
        let mut events = handle.events();
        for id in &ids {
            handle.enqueue(*id).await.unwrap();
        }

        let mut completed = 0;
        while completed < ids.len() {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("worker event")
                .unwrap()
            {
                WorkerEvent::DocumentCompleted(outcome) => {
                    assert!(ids.contains(&outcome.document_id));
                    completed += 1;
                }
                WorkerEvent::DocumentFailed { error, .. } => panic!("unexpected failure: {error}"),
                _ => {}
            }
        }

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(handle.enqueue(Uuid::new_v4()).await.is_err());

        for id in ids {
            let document = store.get_document(id).await.unwrap().unwrap();
            assert_eq!(document.status, DocumentStatus::Completed);
        }
    }

    #[tokio::test]
    async fn unknown_documents_are_reported_as_failed() {
        let store = Arc::new(MemoryStore::new());
        let (handle, task) =
            IngestionWorker::new(pipeline(store), RetryPolicy::none(), 1).start();
        let mut events = handle.events();
        let missing = Uuid::new_v4();
        handle.enqueue(missing).await.unwrap();

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("worker event")
                .unwrap();
            if let WorkerEvent::DocumentFailed { document_id, error } = event {
                assert_eq!(document_id, missing);
                assert!(error.contains("not found"));
                break;
            }
        }

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }
}
