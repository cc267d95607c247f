//! Document ingestion: extract, clean, chunk, embed, encrypt, index, persist.
//!
//! [`IngestionPipeline`] drives one document through the status machine. It runs inline
//! ([`IngestionPipeline::ingest`]) or behind an [`IngestionWorker`] that applies a
//! [`RetryPolicy`] between runs.

mod ingest;
mod retry;
mod worker;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::{CryptoError, KeyError};
use crate::embedding::EmbeddingClientError;
use crate::extraction::ExtractionError;
use crate::models::DocumentStatus;
use crate::storage::StorageError;
use crate::store::StoreError;

pub use ingest::{IngestionPipeline, PipelineComponents, PipelineSettings, RegisteredUpload};
pub use retry::RetryPolicy;
pub use worker::{IngestionWorker, WorkerError, WorkerEvent, WorkerHandle};

/// Why an ingestion run stopped.
#[derive(Debug, Error)]
pub enum IngestError {
    /// No document with that id.
    #[error("document {0} not found")]
    DocumentNotFound(Uuid),
    /// The caller may not touch the document.
    #[error("access denied: {0}")]
    Forbidden(String),
    /// Raw bytes could not be read.
    #[error("failed to read document bytes: {0}")]
    Storage(#[from] StorageError),
    /// The extractor rejected the document.
    #[error("text extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    /// Nothing usable came out of the document.
    #[error("{0}")]
    EmptyContent(String),
    /// The embedding provider failed.
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingClientError),
    /// The embedding provider answered with the wrong shape.
    #[error("embedding response rejected: {0}")]
    InvalidEmbeddings(String),
    /// The tenant key could not be obtained.
    #[error("tenant key unavailable: {0}")]
    Key(#[from] KeyError),
    /// Vector encryption failed.
    #[error("vector encryption failed: {0}")]
    Crypto(#[from] CryptoError),
    /// Persistence failed.
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    /// The document is not in a state the pipeline can advance.
    #[error("cannot move document from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: DocumentStatus,
        /// Requested status.
        to: DocumentStatus,
    },
}

impl IngestError {
    /// Whether a queued run may be re-attempted after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(StorageError::Io(_)) => true,
            Self::Embedding(_) | Self::InvalidEmbeddings(_) | Self::Store(_) => true,
            Self::Key(KeyError::Store(_)) => true,
            Self::DocumentNotFound(_)
            | Self::Forbidden(_)
            | Self::Storage(_)
            | Self::Extraction(_)
            | Self::EmptyContent(_)
            | Self::Key(_)
            | Self::Crypto(_)
            | Self::InvalidTransition { .. } => false,
        }
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    /// Processed document.
    pub document_id: Uuid,
    /// Final status (always `completed` for a returned outcome).
    pub status: DocumentStatus,
    /// Chunks persisted.
    pub chunk_count: usize,
    /// Records accepted by the index engine.
    pub indexed: usize,
    /// Batches the index engine rejected.
    pub index_failures: usize,
    /// Whether part of the document is missing from the index.
    pub degraded: bool,
}
