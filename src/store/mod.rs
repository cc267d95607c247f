//! Persistence contracts for documents, chunks and tenant keys.
//!
//! The pipeline and the retrieval orchestrator only talk to these traits. Any backend that
//! keeps the invariants below is acceptable:
//!
//! | Trait | Invariant |
//! |-------|-----------|
//! | [`DocumentStore`] | one document per tenant and content hash; deleting a document cascades to its chunks; `claim_run` is a compare-and-set on status |
//! | [`ChunkStore`] | `replace_chunks` swaps a document's chunk set atomically |
//! | [`KeyStore`] | at most one active key per tenant |
//!
//! [`MemoryStore`] keeps everything in process memory; [`SqliteStore`] persists to a file so
//! wrapped keys and document rows survive a restart.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use std::sync::Arc;

use crate::config::{Config, StoreBackend};
use crate::models::{Chunk, Document, DocumentStatus, TenantEncryptionKey};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Failures reported by persistence backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind, e.g. `document`.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },
    /// A uniqueness constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Backend-specific failure.
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Outcome of trying to start an ingestion run on a document.
#[derive(Debug, Clone, PartialEq)]
pub enum RunClaim {
    /// The document moved to `extracting`; the caller owns the run.
    Started(Document),
    /// Another run holds the document in the given state.
    InFlight(DocumentStatus),
    /// No such document.
    Missing,
}

/// Document rows.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document; fails with `Conflict` when the id exists or the tenant already
    /// stores the same content.
    async fn insert_document(&self, document: Document) -> Result<(), StoreError>;

    /// Insert `document` unless its tenant already has one with the same content hash.
    ///
    /// Returns the existing document when there is one, in which case nothing is written.
    async fn insert_unique(&self, document: Document) -> Result<Option<Document>, StoreError>;

    /// Fetch a document by id.
    async fn get_document(&self, id: Uuid) -> Result<Option<Document>, StoreError>;

    /// Find a tenant's document by content hash.
    async fn find_by_hash(
        &self,
        tenant_id: &str,
        file_hash: &str,
    ) -> Result<Option<Document>, StoreError>;

    /// Overwrite an existing document row.
    async fn update_document(&self, document: &Document) -> Result<(), StoreError>;

    /// Move a document to `extracting` if its current status allows a new run.
    ///
    /// The check and the write happen as one step, so two callers racing on the same
    /// document cannot both start a run. The error message of a previous failure is cleared.
    async fn claim_run(&self, id: Uuid) -> Result<RunClaim, StoreError>;

    /// Remove a document and every chunk it owns. Returns whether a row was removed.
    async fn delete_document(&self, id: Uuid) -> Result<bool, StoreError>;
}

/// Chunk rows.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Replace the full chunk set of `doc_id` in one step.
    async fn replace_chunks(&self, doc_id: Uuid, chunks: Vec<Chunk>) -> Result<(), StoreError>;

    /// Chunks of one document ordered by sequence.
    async fn chunks_for_document(&self, doc_id: Uuid) -> Result<Vec<Chunk>, StoreError>;

    /// Chunks of `tenant_id` with the given ids, in the order requested.
    ///
    /// Unknown ids and ids owned by another tenant are omitted.
    async fn get_chunks(&self, tenant_id: &str, ids: &[Uuid]) -> Result<Vec<Chunk>, StoreError>;

    /// Chunks of `tenant_id` whose vectors never reached the index.
    async fn unindexed_chunks(&self, tenant_id: &str) -> Result<Vec<Chunk>, StoreError>;
}

/// Wrapped tenant keys.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// The active key record of a tenant.
    async fn active_key(&self, tenant_id: &str) -> Result<Option<TenantEncryptionKey>, StoreError>;

    /// Store `record` as the tenant's active key, deactivating any previous one.
    async fn insert_active(&self, record: TenantEncryptionKey) -> Result<(), StoreError>;

    /// Store `record` only when the tenant has no active key.
    ///
    /// Returns the record that is active afterwards, which is the existing one when another
    /// writer got there first.
    async fn insert_if_absent(
        &self,
        record: TenantEncryptionKey,
    ) -> Result<TenantEncryptionKey, StoreError>;

    /// All key records of a tenant, newest last.
    async fn keys_for_tenant(&self, tenant_id: &str)
    -> Result<Vec<TenantEncryptionKey>, StoreError>;
}

/// The three store seams wired into the pipeline and the key manager.
#[derive(Clone)]
pub struct StoreHandles {
    /// Document rows.
    pub documents: Arc<dyn DocumentStore>,
    /// Chunk rows.
    pub chunks: Arc<dyn ChunkStore>,
    /// Wrapped tenant keys.
    pub keys: Arc<dyn KeyStore>,
}

impl StoreHandles {
    /// Use one backend for every table.
    pub fn shared<T>(store: Arc<T>) -> Self
    where
        T: DocumentStore + ChunkStore + KeyStore + 'static,
    {
        Self {
            documents: store.clone(),
            chunks: store.clone(),
            keys: store,
        }
    }
}

/// Open the backend selected by `STORE_BACKEND`.
pub fn build_stores(config: &Config) -> Result<StoreHandles, StoreError> {
    match config.store_backend {
        StoreBackend::Memory => Ok(StoreHandles::shared(Arc::new(MemoryStore::new()))),
        StoreBackend::Sqlite => {
            let store = SqliteStore::open(&config.database_path)?;
            tracing::info!(path = %config.database_path, "Opened SQLite store");
            Ok(StoreHandles::shared(Arc::new(store)))
        }
    }
}
