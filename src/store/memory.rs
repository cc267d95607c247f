//! In-memory implementation of every store trait.
//!
//! All tables live behind a single `tokio::sync::RwLock`, so each trait call observes and
//! mutates a consistent snapshot. That is what makes chunk replacement, run claims and the
//! insert-if-absent primitives atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use time::OffsetDateTime;

use super::{ChunkStore, DocumentStore, KeyStore, RunClaim, StoreError};
use crate::models::{Chunk, Document, DocumentStatus, TenantEncryptionKey};

#[derive(Default)]
struct Tables {
    documents: HashMap<Uuid, Document>,
    chunks: HashMap<Uuid, Chunk>,
    chunks_by_doc: HashMap<Uuid, Vec<Uuid>>,
    keys: Vec<TenantEncryptionKey>,
}

impl Tables {
    fn document_with_hash(&self, tenant_id: &str, file_hash: &str) -> Option<&Document> {
        self.documents
            .values()
            .filter(|doc| doc.tenant_id == tenant_id && doc.file_hash == file_hash)
            .min_by_key(|doc| doc.created_at)
    }

    fn drop_chunks_of(&mut self, doc_id: Uuid) -> usize {
        let ids = self.chunks_by_doc.remove(&doc_id).unwrap_or_default();
        for id in &ids {
            self.chunks.remove(id);
        }
        ids.len()
    }
}

/// Process-local store for development and tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of chunk rows across all documents.
    pub async fn chunk_count(&self) -> usize {
        self.tables.read().await.chunks.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_document(&self, document: Document) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.documents.contains_key(&document.id) {
            return Err(StoreError::Conflict(format!(
                "document {} already exists",
                document.id
            )));
        }
        if let Some(existing) = tables.document_with_hash(&document.tenant_id, &document.file_hash)
        {
            return Err(StoreError::Conflict(format!(
                "content already stored as document {}",
                existing.id
            )));
        }
        tables.documents.insert(document.id, document);
        Ok(())
    }

    async fn insert_unique(&self, document: Document) -> Result<Option<Document>, StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.document_with_hash(&document.tenant_id, &document.file_hash)
        {
            return Ok(Some(existing.clone()));
        }
        tables.documents.insert(document.id, document);
        Ok(None)
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>, StoreError> {
        Ok(self.tables.read().await.documents.get(&id).cloned())
    }

    async fn find_by_hash(
        &self,
        tenant_id: &str,
        file_hash: &str,
    ) -> Result<Option<Document>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.document_with_hash(tenant_id, file_hash).cloned())
    }

    async fn update_document(&self, document: &Document) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        match tables.documents.get_mut(&document.id) {
            Some(existing) => {
                *existing = document.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "document",
                id: document.id.to_string(),
            }),
        }
    }

    async fn claim_run(&self, id: Uuid) -> Result<RunClaim, StoreError> {
        let mut tables = self.tables.write().await;
        let Some(document) = tables.documents.get_mut(&id) else {
            return Ok(RunClaim::Missing);
        };
        if !document.status.can_transition_to(DocumentStatus::Extracting) {
            return Ok(RunClaim::InFlight(document.status));
        }
        document.status = DocumentStatus::Extracting;
        document.error_message = None;
        document.updated_at = OffsetDateTime::now_utc();
        Ok(RunClaim::Started(document.clone()))
    }

    async fn delete_document(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let removed = tables.documents.remove(&id).is_some();
        let chunks = tables.drop_chunks_of(id);
        tracing::debug!(document_id = %id, removed, chunks, "Deleted document rows");
        Ok(removed)
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn replace_chunks(&self, doc_id: Uuid, chunks: Vec<Chunk>) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.documents.contains_key(&doc_id) {
            return Err(StoreError::NotFound {
                entity: "document",
                id: doc_id.to_string(),
            });
        }
        if let Some(stray) = chunks.iter().find(|chunk| chunk.doc_id != doc_id) {
            return Err(StoreError::Conflict(format!(
                "chunk {} belongs to document {}",
                stray.id, stray.doc_id
            )));
        }

        tables.drop_chunks_of(doc_id);
        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            ids.push(chunk.id);
            tables.chunks.insert(chunk.id, chunk);
        }
        tables.chunks_by_doc.insert(doc_id, ids);
        Ok(())
    }

    async fn chunks_for_document(&self, doc_id: Uuid) -> Result<Vec<Chunk>, StoreError> {
        let tables = self.tables.read().await;
        let mut chunks: Vec<Chunk> = tables
            .chunks_by_doc
            .get(&doc_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.chunks.get(id).cloned())
            .collect();
        chunks.sort_by_key(|chunk| chunk.sequence);
        Ok(chunks)
    }

    async fn get_chunks(&self, tenant_id: &str, ids: &[Uuid]) -> Result<Vec<Chunk>, StoreError> {
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.chunks.get(id))
            .filter(|chunk| chunk.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn unindexed_chunks(&self, tenant_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let tables = self.tables.read().await;
        let mut chunks: Vec<Chunk> = tables
            .chunks
            .values()
            .filter(|chunk| chunk.tenant_id == tenant_id && !chunk.indexed)
            .cloned()
            .collect();
        chunks.sort_by_key(|chunk| (chunk.doc_id, chunk.sequence));
        Ok(chunks)
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn active_key(&self, tenant_id: &str) -> Result<Option<TenantEncryptionKey>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .keys
            .iter()
            .find(|key| key.tenant_id == tenant_id && key.is_active)
            .cloned())
    }

    async fn insert_active(&self, mut record: TenantEncryptionKey) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        for key in tables
            .keys
            .iter_mut()
            .filter(|key| key.tenant_id == record.tenant_id)
        {
            key.is_active = false;
        }
        record.is_active = true;
        tables.keys.push(record);
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        mut record: TenantEncryptionKey,
    ) -> Result<TenantEncryptionKey, StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .keys
            .iter()
            .find(|key| key.tenant_id == record.tenant_id && key.is_active)
        {
            return Ok(existing.clone());
        }
        record.is_active = true;
        tables.keys.push(record.clone());
        Ok(record)
    }

    async fn keys_for_tenant(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<TenantEncryptionKey>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .keys
            .iter()
            .filter(|key| key.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}
