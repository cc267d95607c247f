//! SQLite implementation of every store trait.
//!
//! One connection sits behind a mutex and every call runs on the blocking pool. Multi-step
//! operations use `IMMEDIATE` transactions, so they stay atomic even when a second process
//! opens the same file.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{ChunkStore, DocumentStore, KeyStore, RunClaim, StoreError};
use crate::models::{Chunk, DocType, Document, DocumentStatus, TenantEncryptionKey};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        file_hash TEXT NOT NULL,
        doc_type TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        storage_path TEXT NOT NULL,
        filename TEXT NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        chunk_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE (tenant_id, file_hash)
    );

    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        doc_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        tenant_id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        text TEXT NOT NULL,
        encrypted_embedding BLOB NOT NULL,
        embedding_dimension INTEGER NOT NULL,
        page_number INTEGER,
        section TEXT,
        indexed INTEGER NOT NULL DEFAULT 1
    );
    CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(doc_id, sequence);
    CREATE INDEX IF NOT EXISTS idx_chunks_unindexed ON chunks(tenant_id) WHERE indexed = 0;

    CREATE TABLE IF NOT EXISTS tenant_keys (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        fingerprint TEXT NOT NULL,
        wrapped_key BLOB NOT NULL,
        is_active INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_tenant_keys_active
        ON tenant_keys(tenant_id) WHERE is_active = 1;
";

const DOCUMENT_COLUMNS: &str = "id, tenant_id, file_hash, doc_type, size_bytes, storage_path, \
     filename, status, error_message, retry_count, chunk_count, created_at, updated_at";

const CHUNK_COLUMNS: &str = "id, doc_id, tenant_id, sequence, text, encrypted_embedding, \
     embedding_dimension, page_number, section, indexed";

const KEY_COLUMNS: &str = "id, tenant_id, fingerprint, wrapped_key, is_active, created_at";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => Self::Conflict(err.to_string()),
            _ => Self::Backend(err.to_string()),
        }
    }
}

/// File-backed store; wrapped keys and document rows survive restarts.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                StoreError::Backend(format!("cannot create {}: {err}", parent.display()))
            })?;
        }
        Self::initialize(Connection::open(path)?)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, StoreError> {
        apply_pragmas(&conn)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Backend(format!("store task failed: {err}")))?
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 5000;
        PRAGMA foreign_keys = ON;
        ",
    )?;
    Ok(())
}

fn timestamp(at: OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos()).unwrap_or(i64::MAX)
}

fn datetime(nanos: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .map_err(|err| StoreError::Backend(format!("invalid timestamp {nanos}: {err}")))
}

fn uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|err| StoreError::Backend(format!("invalid id {raw}: {err}")))
}

fn unsigned<T: TryFrom<i64>>(value: i64, column: &str) -> Result<T, StoreError> {
    T::try_from(value)
        .map_err(|_| StoreError::Backend(format!("column {column} out of range: {value}")))
}

fn signed<T: TryInto<i64>>(value: T) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

struct DocumentRow {
    id: String,
    tenant_id: String,
    file_hash: String,
    doc_type: String,
    size_bytes: i64,
    storage_path: String,
    filename: String,
    status: String,
    error_message: Option<String>,
    retry_count: i64,
    chunk_count: i64,
    created_at: i64,
    updated_at: i64,
}

impl DocumentRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            file_hash: row.get(2)?,
            doc_type: row.get(3)?,
            size_bytes: row.get(4)?,
            storage_path: row.get(5)?,
            filename: row.get(6)?,
            status: row.get(7)?,
            error_message: row.get(8)?,
            retry_count: row.get(9)?,
            chunk_count: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_document(self) -> Result<Document, StoreError> {
        let status = self
            .status
            .parse::<DocumentStatus>()
            .map_err(|_| StoreError::Backend(format!("unknown status {}", self.status)))?;
        let doc_type = self
            .doc_type
            .parse::<DocType>()
            .map_err(|_| StoreError::Backend(format!("unknown doc type {}", self.doc_type)))?;
        Ok(Document {
            id: uuid(&self.id)?,
            tenant_id: self.tenant_id,
            file_hash: self.file_hash,
            doc_type,
            size_bytes: unsigned(self.size_bytes, "size_bytes")?,
            storage_path: self.storage_path,
            filename: self.filename,
            status,
            error_message: self.error_message,
            retry_count: unsigned(self.retry_count, "retry_count")?,
            chunk_count: unsigned(self.chunk_count, "chunk_count")?,
            created_at: datetime(self.created_at)?,
            updated_at: datetime(self.updated_at)?,
        })
    }
}

struct ChunkRow {
    id: String,
    doc_id: String,
    tenant_id: String,
    sequence: i64,
    text: String,
    encrypted_embedding: Vec<u8>,
    embedding_dimension: i64,
    page_number: Option<i64>,
    section: Option<String>,
    indexed: bool,
}

impl ChunkRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            doc_id: row.get(1)?,
            tenant_id: row.get(2)?,
            sequence: row.get(3)?,
            text: row.get(4)?,
            encrypted_embedding: row.get(5)?,
            embedding_dimension: row.get(6)?,
            page_number: row.get(7)?,
            section: row.get(8)?,
            indexed: row.get(9)?,
        })
    }

    fn into_chunk(self) -> Result<Chunk, StoreError> {
        Ok(Chunk {
            id: uuid(&self.id)?,
            doc_id: uuid(&self.doc_id)?,
            tenant_id: self.tenant_id,
            sequence: unsigned(self.sequence, "sequence")?,
            text: self.text,
            encrypted_embedding: self.encrypted_embedding,
            embedding_dimension: unsigned(self.embedding_dimension, "embedding_dimension")?,
            page_number: self
                .page_number
                .map(|page| unsigned(page, "page_number"))
                .transpose()?,
            section: self.section,
            indexed: self.indexed,
        })
    }
}

struct KeyRow {
    id: String,
    tenant_id: String,
    fingerprint: String,
    wrapped_key: Vec<u8>,
    is_active: bool,
    created_at: i64,
}

impl KeyRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            fingerprint: row.get(2)?,
            wrapped_key: row.get(3)?,
            is_active: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_key(self) -> Result<TenantEncryptionKey, StoreError> {
        Ok(TenantEncryptionKey {
            id: uuid(&self.id)?,
            tenant_id: self.tenant_id,
            fingerprint: self.fingerprint,
            wrapped_key: self.wrapped_key,
            is_active: self.is_active,
            created_at: datetime(self.created_at)?,
        })
    }
}

fn insert_document_row(conn: &Connection, document: &Document) -> Result<usize, StoreError> {
    let sql = format!(
        "INSERT INTO documents ({DOCUMENT_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT (tenant_id, file_hash) DO NOTHING"
    );
    Ok(conn.execute(
        &sql,
        params![
            document.id.to_string(),
            document.tenant_id,
            document.file_hash,
            document.doc_type.as_str(),
            signed(document.size_bytes),
            document.storage_path,
            document.filename,
            document.status.as_str(),
            document.error_message,
            signed(document.retry_count),
            signed(document.chunk_count),
            timestamp(document.created_at),
            timestamp(document.updated_at),
        ],
    )?)
}

fn document_by_id(conn: &Connection, id: &str) -> Result<Option<Document>, StoreError> {
    let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1");
    conn.query_row(&sql, params![id], DocumentRow::read)
        .optional()?
        .map(DocumentRow::into_document)
        .transpose()
}

fn document_by_hash(
    conn: &Connection,
    tenant_id: &str,
    file_hash: &str,
) -> Result<Option<Document>, StoreError> {
    let sql = format!(
        "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE tenant_id = ?1 AND file_hash = ?2"
    );
    conn.query_row(&sql, params![tenant_id, file_hash], DocumentRow::read)
        .optional()?
        .map(DocumentRow::into_document)
        .transpose()
}

fn active_key_row(
    conn: &Connection,
    tenant_id: &str,
) -> Result<Option<TenantEncryptionKey>, StoreError> {
    let sql = format!("SELECT {KEY_COLUMNS} FROM tenant_keys WHERE tenant_id = ?1 AND is_active = 1");
    conn.query_row(&sql, params![tenant_id], KeyRow::read)
        .optional()?
        .map(KeyRow::into_key)
        .transpose()
}

fn insert_key_row(conn: &Connection, record: &TenantEncryptionKey) -> Result<(), StoreError> {
    let sql = format!("INSERT INTO tenant_keys ({KEY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, 1, ?5)");
    conn.execute(
        &sql,
        params![
            record.id.to_string(),
            record.tenant_id,
            record.fingerprint,
            record.wrapped_key,
            timestamp(record.created_at),
        ],
    )?;
    Ok(())
}

fn collect_chunks(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Chunk>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, ChunkRow::read)?;
    let mut chunks = Vec::new();
    for row in rows {
        chunks.push(row?.into_chunk()?);
    }
    Ok(chunks)
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn insert_document(&self, document: Document) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            if insert_document_row(conn, &document)? == 0 {
                return Err(StoreError::Conflict(format!(
                    "content already stored for tenant {}",
                    document.tenant_id
                )));
            }
            Ok(())
        })
        .await
    }

    async fn insert_unique(&self, document: Document) -> Result<Option<Document>, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if insert_document_row(&tx, &document)? == 1 {
                tx.commit()?;
                return Ok(None);
            }
            let existing = document_by_hash(&tx, &document.tenant_id, &document.file_hash)?;
            tx.commit()?;
            Ok(existing)
        })
        .await
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>, StoreError> {
        self.with_conn(move |conn| document_by_id(conn, &id.to_string()))
            .await
    }

    async fn find_by_hash(
        &self,
        tenant_id: &str,
        file_hash: &str,
    ) -> Result<Option<Document>, StoreError> {
        let tenant_id = tenant_id.to_string();
        let file_hash = file_hash.to_string();
        self.with_conn(move |conn| document_by_hash(conn, &tenant_id, &file_hash))
            .await
    }

    async fn update_document(&self, document: &Document) -> Result<(), StoreError> {
        let document = document.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE documents
                 SET filename = ?2, storage_path = ?3, status = ?4, error_message = ?5,
                     retry_count = ?6, chunk_count = ?7, updated_at = ?8
                 WHERE id = ?1",
                params![
                    document.id.to_string(),
                    document.filename,
                    document.storage_path,
                    document.status.as_str(),
                    document.error_message,
                    signed(document.retry_count),
                    signed(document.chunk_count),
                    timestamp(document.updated_at),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    entity: "document",
                    id: document.id.to_string(),
                });
            }
            Ok(())
        })
        .await
    }

    async fn claim_run(&self, id: Uuid) -> Result<RunClaim, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut document) = document_by_id(&tx, &id.to_string())? else {
                return Ok(RunClaim::Missing);
            };
            if !document.status.can_transition_to(DocumentStatus::Extracting) {
                return Ok(RunClaim::InFlight(document.status));
            }
            document.status = DocumentStatus::Extracting;
            document.error_message = None;
            document.updated_at = OffsetDateTime::now_utc();
            tx.execute(
                "UPDATE documents SET status = ?2, error_message = NULL, updated_at = ?3
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    document.status.as_str(),
                    timestamp(document.updated_at),
                ],
            )?;
            tx.commit()?;
            Ok(RunClaim::Started(document))
        })
        .await
    }

    async fn delete_document(&self, id: Uuid) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let removed =
                conn.execute("DELETE FROM documents WHERE id = ?1", params![id.to_string()])? > 0;
            tracing::debug!(document_id = %id, removed, "Deleted document rows");
            Ok(removed)
        })
        .await
    }
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn replace_chunks(&self, doc_id: Uuid, chunks: Vec<Chunk>) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            if let Some(stray) = chunks.iter().find(|chunk| chunk.doc_id != doc_id) {
                return Err(StoreError::Conflict(format!(
                    "chunk {} belongs to document {}",
                    stray.id, stray.doc_id
                )));
            }
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let doc_key = doc_id.to_string();
            let exists = tx
                .query_row(
                    "SELECT 1 FROM documents WHERE id = ?1",
                    params![doc_key],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !exists {
                return Err(StoreError::NotFound {
                    entity: "document",
                    id: doc_key,
                });
            }

            tx.execute("DELETE FROM chunks WHERE doc_id = ?1", params![doc_key])?;
            {
                let sql = format!(
                    "INSERT INTO chunks ({CHUNK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                );
                let mut stmt = tx.prepare(&sql)?;
                for chunk in &chunks {
                    stmt.execute(params![
                        chunk.id.to_string(),
                        doc_key,
                        chunk.tenant_id,
                        signed(chunk.sequence),
                        chunk.text,
                        chunk.encrypted_embedding,
                        signed(chunk.embedding_dimension),
                        chunk.page_number.map(signed),
                        chunk.section,
                        chunk.indexed,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn chunks_for_document(&self, doc_id: Uuid) -> Result<Vec<Chunk>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks WHERE doc_id = ?1 ORDER BY sequence"
            );
            collect_chunks(conn, &sql, params![doc_id.to_string()])
        })
        .await
    }

    async fn get_chunks(&self, tenant_id: &str, ids: &[Uuid]) -> Result<Vec<Chunk>, StoreError> {
        let tenant_id = tenant_id.to_string();
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?1 AND tenant_id = ?2");
            let mut stmt = conn.prepare(&sql)?;
            let mut chunks = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(row) = stmt
                    .query_row(params![id.to_string(), tenant_id], ChunkRow::read)
                    .optional()?
                {
                    chunks.push(row.into_chunk()?);
                }
            }
            Ok(chunks)
        })
        .await
    }

    async fn unindexed_chunks(&self, tenant_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let tenant_id = tenant_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks
                 WHERE tenant_id = ?1 AND indexed = 0
                 ORDER BY doc_id, sequence"
            );
            collect_chunks(conn, &sql, params![tenant_id])
        })
        .await
    }
}

#[async_trait]
impl KeyStore for SqliteStore {
    async fn active_key(&self, tenant_id: &str) -> Result<Option<TenantEncryptionKey>, StoreError> {
        let tenant_id = tenant_id.to_string();
        self.with_conn(move |conn| active_key_row(conn, &tenant_id))
            .await
    }

    async fn insert_active(&self, record: TenantEncryptionKey) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "UPDATE tenant_keys SET is_active = 0 WHERE tenant_id = ?1",
                params![record.tenant_id],
            )?;
            insert_key_row(&tx, &record)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn insert_if_absent(
        &self,
        mut record: TenantEncryptionKey,
    ) -> Result<TenantEncryptionKey, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(existing) = active_key_row(&tx, &record.tenant_id)? {
                return Ok(existing);
            }
            insert_key_row(&tx, &record)?;
            tx.commit()?;
            record.is_active = true;
            Ok(record)
        })
        .await
    }

    async fn keys_for_tenant(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<TenantEncryptionKey>, StoreError> {
        let tenant_id = tenant_id.to_string();
        self.with_conn(move |conn| {
            let sql =
                format!("SELECT {KEY_COLUMNS} FROM tenant_keys WHERE tenant_id = ?1 ORDER BY rowid");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![tenant_id], KeyRow::read)?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row?.into_key()?);
            }
            Ok(keys)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chunk_id;

    fn chunk(doc: &Document, sequence: u32, indexed: bool) -> Chunk {
        Chunk {
            id: chunk_id(doc.id, sequence),
            doc_id: doc.id,
            tenant_id: doc.tenant_id.clone(),
            sequence,
            text: format!("chunk {sequence}"),
            encrypted_embedding: vec![7; 12],
            embedding_dimension: 3,
            page_number: Some(sequence),
            section: Some("Intro".into()),
            indexed,
        }
    }

    fn key(tenant: &str, fingerprint: &str) -> TenantEncryptionKey {
        TenantEncryptionKey {
            id: Uuid::new_v4(),
            tenant_id: tenant.into(),
            fingerprint: fingerprint.into(),
            wrapped_key: vec![1, 2, 3],
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn temp_db() -> std::path::PathBuf {
        std::env::temp_dir()
            .join(format!("ragvault-store-{}", Uuid::new_v4()))
            .join("vault.db")
    }

    #[tokio::test]
    async fn documents_round_trip_every_field() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut doc = Document::new_upload("acme", "a.md", "acme/a.md", DocType::Md, b"abc");
        doc.error_message = Some("earlier failure".into());
        doc.retry_count = 2;
        store.insert_document(doc.clone()).await.unwrap();

        assert_eq!(store.get_document(doc.id).await.unwrap(), Some(doc.clone()));
        assert_eq!(
            store.find_by_hash("acme", &doc.file_hash).await.unwrap(),
            Some(doc.clone())
        );
        assert!(store.find_by_hash("globex", &doc.file_hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rows_survive_reopening_the_file() {
        let path = temp_db();
        let doc = Document::new_upload("acme", "a.txt", "a", DocType::Txt, b"abc");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_document(doc.clone()).await.unwrap();
            store
                .replace_chunks(doc.id, vec![chunk(&doc, 1, true)])
                .await
                .unwrap();
            store.insert_if_absent(key("acme", "first")).await.unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.get_document(doc.id).await.unwrap(), Some(doc.clone()));
        assert_eq!(reopened.chunks_for_document(doc.id).await.unwrap().len(), 1);
        let active = reopened.active_key("acme").await.unwrap().unwrap();
        assert_eq!(active.fingerprint, "first");
    }

    #[tokio::test]
    async fn insert_unique_keeps_one_document_per_hash() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = Document::new_upload("acme", "a.txt", "a", DocType::Txt, b"same");
        let second = Document::new_upload("acme", "b.txt", "b", DocType::Txt, b"same");

        assert!(store.insert_unique(first.clone()).await.unwrap().is_none());
        let existing = store.insert_unique(second.clone()).await.unwrap();
        assert_eq!(existing.map(|d| d.id), Some(first.id));
        assert!(store.get_document(second.id).await.unwrap().is_none());
        assert!(matches!(
            store.insert_document(second).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn claim_run_is_refused_while_a_run_is_active() {
        let store = SqliteStore::open_in_memory().unwrap();
        let doc = Document::new_upload("acme", "a.txt", "a", DocType::Txt, b"abc");
        store.insert_document(doc.clone()).await.unwrap();

        let RunClaim::Started(claimed) = store.claim_run(doc.id).await.unwrap() else {
            panic!("uploaded documents can start a run");
        };
        assert_eq!(claimed.status, DocumentStatus::Extracting);
        assert_eq!(
            store.claim_run(doc.id).await.unwrap(),
            RunClaim::InFlight(DocumentStatus::Extracting)
        );
        assert_eq!(
            store.get_document(doc.id).await.unwrap().unwrap().status,
            DocumentStatus::Extracting
        );
        assert_eq!(
            store.claim_run(Uuid::new_v4()).await.unwrap(),
            RunClaim::Missing
        );
    }

    #[tokio::test]
    async fn replace_chunks_and_delete_cascade() {
        let store = SqliteStore::open_in_memory().unwrap();
        let doc = Document::new_upload("acme", "a.txt", "a", DocType::Txt, b"abc");
        store.insert_document(doc.clone()).await.unwrap();
        store
            .replace_chunks(
                doc.id,
                vec![chunk(&doc, 1, true), chunk(&doc, 2, false), chunk(&doc, 3, true)],
            )
            .await
            .unwrap();
        store
            .replace_chunks(doc.id, vec![chunk(&doc, 2, false), chunk(&doc, 1, true)])
            .await
            .unwrap();

        let chunks = store.chunks_for_document(doc.id).await.unwrap();
        assert_eq!(chunks.iter().map(|c| c.sequence).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(chunks[0], chunk(&doc, 1, true));

        let pending = store.unindexed_chunks("acme").await.unwrap();
        assert_eq!(pending.iter().map(|c| c.sequence).collect::<Vec<_>>(), vec![2]);

        let ids = [chunk_id(doc.id, 2), Uuid::new_v4(), chunk_id(doc.id, 1)];
        let found = store.get_chunks("acme", &ids).await.unwrap();
        assert_eq!(found.iter().map(|c| c.sequence).collect::<Vec<_>>(), vec![2, 1]);
        assert!(store.get_chunks("globex", &ids).await.unwrap().is_empty());

        assert!(store.delete_document(doc.id).await.unwrap());
        assert!(store.chunks_for_document(doc.id).await.unwrap().is_empty());
        assert!(matches!(
            store.replace_chunks(doc.id, vec![chunk(&doc, 1, true)]).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn one_active_key_per_tenant() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.insert_if_absent(key("acme", "first")).await.unwrap();
        let second = store.insert_if_absent(key("acme", "second")).await.unwrap();
        assert_eq!(first.fingerprint, "first");
        assert_eq!(second.fingerprint, "first");

        store.insert_active(key("acme", "rotated")).await.unwrap();
        let all = store.keys_for_tenant("acme").await.unwrap();
        assert_eq!(
            all.iter().map(|k| k.fingerprint.as_str()).collect::<Vec<_>>(),
            vec!["first", "rotated"]
        );
        assert_eq!(all.iter().filter(|k| k.is_active).count(), 1);
        assert_eq!(
            store.active_key("acme").await.unwrap().unwrap().fingerprint,
            "rotated"
        );
    }
}
