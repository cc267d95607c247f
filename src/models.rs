//! Persisted entities shared by the ingestion and retrieval pipelines.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

/// Namespace for deriving chunk identifiers; changing it re-keys every stored chunk.
const CHUNK_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b8e_93d4_4a57_b0e2_5c7d_1a9f_3e60);

/// Lifecycle of a document inside the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    /// Bytes stored, nothing processed yet.
    Uploaded,
    /// Text is being pulled out of the raw bytes.
    Extracting,
    /// Extracted text is being cleaned and split.
    Chunking,
    /// Chunks are being embedded and encrypted.
    Embedding,
    /// Vectors are being written to the tenant namespace.
    Indexing,
    /// Chunks persisted; terminal.
    Completed,
    /// Run stopped; `error_message` says why. Terminal.
    Failed,
}

impl DocumentStatus {
    /// Stable lowercase name used in logs and API payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Extracting => "extracting",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Indexing => "indexing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// `completed` and `failed` end a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the pipeline may move a document from `self` to `next`.
    ///
    /// A run starts at `extracting` from `uploaded` or from a terminal state; re-running is
    /// safe because chunk ids are deterministic. A document that is mid-run cannot be
    /// restarted until that run ends.
    pub fn can_transition_to(self, next: Self) -> bool {
        use DocumentStatus::*;
        match (self, next) {
            (Uploaded | Completed | Failed, Extracting) => true,
            (Extracting, Chunking)
            | (Chunking, Embedding)
            | (Embedding, Indexing)
            | (Indexing, Completed) => true,
            (current, Failed) => !current.is_terminal() || current == Failed,
            _ => false,
        }
    }
}

impl FromStr for DocumentStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(Self::Uploaded),
            "extracting" => Ok(Self::Extracting),
            "chunking" => Ok(Self::Chunking),
            "embedding" => Ok(Self::Embedding),
            "indexing" => Ok(Self::Indexing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source format of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    /// Portable Document Format.
    Pdf,
    /// Office Open XML word-processing document.
    Docx,
    /// Plain text.
    Txt,
    /// Markdown.
    Md,
    /// HTML page.
    Html,
    /// Anything else; extraction is attempted as UTF-8 text.
    Unknown,
}

impl DocType {
    /// Resolve a document type from a MIME type such as `application/pdf`.
    pub fn from_mime(mime: &str) -> Self {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "application/pdf" => Self::Pdf,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Self::Docx
            }
            "text/plain" => Self::Txt,
            "text/markdown" | "text/x-markdown" => Self::Md,
            "text/html" | "application/xhtml+xml" => Self::Html,
            _ => Self::Unknown,
        }
    }

    /// Resolve a document type from a file name or extension.
    pub fn from_filename(name: &str) -> Self {
        let extension = name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .unwrap_or(name)
            .to_ascii_lowercase();
        match extension.as_str() {
            "pdf" => Self::Pdf,
            "docx" => Self::Docx,
            "txt" | "text" => Self::Txt,
            "md" | "markdown" => Self::Md,
            "html" | "htm" => Self::Html,
            _ => Self::Unknown,
        }
    }

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Txt => "txt",
            Self::Md => "md",
            Self::Html => "html",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for DocType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('/') {
            return Ok(Self::from_mime(s));
        }
        Ok(Self::from_filename(s))
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uploaded document and its processing state.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Primary key.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// SHA-256 hex digest of the raw bytes; duplicate detection key within a tenant.
    pub file_hash: String,
    /// Source format.
    pub doc_type: DocType,
    /// Raw size in bytes.
    pub size_bytes: u64,
    /// Location of the raw bytes in blob storage.
    pub storage_path: String,
    /// Original file name as uploaded.
    pub filename: String,
    /// Current pipeline state.
    pub status: DocumentStatus,
    /// Reason for the most recent failure, if any.
    pub error_message: Option<String>,
    /// Number of queued retries consumed so far.
    pub retry_count: u32,
    /// Number of chunks persisted by the last completed run.
    pub chunk_count: usize,
    /// Creation time.
    pub created_at: OffsetDateTime,
    /// Last mutation time.
    pub updated_at: OffsetDateTime,
}

impl Document {
    /// Build a freshly uploaded document record.
    pub fn new_upload(
        tenant_id: impl Into<String>,
        filename: impl Into<String>,
        storage_path: impl Into<String>,
        doc_type: DocType,
        bytes: &[u8],
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            file_hash: content_hash(bytes),
            doc_type,
            size_bytes: bytes.len() as u64,
            storage_path: storage_path.into(),
            filename: filename.into(),
            status: DocumentStatus::Uploaded,
            error_message: None,
            retry_count: 0,
            chunk_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A persisted slice of a document with its encrypted embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Deterministic identifier, see [`chunk_id`].
    pub id: Uuid,
    /// Owning document.
    pub doc_id: Uuid,
    /// Owning tenant (denormalised for tenant-scoped lookups).
    pub tenant_id: String,
    /// 1-based position within the document.
    pub sequence: u32,
    /// Chunk text.
    pub text: String,
    /// Embedding sealed under the tenant key.
    pub encrypted_embedding: Vec<u8>,
    /// Dimension of the embedding before encryption.
    pub embedding_dimension: usize,
    /// Page the chunk starts on, when the source has pages.
    pub page_number: Option<u32>,
    /// Nearest preceding heading, when one exists.
    pub section: Option<String>,
    /// Whether the vector reached the tenant namespace. Unindexed chunks are still
    /// searchable by scoring their stored embedding directly.
    pub indexed: bool,
}

/// Derive the identifier of the chunk at `sequence` within `doc_id`.
///
/// Re-processing a document yields the same ids, so index upserts overwrite instead of
/// duplicating.
pub fn chunk_id(doc_id: Uuid, sequence: u32) -> Uuid {
    Uuid::new_v5(
        &CHUNK_ID_NAMESPACE,
        format!("{doc_id}:{sequence}").as_bytes(),
    )
}

/// Tenant data key stored in wrapped form.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantEncryptionKey {
    /// Primary key.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// SHA-256 hex digest of the raw key.
    pub fingerprint: String,
    /// Raw key sealed under the master key (nonce-prefixed AES-256-GCM).
    pub wrapped_key: Vec<u8>,
    /// Only one record per tenant is active.
    pub is_active: bool,
    /// Creation time.
    pub created_at: OffsetDateTime,
}

/// SHA-256 hex digest of raw bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
