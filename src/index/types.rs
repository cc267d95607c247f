//! Shared types for vector index engines and the tenant gateway.

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::CryptoError;

/// Errors returned by index engines and the gateway.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The namespace does not exist in the engine.
    #[error("Index namespace not found: {0}")]
    NamespaceNotFound(String),
    /// Engine URL failed to parse or normalize.
    #[error("Invalid index URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The engine responded with an unexpected status code.
    #[error("Unexpected index response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned by the engine.
        status: StatusCode,
        /// Body of the failing response.
        body: String,
    },
    /// A vector's dimension differs from the namespace dimension.
    #[error("Vector dimension {actual} does not match namespace dimension {expected}")]
    DimensionMismatch {
        /// Namespace dimension.
        expected: usize,
        /// Offending vector dimension.
        actual: usize,
    },
    /// Stored metadata could not be opened with the caller's key.
    #[error("Index entry {0} is not readable with the supplied tenant key")]
    KeyMismatch(Uuid),
    /// The engine returned data in an unexpected shape.
    #[error("Malformed index data: {0}")]
    Malformed(String),
    /// Sealing metadata failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// How an engine expresses relevance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreKind {
    /// Lower is better (e.g. cosine distance).
    Distance,
    /// Higher is better and already a similarity.
    Similarity,
}

/// Point as stored by an engine.
#[derive(Debug, Clone)]
pub struct EnginePoint {
    /// Point identifier.
    pub id: Uuid,
    /// Plaintext vector the engine searches over.
    pub vector: Vec<f32>,
    /// Opaque payload stored with the vector.
    pub payload: Map<String, Value>,
}

/// Match returned by an engine query, best first.
#[derive(Debug, Clone)]
pub struct EngineMatch {
    /// Point identifier.
    pub id: Uuid,
    /// Engine-native score.
    pub score: f32,
    /// Payload stored with the point.
    pub payload: Map<String, Value>,
}

/// Record handed to the gateway for upsert.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    /// Deterministic chunk identifier.
    pub id: Uuid,
    /// Embedding vector.
    pub vector: Vec<f32>,
    /// Metadata sealed under the tenant's index key before it reaches the engine.
    pub metadata: Map<String, Value>,
}

/// Gateway query hit with opened metadata.
#[derive(Debug, Clone)]
pub struct IndexMatch {
    /// Chunk identifier.
    pub chunk_id: Uuid,
    /// Engine-native score.
    pub raw_score: f32,
    /// Interpretation of `raw_score`.
    pub score_kind: ScoreKind,
    /// Metadata recorded at upsert time.
    pub metadata: Map<String, Value>,
}

#[derive(Deserialize)]
pub(crate) struct QueryResponse {
    pub(crate) result: QueryResponseResult,
}

#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum QueryResponseResult {
    Points(Vec<QueryPoint>),
    Object {
        #[serde(default)]
        points: Vec<QueryPoint>,
    },
}

#[derive(Deserialize)]
pub(crate) struct QueryPoint {
    pub(crate) id: Value,
    pub(crate) score: f32,
    #[serde(default)]
    pub(crate) payload: Option<Map<String, Value>>,
}
