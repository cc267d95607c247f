//! Per-tenant namespaces on top of an opaque [`VectorIndex`] engine.
//!
//! Each tenant maps to exactly one namespace. Record metadata is sealed under an index key
//! derived from the tenant key before it reaches the engine, so reading a namespace's hits
//! requires that tenant's key as well as its namespace name.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::engine::VectorIndex;
use super::types::{EnginePoint, IndexError, IndexMatch, IndexRecord};
use crate::crypto::{SecretKey, derive_index_key, open, seal};

const SEALED_FIELD: &str = "sealed";
const MAX_NAMESPACE_LEN: usize = 63;

/// Tenant-scoped access to the vector index engine.
#[derive(Clone)]
pub struct IndexGateway {
    engine: Arc<dyn VectorIndex>,
    prefix: String,
}

impl IndexGateway {
    /// Gateway naming namespaces `{prefix}_{tenant}`.
    pub fn new(engine: Arc<dyn VectorIndex>, prefix: impl Into<String>) -> Self {
        Self {
            engine,
            prefix: prefix.into(),
        }
    }

    /// Namespace name of `tenant_id`.
    ///
    /// Characters outside `[a-z0-9_-]` are replaced; when that changes the id a short hash of
    /// the raw id is appended so distinct tenants never collide.
    pub fn namespace_for(&self, tenant_id: &str) -> String {
        let sanitized: String = tenant_id
            .chars()
            .map(|c| match c.to_ascii_lowercase() {
                c @ ('a'..='z' | '0'..='9' | '_' | '-') => c,
                _ => '_',
            })
            .collect();

        let mut name = format!("{}_{}", self.prefix, sanitized);
        if sanitized != tenant_id || name.len() > MAX_NAMESPACE_LEN {
            let digest = hex::encode(Sha256::digest(tenant_id.as_bytes()));
            let mut cut = (MAX_NAMESPACE_LEN - 9).min(name.len());
            while !name.is_char_boundary(cut) {
                cut -= 1;
            }
            name.truncate(cut);
            name.push('_');
            name.push_str(&digest[..8]);
        }
        name
    }

    /// Ensure the tenant namespace exists; returns its name either way.
    pub async fn create_namespace(
        &self,
        tenant_id: &str,
        dimension: usize,
        key: &SecretKey,
    ) -> Result<String, IndexError> {
        let namespace = self.namespace_for(tenant_id);
        if self.engine.namespace_exists(&namespace).await? {
            return Ok(namespace);
        }

        let fingerprint = derive_index_key(key)?.fingerprint();
        self.engine.create_namespace(&namespace, dimension).await?;
        tracing::info!(
            tenant_id,
            namespace = %namespace,
            dimension,
            index_key = &fingerprint[..12],
            "Created tenant index namespace"
        );
        Ok(namespace)
    }

    /// Drop the tenant namespace; a missing namespace is not an error.
    pub async fn delete_namespace(&self, tenant_id: &str) -> Result<(), IndexError> {
        let namespace = self.namespace_for(tenant_id);
        match self.engine.delete_namespace(&namespace).await {
            Ok(()) => {
                tracing::info!(tenant_id, namespace = %namespace, "Deleted tenant index namespace");
                Ok(())
            }
            Err(IndexError::NamespaceNotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Write records into the tenant namespace, overwriting by id.
    pub async fn upsert(
        &self,
        tenant_id: &str,
        key: &SecretKey,
        records: Vec<IndexRecord>,
    ) -> Result<usize, IndexError> {
        if records.is_empty() {
            return Ok(0);
        }
        let namespace = self.namespace_for(tenant_id);
        let index_key = derive_index_key(key)?;

        let points = records
            .into_iter()
            .map(|record| {
                let plain = serde_json::to_vec(&record.metadata)
                    .map_err(|err| IndexError::Malformed(err.to_string()))?;
                let sealed = seal(&index_key, &plain, namespace.as_bytes())?;
                let mut payload = Map::new();
                payload.insert(SEALED_FIELD.into(), Value::String(BASE64.encode(sealed)));
                Ok(EnginePoint {
                    id: record.id,
                    vector: record.vector,
                    payload,
                })
            })
            .collect::<Result<Vec<_>, IndexError>>()?;

        let count = points.len();
        self.engine.upsert(&namespace, points).await?;
        Ok(count)
    }

    /// Nearest records in the tenant namespace, in engine rank order.
    ///
    /// A missing namespace yields an empty list. Hits whose metadata does not open under
    /// `key` fail the whole query.
    pub async fn query(
        &self,
        tenant_id: &str,
        key: &SecretKey,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<IndexMatch>, IndexError> {
        let namespace = self.namespace_for(tenant_id);
        let hits = match self.engine.query(&namespace, vector, top_k).await {
            Ok(hits) => hits,
            Err(IndexError::NamespaceNotFound(_)) => {
                tracing::debug!(tenant_id, namespace = %namespace, "No index namespace; empty result");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        let index_key = derive_index_key(key)?;
        let score_kind = self.engine.score_kind();
        hits.into_iter()
            .map(|hit| {
                let metadata = open_metadata(&index_key, &namespace, hit.id, &hit.payload)?;
                Ok(IndexMatch {
                    chunk_id: hit.id,
                    raw_score: hit.score,
                    score_kind,
                    metadata,
                })
            })
            .collect()
    }

    /// Remove records by id; a missing namespace is a no-op.
    pub async fn delete_points(&self, tenant_id: &str, ids: &[Uuid]) -> Result<(), IndexError> {
        let namespace = self.namespace_for(tenant_id);
        match self.engine.delete_points(&namespace, ids).await {
            Err(IndexError::NamespaceNotFound(_)) => Ok(()),
            other => other,
        }
    }
}

fn open_metadata(
    index_key: &SecretKey,
    namespace: &str,
    id: Uuid,
    payload: &Map<String, Value>,
) -> Result<Map<String, Value>, IndexError> {
    let encoded = payload
        .get(SEALED_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| IndexError::Malformed(format!("point {id} has no sealed metadata")))?;
    let sealed = BASE64
        .decode(encoded)
        .map_err(|err| IndexError::Malformed(err.to_string()))?;
    let plain =
        open(index_key, &sealed, namespace.as_bytes()).map_err(|_| IndexError::KeyMismatch(id))?;
    serde_json::from_slice(&plain).map_err(|err| IndexError::Malformed(err.to_string()))
}
