//! Tenant key lifecycle.
//!
//! Raw tenant keys exist only in memory. The key store holds each key sealed under the
//! process master key (with the tenant id as associated data) plus its fingerprint.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::cache::KeyCache;
use super::cipher::{CryptoError, SecretKey, open, seal};
use crate::models::TenantEncryptionKey;
use crate::store::{KeyStore, StoreError};

/// Errors from the tenant key manager.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The tenant has no active key.
    #[error("no active encryption key for tenant {tenant_id}")]
    NotFound {
        /// Tenant that was looked up.
        tenant_id: String,
    },
    /// The stored key could not be unwrapped or failed verification.
    #[error("encryption key for tenant {tenant_id} is corrupted: {reason}")]
    Corrupted {
        /// Affected tenant.
        tenant_id: String,
        /// What failed.
        reason: String,
    },
    /// The key store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Key generation or wrapping failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Creates, unwraps and caches per-tenant data keys.
pub struct TenantKeyManager {
    store: Arc<dyn KeyStore>,
    master: SecretKey,
    cache: KeyCache,
}

impl TenantKeyManager {
    /// Manager wrapping keys under `master`, caching unwrapped keys for `cache_ttl`.
    pub fn new(store: Arc<dyn KeyStore>, master: SecretKey, cache_ttl: Duration) -> Self {
        Self {
            store,
            master,
            cache: KeyCache::new(cache_ttl),
        }
    }

    /// Generate and activate a new key for `tenant_id`.
    ///
    /// Any previously active key is deactivated. The raw key is returned for immediate use
    /// and is never persisted in the clear.
    pub async fn create(
        &self,
        tenant_id: &str,
    ) -> Result<(TenantEncryptionKey, SecretKey), KeyError> {
        let (record, raw) = self.wrap_new(tenant_id)?;
        self.store.insert_active(record.clone()).await?;
        self.cache.insert(tenant_id, raw.clone());
        tracing::info!(tenant_id, fingerprint = %record.fingerprint, "Created tenant key");
        Ok((record, raw))
    }

    /// Active raw key of `tenant_id`.
    pub async fn get(&self, tenant_id: &str) -> Result<SecretKey, KeyError> {
        if let Some(key) = self.cache.get(tenant_id) {
            return Ok(key);
        }

        let record = self
            .store
            .active_key(tenant_id)
            .await?
            .ok_or_else(|| KeyError::NotFound {
                tenant_id: tenant_id.to_string(),
            })?;
        let raw = self.unwrap(&record)?;
        self.cache.insert(tenant_id, raw.clone());
        Ok(raw)
    }

    /// Active raw key of `tenant_id`, provisioning one on first use.
    ///
    /// Concurrent first uses agree on a single key: the store keeps whichever record was
    /// inserted first and every caller unwraps that one.
    pub async fn get_or_provision(&self, tenant_id: &str) -> Result<SecretKey, KeyError> {
        match self.get(tenant_id).await {
            Err(KeyError::NotFound { .. }) => {}
            other => return other,
        }

        let (candidate, raw) = self.wrap_new(tenant_id)?;
        let candidate_id = candidate.id;
        let winner = self.store.insert_if_absent(candidate).await?;

        let key = if winner.id == candidate_id {
            tracing::info!(tenant_id, fingerprint = %winner.fingerprint, "Provisioned tenant key");
            raw
        } else {
            tracing::debug!(tenant_id, "Tenant key provisioned concurrently; using existing");
            self.unwrap(&winner)?
        };
        self.cache.insert(tenant_id, key.clone());
        Ok(key)
    }

    /// Forget the cached key of one tenant.
    pub fn invalidate(&self, tenant_id: &str) {
        self.cache.invalidate(tenant_id);
    }

    /// Forget every cached key.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Number of tenants with a live cached key.
    pub fn cached_tenants(&self) -> usize {
        self.cache.len()
    }

    fn wrap_new(&self, tenant_id: &str) -> Result<(TenantEncryptionKey, SecretKey), KeyError> {
        let raw = SecretKey::generate();
        let wrapped_key = seal(&self.master, raw.as_bytes(), tenant_id.as_bytes())?;
        let record = TenantEncryptionKey {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            fingerprint: raw.fingerprint(),
            wrapped_key,
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
        };
        Ok((record, raw))
    }

    fn unwrap(&self, record: &TenantEncryptionKey) -> Result<SecretKey, KeyError> {
        let corrupted = |reason: String| {
            tracing::error!(
                tenant_id = %record.tenant_id,
                key_id = %record.id,
                reason = %reason,
                "Tenant key is corrupted; operator attention required"
            );
            KeyError::Corrupted {
                tenant_id: record.tenant_id.clone(),
                reason,
            }
        };

        let bytes = open(
            &self.master,
            &record.wrapped_key,
            record.tenant_id.as_bytes(),
        )
        .map_err(|err| corrupted(err.to_string()))?;
        let raw = SecretKey::from_bytes(&bytes).map_err(|err| corrupted(err.to_string()))?;
        if raw.fingerprint() != record.fingerprint {
            return Err(corrupted("fingerprint mismatch".into()));
        }
        Ok(raw)
    }
}
