use async_trait::async_trait;
use uuid::Uuid;

use super::types::{EngineMatch, EnginePoint, IndexError, ScoreKind};

/// Opaque vector index engine addressed by namespace name.
///
/// Engines report a missing namespace as [`IndexError::NamespaceNotFound`] so the gateway can
/// tell it apart from every other failure.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// How this engine expresses relevance.
    fn score_kind(&self) -> ScoreKind;

    /// Whether `namespace` exists.
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, IndexError>;

    /// Create `namespace` for vectors of `dimension`; creating an existing namespace succeeds.
    async fn create_namespace(&self, namespace: &str, dimension: usize) -> Result<(), IndexError>;

    /// Drop `namespace` and every point in it.
    async fn delete_namespace(&self, namespace: &str) -> Result<(), IndexError>;

    /// Insert or overwrite points by id.
    async fn upsert(&self, namespace: &str, points: Vec<EnginePoint>) -> Result<(), IndexError>;

    /// Up to `top_k` nearest points, best first.
    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<EngineMatch>, IndexError>;

    /// Remove points by id; unknown ids are ignored.
    async fn delete_points(&self, namespace: &str, ids: &[Uuid]) -> Result<(), IndexError>;
}
