//! In-process exact vector index.
//!
//! Brute-force cosine distance over every point in the namespace. Scores are distances in
//! `[0, 2]`, lower is better; ties are broken by point id so results are reproducible.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::engine::VectorIndex;
use super::scoring::cosine_similarity;
use super::types::{EngineMatch, EnginePoint, IndexError, ScoreKind};

struct Namespace {
    dimension: usize,
    points: BTreeMap<Uuid, (Vec<f32>, Map<String, Value>)>,
}

/// Exact in-memory engine for development and tests.
#[derive(Default)]
pub struct MemoryIndex {
    namespaces: RwLock<HashMap<String, Namespace>>,
}

impl MemoryIndex {
    /// Empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of points stored in `namespace`, if it exists.
    pub async fn point_count(&self, namespace: &str) -> Option<usize> {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .map(|ns| ns.points.len())
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

fn not_found(namespace: &str) -> IndexError {
    IndexError::NamespaceNotFound(namespace.to_string())
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn score_kind(&self) -> ScoreKind {
        ScoreKind::Distance
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool, IndexError> {
        Ok(self.namespaces.read().await.contains_key(namespace))
    }

    async fn create_namespace(&self, namespace: &str, dimension: usize) -> Result<(), IndexError> {
        self.namespaces
            .write()
            .await
            .entry(namespace.to_string())
            .or_insert_with(|| Namespace {
                dimension,
                points: BTreeMap::new(),
            });
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), IndexError> {
        self.namespaces
            .write()
            .await
            .remove(namespace)
            .map(|_| ())
            .ok_or_else(|| not_found(namespace))
    }

    async fn upsert(&self, namespace: &str, points: Vec<EnginePoint>) -> Result<(), IndexError> {
        let mut namespaces = self.namespaces.write().await;
        let ns = namespaces
            .get_mut(namespace)
            .ok_or_else(|| not_found(namespace))?;
        if let Some(bad) = points.iter().find(|p| p.vector.len() != ns.dimension) {
            return Err(IndexError::DimensionMismatch {
                expected: ns.dimension,
                actual: bad.vector.len(),
            });
        }
        for point in points {
            ns.points.insert(point.id, (point.vector, point.payload));
        }
        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<EngineMatch>, IndexError> {
        let namespaces = self.namespaces.read().await;
        let ns = namespaces
            .get(namespace)
            .ok_or_else(|| not_found(namespace))?;
        if vector.len() != ns.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: ns.dimension,
                actual: vector.len(),
            });
        }

        let mut scored: Vec<(f32, &Uuid, &Map<String, Value>)> = ns
            .points
            .iter()
            .map(|(id, (stored, payload))| (cosine_distance(vector, stored), id, payload))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)));

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(score, id, payload)| EngineMatch {
                id: *id,
                score,
                payload: payload.clone(),
            })
            .collect())
    }

    async fn delete_points(&self, namespace: &str, ids: &[Uuid]) -> Result<(), IndexError> {
        let mut namespaces = self.namespaces.write().await;
        let ns = namespaces
            .get_mut(namespace)
            .ok_or_else(|| not_found(namespace))?;
        for id in ids {
            ns.points.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(vector: Vec<f32>) -> EnginePoint {
        EnginePoint {
            id: Uuid::new_v4(),
            vector,
            payload: Map::new(),
        }
    }

    #[tokio::test]
    async fn nearest_point_comes_first() {
        let index = MemoryIndex::new();
        index.create_namespace("ns", 2).await.unwrap();
        let near = point(vec![1.0, 0.1]);
        let far = point(vec![-1.0, 0.0]);
        index
            .upsert("ns", vec![far.clone(), near.clone()])
            .await
            .unwrap();

        let hits = index.query("ns", &[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits[0].id, near.id);
        assert_eq!(hits[1].id, far.id);
        assert!(hits[0].score < hits[1].score);
        assert!((hits[1].score - 2.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn upsert_overwrites_by_id() {
        let index = MemoryIndex::new();
        index.create_namespace("ns", 2).await.unwrap();
        let mut p = point(vec![1.0, 0.0]);
        index.upsert("ns", vec![p.clone()]).await.unwrap();
        p.vector = vec![0.0, 1.0];
        index.upsert("ns", vec![p]).await.unwrap();
        assert_eq!(index.point_count("ns").await, Some(1));
    }

    #[tokio::test]
    async fn missing_namespace_is_reported() {
        let index = MemoryIndex::new();
        assert!(matches!(
            index.query("ghost", &[1.0], 1).await,
            Err(IndexError::NamespaceNotFound(_))
        ));
        assert!(matches!(
            index.delete_namespace("ghost").await,
            Err(IndexError::NamespaceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn dimension_is_enforced() {
        let index = MemoryIndex::new();
        index.create_namespace("ns", 3).await.unwrap();
        assert!(matches!(
            index.upsert("ns", vec![point(vec![1.0])]).await,
            Err(IndexError::DimensionMismatch {
                expected: 3,
                actual: 1
            })
        ));
    }
}
