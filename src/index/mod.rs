//! Vector index integration: engine trait, engines and the tenant gateway.

mod engine;
mod gateway;
mod memory;
mod qdrant;
mod scoring;
mod types;

use std::sync::Arc;

pub use engine::VectorIndex;
pub use gateway::IndexGateway;
pub use memory::MemoryIndex;
pub use qdrant::QdrantIndex;
pub use scoring::{cosine_similarity, normalize_score};
pub use types::{EngineMatch, EnginePoint, IndexError, IndexMatch, IndexRecord, ScoreKind};

use crate::config::{Config, IndexBackend};

/// Build the engine selected by `INDEX_BACKEND`.
pub fn build_index_engine(config: &Config) -> Result<Arc<dyn VectorIndex>, IndexError> {
    match config.index_backend {
        IndexBackend::Memory => Ok(Arc::new(MemoryIndex::new())),
        IndexBackend::Qdrant => {
            let url = config
                .qdrant_url
                .as_deref()
                .ok_or_else(|| IndexError::InvalidUrl("QDRANT_URL is not set".into()))?;
            Ok(Arc::new(QdrantIndex::new(url, config.qdrant_api_key.clone())?))
        }
    }
}
