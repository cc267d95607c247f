use std::env;

use ragvault::crypto::SecretKey;
use ragvault::embedding::{EmbeddingClient, OllamaEmbeddingClient};
use ragvault::index::{IndexGateway, IndexRecord, QdrantIndex, VectorIndex};
use serde_json::{Map, json};
use std::sync::Arc;
use uuid::Uuid;

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[tokio::test]
#[ignore = "Requires live Qdrant"]
async fn live_qdrant_namespace_roundtrip() {
    let engine: Arc<dyn VectorIndex> = Arc::new(
        QdrantIndex::new(
            &env_or("QDRANT_URL", "http://127.0.0.1:6333"),
            env::var("QDRANT_API_KEY").ok(),
        )
        .expect("qdrant client"),
    );
    let gateway = IndexGateway::new(engine, "ragvault_live");
    let tenant = format!("t{}", Uuid::new_v4().simple());
    let key = SecretKey::generate();

    gateway
        .create_namespace(&tenant, 3, &key)
        .await
        .expect("create namespace");
    let mut metadata = Map::new();
    metadata.insert("text".into(), json!("live check"));
    gateway
        .upsert(
            &tenant,
            &key,
            vec![IndexRecord {
                id: Uuid::new_v4(),
                vector: vec![1.0, 0.0, 0.0],
                metadata,
            }],
        )
        .await
        .expect("upsert");

    let hits = gateway
        .query(&tenant, &key, &[1.0, 0.0, 0.0], 1)
        .await
        .expect("query");
    assert_eq!(hits.len(), 1, "expected the inserted point back");
    assert_eq!(hits[0].metadata["text"], json!("live check"));

    gateway
        .delete_namespace(&tenant)
        .await
        .expect("delete namespace");
}

#[tokio::test]
#[ignore = "Requires live Ollama embeddings"]
async fn live_ollama_embedding_roundtrip() {
    let dimension: usize = env_or("EMBEDDING_DIMENSION", "768")
        .parse()
        .expect("numeric dimension");
    let client = OllamaEmbeddingClient::new(
        env_or("OLLAMA_URL", "http://127.0.0.1:11434"),
        env_or("EMBEDDING_MODEL", "nomic-embed-text"),
        dimension,
    )
    .expect("ollama client");

    let vectors = client
        .generate_embeddings(vec!["ragvault live embedding".to_string()])
        .await
        .expect("failed to request embeddings from provider");
    assert_eq!(vectors.len(), 1, "expected embedding per input chunk");
    assert_eq!(vectors[0].len(), dimension, "embedding dimension mismatch");
}
