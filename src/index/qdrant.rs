//! HTTP client wrapper for Qdrant acting as the vector index engine.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};
use uuid::Uuid;

use super::engine::VectorIndex;
use super::types::{
    EngineMatch, EnginePoint, IndexError, QueryResponse, QueryResponseResult, ScoreKind,
};

/// Qdrant engine; one collection per tenant namespace, cosine similarity.
pub struct QdrantIndex {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
}

impl QdrantIndex {
    /// Client for the Qdrant instance at `url`.
    pub fn new(url: &str, api_key: Option<String>) -> Result<Self, IndexError> {
        let client = Client::builder().user_agent("ragvault/0.1").build()?;
        let base_url = normalize_base_url(url).map_err(IndexError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            has_api_key = api_key.as_deref().is_some_and(|value| !value.is_empty()),
            "Initialized Qdrant HTTP client"
        );

        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            req = req.header("api-key", api_key);
        }
        req
    }

    async fn ensure_success(
        &self,
        namespace: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, IndexError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(IndexError::NamespaceNotFound(namespace.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        let error = IndexError::UnexpectedStatus { status, body };
        tracing::error!(collection = namespace, error = %error, "Qdrant request failed");
        Err(error)
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn score_kind(&self) -> ScoreKind {
        ScoreKind::Similarity
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool, IndexError> {
        let response = self
            .request(Method::GET, &format!("collections/{namespace}"))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                let error = IndexError::UnexpectedStatus { status, body };
                tracing::error!(collection = namespace, error = %error, "Collection existence check failed");
                Err(error)
            }
        }
    }

    async fn create_namespace(&self, namespace: &str, dimension: usize) -> Result<(), IndexError> {
        let body = json!({
            "vectors": {
                "size": dimension,
                "distance": "Cosine"
            }
        });

        let response = self
            .request(Method::PUT, &format!("collections/{namespace}"))
            .json(&body)
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            tracing::debug!(collection = namespace, "Collection already exists");
            return Ok(());
        }
        self.ensure_success(namespace, response).await?;
        tracing::debug!(collection = namespace, dimension, "Collection created");
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), IndexError> {
        let response = self
            .request(Method::DELETE, &format!("collections/{namespace}"))
            .send()
            .await?;
        self.ensure_success(namespace, response).await?;
        tracing::debug!(collection = namespace, "Collection deleted");
        Ok(())
    }

    async fn upsert(&self, namespace: &str, points: Vec<EnginePoint>) -> Result<(), IndexError> {
        if points.is_empty() {
            return Ok(());
        }

        let count = points.len();
        let serialized: Vec<Value> = points
            .into_iter()
            .map(|point| {
                json!({
                    "id": point.id.to_string(),
                    "vector": point.vector,
                    "payload": point.payload,
                })
            })
            .collect();

        let response = self
            .request(Method::PUT, &format!("collections/{namespace}/points"))
            .query(&[("wait", true)])
            .json(&json!({ "points": serialized }))
            .send()
            .await?;
        self.ensure_success(namespace, response).await?;
        tracing::debug!(collection = namespace, points = count, "Points upserted");
        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<EngineMatch>, IndexError> {
        let body = json!({
            "query": vector,
            "limit": top_k,
            "with_payload": true,
        });

        let response = self
            .request(
                Method::POST,
                &format!("collections/{namespace}/points/query"),
            )
            .json(&body)
            .send()
            .await?;
        let response = self.ensure_success(namespace, response).await?;

        let payload: QueryResponse = response.json().await?;
        let points = match payload.result {
            QueryResponseResult::Points(points) => points,
            QueryResponseResult::Object { points } => points,
        };
        points
            .into_iter()
            .map(|point| {
                Ok(EngineMatch {
                    id: parse_point_id(&point.id)?,
                    score: point.score,
                    payload: point.payload.unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn delete_points(&self, namespace: &str, ids: &[Uuid]) -> Result<(), IndexError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        let response = self
            .request(
                Method::POST,
                &format!("collections/{namespace}/points/delete"),
            )
            .query(&[("wait", true)])
            .json(&json!({ "points": ids }))
            .send()
            .await?;
        self.ensure_success(namespace, response).await?;
        Ok(())
    }
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

fn parse_point_id(id: &Value) -> Result<Uuid, IndexError> {
    let text = match id {
        Value::String(text) => text.as_str(),
        Value::Object(map) => map.get("uuid").and_then(Value::as_str).unwrap_or_default(),
        _ => "",
    };
    Uuid::parse_str(text).map_err(|_| IndexError::Malformed(format!("unexpected point id {id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{
        Method::{DELETE, GET, POST, PUT},
        MockServer,
    };
    use serde_json::Map;

    fn index_for(server: &MockServer, api_key: Option<&str>) -> QdrantIndex {
        QdrantIndex {
            client: Client::builder()
                .user_agent("ragvault-test")
                .build()
                .expect("client"),
            base_url: server.base_url(),
            api_key: api_key.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn query_emits_expected_request() {
        let server = MockServer::start_async().await;
        let id = Uuid::new_v4();

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/tenant_acme/points/query")
                    .header("api-key", "secret")
                    .json_body(json!({
                        "query": [0.5, 0.25],
                        "limit": 3,
                        "with_payload": true
                    }));
                then.status(200).json_body(json!({
                    "status": "ok",
                    "time": 0.0,
                    "result": {
                        "points": [
                            { "id": id.to_string(), "score": 0.42, "payload": { "sealed": "x" } }
                        ]
                    }
                }));
            })
            .await;

        let index = index_for(&server, Some("secret"));
        let hits = index
            .query("tenant_acme", &[0.5, 0.25], 3)
            .await
            .expect("query");

        mock.assert();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        assert!((hits[0].score - 0.42).abs() < f32::EPSILON);
        assert_eq!(hits[0].payload["sealed"], Value::String("x".into()));
    }

    #[tokio::test]
    async fn missing_collection_maps_to_namespace_not_found() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/collections/tenant_ghost/points/query");
                then.status(404).json_body(json!({
                    "status": { "error": "Not found: Collection `tenant_ghost` doesn't exist!" }
                }));
            })
            .await;

        let err = index_for(&server, None)
            .query("tenant_ghost", &[0.1], 5)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::NamespaceNotFound(name) if name == "tenant_ghost"));
    }

    #[tokio::test]
    async fn existence_check_distinguishes_missing_collections() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/tenant_acme");
                then.status(200).json_body(json!({ "result": {} }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/tenant_ghost");
                then.status(404);
            })
            .await;

        let index = index_for(&server, None);
        assert!(index.namespace_exists("tenant_acme").await.unwrap());
        assert!(!index.namespace_exists("tenant_ghost").await.unwrap());
    }

    #[tokio::test]
    async fn create_and_upsert_send_cosine_collection_and_points() {
        let server = MockServer::start_async().await;
        let create = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/collections/tenant_acme")
                    .json_body(json!({ "vectors": { "size": 2, "distance": "Cosine" } }));
                then.status(200).json_body(json!({ "result": true }));
            })
            .await;
        let upsert = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/collections/tenant_acme/points")
                    .query_param("wait", "true");
                then.status(200).json_body(json!({ "result": { "status": "completed" } }));
            })
            .await;

        let index = index_for(&server, None);
        index.create_namespace("tenant_acme", 2).await.unwrap();
        index
            .upsert(
                "tenant_acme",
                vec![EnginePoint {
                    id: Uuid::new_v4(),
                    vector: vec![1.0, 0.0],
                    payload: Map::new(),
                }],
            )
            .await
            .unwrap();

        create.assert();
        upsert.assert();
    }

    #[tokio::test]
    async fn server_errors_surface_status_and_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(DELETE).path("/collections/tenant_acme");
                then.status(500).body("boom");
            })
            .await;

        let err = index_for(&server, None)
            .delete_namespace("tenant_acme")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IndexError::UnexpectedStatus { status, ref body }
                if status == StatusCode::INTERNAL_SERVER_ERROR && body == "boom"
        ));
    }
}
