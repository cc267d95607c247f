//! HTTP surface for the vault.
//!
//! Compact Axum router over any [`VaultApi`] implementation:
//!
//! - `POST /documents` – Store an upload (`content` as text or `contentBase64`). Duplicate bytes
//!   return the existing document.
//! - `GET /documents/:id` – Document status, chunk count and last error.
//! - `DELETE /documents/:id` – Remove a document with its chunks and vectors.
//! - `POST /documents/:id/ingest` – Run the pipeline inline and return the outcome.
//! - `POST /documents/:id/enqueue` – Hand the document to the background worker (`202`).
//! - `POST /search` – Semantic search, with optional rerank and grounded answer.
//! - `GET /metrics` – Ingestion and search counters.
//! - `GET /health` – Liveness check.
//! - `GET /commands` – Machine-readable command catalog.
//!
//! Callers identify themselves with `x-tenant-id` (required) and `x-user-id`. An optional
//! `x-request-timeout-ms` bounds the request.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::context::RequestContext;
use crate::metrics::MetricsSnapshot;
use crate::models::{DocType, Document, DocumentStatus};
use crate::pipeline::{IngestError, IngestOutcome, WorkerError};
use crate::retrieval::{SearchError, SearchRequest, SearchResponse};
use crate::services::{EnqueueError, VaultApi};

const TENANT_HEADER: &str = "x-tenant-id";
const USER_HEADER: &str = "x-user-id";
const TIMEOUT_HEADER: &str = "x-request-timeout-ms";

/// Build the HTTP router exposing the vault API surface.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: VaultApi + 'static,
{
    Router::new()
        .route("/documents", post(upload_document::<S>))
        .route(
            "/documents/:id",
            get(get_document::<S>).delete(delete_document::<S>),
        )
        .route("/documents/:id/ingest", post(ingest_document::<S>))
        .route("/documents/:id/enqueue", post(enqueue_document::<S>))
        .route("/search", post(search::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .route("/health", get(health))
        .route("/commands", get(get_commands))
        .with_state(service)
}

fn request_context(headers: &HeaderMap) -> Result<RequestContext, AppError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let tenant = header(TENANT_HEADER)
        .ok_or_else(|| AppError::BadRequest(format!("missing {TENANT_HEADER} header")))?;
    let mut ctx = RequestContext::new(tenant);
    if let Some(user) = header(USER_HEADER) {
        ctx = ctx.with_user(user);
    }
    if let Some(raw) = header(TIMEOUT_HEADER) {
        let millis: u64 = raw
            .parse()
            .map_err(|_| AppError::BadRequest(format!("invalid {TIMEOUT_HEADER} header")))?;
        ctx = ctx.with_timeout(Duration::from_millis(millis));
    }
    Ok(ctx)
}

/// Request body for `POST /documents`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadRequest {
    filename: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    content_base64: Option<String>,
    /// Explicit type (`pdf`, `md`, ...); inferred from the file name otherwise.
    #[serde(default)]
    doc_type: Option<DocType>,
}

/// Document as returned over HTTP.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentView {
    id: Uuid,
    filename: String,
    doc_type: DocType,
    size_bytes: u64,
    status: DocumentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    retry_count: u32,
    chunk_count: usize,
    created_at: String,
    updated_at: String,
}

fn timestamp(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_default()
}

impl From<Document> for DocumentView {
    fn from(doc: Document) -> Self {
        Self {
            id: doc.id,
            filename: doc.filename,
            doc_type: doc.doc_type,
            size_bytes: doc.size_bytes,
            status: doc.status,
            error_message: doc.error_message,
            retry_count: doc.retry_count,
            chunk_count: doc.chunk_count,
            created_at: timestamp(doc.created_at),
            updated_at: timestamp(doc.updated_at),
        }
    }
}

#[derive(Serialize)]
struct UploadResponse {
    document: DocumentView,
    duplicate: bool,
}

async fn upload_document<S>(
    State(service): State<Arc<S>>,
    headers: HeaderMap,
    Json(request): Json<UploadRequest>,
) -> Result<(StatusCode, Json<UploadResponse>), AppError>
where
    S: VaultApi,
{
    let ctx = request_context(&headers)?;
    let bytes = match (request.content, request.content_base64) {
        (Some(text), None) => text.into_bytes(),
        (None, Some(encoded)) => BASE64
            .decode(encoded.trim())
            .map_err(|err| AppError::BadRequest(format!("invalid contentBase64: {err}")))?,
        _ => {
            return Err(AppError::BadRequest(
                "provide exactly one of content or contentBase64".into(),
            ));
        }
    };
    if request.filename.trim().is_empty() {
        return Err(AppError::BadRequest("filename must not be empty".into()));
    }

    let upload = service
        .upload(&ctx, &request.filename, request.doc_type, bytes)
        .await?;
    let status = if upload.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(UploadResponse {
            document: upload.document.into(),
            duplicate: upload.duplicate,
        }),
    ))
}

async fn get_document<S>(
    State(service): State<Arc<S>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<DocumentView>, AppError>
where
    S: VaultApi,
{
    let ctx = request_context(&headers)?;
    Ok(Json(service.document(&ctx, id).await?.into()))
}

async fn delete_document<S>(
    State(service): State<Arc<S>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError>
where
    S: VaultApi,
{
    let ctx = request_context(&headers)?;
    if service.delete(&ctx, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(IngestError::DocumentNotFound(id).into())
    }
}

async fn ingest_document<S>(
    State(service): State<Arc<S>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<IngestOutcome>, AppError>
where
    S: VaultApi,
{
    let ctx = request_context(&headers)?;
    Ok(Json(service.ingest(&ctx, id).await?))
}

async fn enqueue_document<S>(
    State(service): State<Arc<S>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError>
where
    S: VaultApi,
{
    let ctx = request_context(&headers)?;
    service.enqueue(&ctx, id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "documentId": id, "queued": true })),
    ))
}

async fn search<S>(
    State(service): State<Arc<S>>,
    headers: HeaderMap,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError>
where
    S: VaultApi,
{
    let ctx = request_context(&headers)?;
    Ok(Json(service.search(&ctx, request).await?))
}

async fn get_metrics<S>(State(service): State<Arc<S>>) -> Json<MetricsSnapshot>
where
    S: VaultApi,
{
    Json(service.metrics_snapshot())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct CommandDescriptor {
    name: &'static str,
    method: &'static str,
    path: &'static str,
    description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_example: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct CommandsResponse {
    commands: Vec<CommandDescriptor>,
}

async fn get_commands() -> Json<CommandsResponse> {
    Json(CommandsResponse {
        commands: vec![
            CommandDescriptor {
                name: "upload",
                method: "POST",
                path: "/documents",
                description: "Store a document for the calling tenant; identical bytes return the existing record.",
                request_example: Some(json!({
                    "filename": "handbook.md",
                    "content": "# Leave\n\nEmployees accrue two days per month."
                })),
            },
            CommandDescriptor {
                name: "document",
                method: "GET",
                path: "/documents/:id",
                description: "Return processing status, chunk count and the last error of a document.",
                request_example: None,
            },
            CommandDescriptor {
                name: "delete",
                method: "DELETE",
                path: "/documents/:id",
                description: "Delete a document together with its chunks and index vectors.",
                request_example: None,
            },
            CommandDescriptor {
                name: "ingest",
                method: "POST",
                path: "/documents/:id/ingest",
                description: "Extract, chunk, embed, encrypt and index a document inline.",
                request_example: None,
            },
            CommandDescriptor {
                name: "enqueue",
                method: "POST",
                path: "/documents/:id/enqueue",
                description: "Queue a document for background ingestion with retries.",
                request_example: None,
            },
            CommandDescriptor {
                name: "search",
                method: "POST",
                path: "/search",
                description: "Semantic search over the tenant's documents with optional rerank and answer.",
                request_example: Some(json!({
                    "query": "how many leave days",
                    "topK": 5,
                    "rerank": true,
                    "augment": false
                })),
            },
            CommandDescriptor {
                name: "metrics",
                method: "GET",
                path: "/metrics",
                description: "Return ingestion and search counters.",
                request_example: None,
            },
        ],
    })
}

enum AppError {
    BadRequest(String),
    Ingest(IngestError),
    Enqueue(EnqueueError),
    Search(SearchError),
}

fn ingest_status(err: &IngestError) -> StatusCode {
    match err {
        IngestError::DocumentNotFound(_) => StatusCode::NOT_FOUND,
        IngestError::Forbidden(_) => StatusCode::FORBIDDEN,
        IngestError::Extraction(_) | IngestError::EmptyContent(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        IngestError::InvalidTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn ingest_message(err: &IngestError) -> String {
    match err {
        IngestError::Forbidden(_) => "access denied".to_string(),
        other => other.to_string(),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Ingest(err) | Self::Enqueue(EnqueueError::Ingest(err)) => {
                (ingest_status(&err), ingest_message(&err))
            }
            Self::Enqueue(EnqueueError::Worker(err @ WorkerError::Stopped)) => {
                (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            Self::Search(err) => {
                let status = match &err {
                    SearchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                    SearchError::Forbidden => StatusCode::FORBIDDEN,
                    SearchError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                    SearchError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, err.to_string())
            }
        };
        if status.is_server_error() {
            tracing::error!(%status, error = %message, "Request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<IngestError> for AppError {
    fn from(inner: IngestError) -> Self {
        Self::Ingest(inner)
    }
}

impl From<EnqueueError> for AppError {
    fn from(inner: EnqueueError) -> Self {
        Self::Enqueue(inner)
    }
}

impl From<SearchError> for AppError {
    fn from(inner: SearchError) -> Self {
        Self::Search(inner)
    }
}
