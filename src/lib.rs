#![deny(missing_docs)]

//! Core library for the ragvault server: per-tenant encrypted document ingestion and
//! semantic retrieval.

/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Per-request identity, deadlines and authorization guards.
pub mod context;
/// Tenant keys, authenticated encryption and vector codecs.
pub mod crypto;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Text extraction from uploaded bytes.
pub mod extraction;
/// Answer generation over retrieved passages.
pub mod generation;
/// Vector index engines and the tenant namespace gateway.
pub mod index;
/// Structured logging and tracing setup.
pub mod logging;
/// Ingestion and search counters.
pub mod metrics;
/// Persisted entities.
pub mod models;
/// Document ingestion pipeline and background worker.
pub mod pipeline;
/// Text cleaning, layout tracking and chunking.
pub mod processing;
/// Query orchestration, reranking and answer synthesis.
pub mod retrieval;
/// Service wiring shared by the binary and tests.
pub mod services;
/// Raw blob storage for uploads.
pub mod storage;
/// Document, chunk and key persistence.
pub mod store;
