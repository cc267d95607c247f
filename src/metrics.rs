use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing ingestion and retrieval activity.
#[derive(Default)]
pub struct ServiceMetrics {
    documents_completed: AtomicU64,
    documents_failed: AtomicU64,
    chunks_indexed: AtomicU64,
    index_upsert_failures: AtomicU64,
    ingest_retries: AtomicU64,
    searches: AtomicU64,
    search_failures: AtomicU64,
    last_chunk_count: AtomicU64,
}

impl ServiceMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed document and the number of chunks persisted for it.
    pub fn record_document(&self, chunk_count: u64) {
        self.documents_completed.fetch_add(1, Ordering::Relaxed);
        self.chunks_indexed
            .fetch_add(chunk_count, Ordering::Relaxed);
        self.last_chunk_count.store(chunk_count, Ordering::Relaxed);
    }

    /// Record a document that ended in the `failed` state.
    pub fn record_failure(&self) {
        self.documents_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record index batches that could not be upserted.
    pub fn record_upsert_failures(&self, batches: u64) {
        self.index_upsert_failures
            .fetch_add(batches, Ordering::Relaxed);
    }

    /// Record a queued ingestion that is about to be retried.
    pub fn record_retry(&self) {
        self.ingest_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished search request.
    pub fn record_search(&self, succeeded: bool) {
        self.searches.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.search_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_completed: self.documents_completed.load(Ordering::Relaxed),
            documents_failed: self.documents_failed.load(Ordering::Relaxed),
            chunks_indexed: self.chunks_indexed.load(Ordering::Relaxed),
            index_upsert_failures: self.index_upsert_failures.load(Ordering::Relaxed),
            ingest_retries: self.ingest_retries.load(Ordering::Relaxed),
            searches: self.searches.load(Ordering::Relaxed),
            search_failures: self.search_failures.load(Ordering::Relaxed),
            last_chunk_count: self.last_chunk_count.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of service counters used for reporting.
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Documents that reached `completed` since startup.
    pub documents_completed: u64,
    /// Documents that ended in `failed` since startup.
    pub documents_failed: u64,
    /// Total chunk count persisted across all completed documents.
    pub chunks_indexed: u64,
    /// Index batches whose upsert failed (documents stay searchable via the chunk store).
    pub index_upsert_failures: u64,
    /// Queued ingestions that were re-attempted.
    pub ingest_retries: u64,
    /// Search requests served.
    pub searches: u64,
    /// Search requests that returned an error to the caller.
    pub search_failures: u64,
    /// Chunk count of the most recently completed document.
    pub last_chunk_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_documents_and_chunks() {
        let metrics = ServiceMetrics::new();
        metrics.record_document(2);
        metrics.record_document(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.documents_completed, 2);
        assert_eq!(snapshot.chunks_indexed, 5);
        assert_eq!(snapshot.last_chunk_count, 3);
    }

    #[test]
    fn search_failures_count_towards_total() {
        let metrics = ServiceMetrics::new();
        metrics.record_search(true);
        metrics.record_search(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.searches, 2);
        assert_eq!(snapshot.search_failures, 1);
    }

    #[test]
    fn snapshot_is_consistent() {
        let metrics = ServiceMetrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.documents_completed, 0);
        assert_eq!(snapshot.documents_failed, 0);
        assert_eq!(snapshot.index_upsert_failures, 0);
    }
}
